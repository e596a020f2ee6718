//! Transport seam.
//!
//! A [`Connector`] opens a [`Link`]: a sink of outbound text frames and a
//! stream of inbound ones. The connection manager never sees sockets, only
//! links, so the same client runs over a WebSocket or an in-process channel.

use std::pin::Pin;

use futures::channel::mpsc;
use futures::future::{self, BoxFuture};
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::error::{ClientError, Result};

pub type FrameSink = Pin<Box<dyn Sink<String, Error = ClientError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// One open connection, split into its two directions.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Link {
    pub fn new<S, T>(sink: S, stream: T) -> Self
    where
        S: Sink<String, Error = ClientError> + Send + 'static,
        T: Stream<Item = Result<String>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Link>>;
}

// -- WebSocket ---------------------------------------------------------------

/// Connects with `tokio-tungstenite`. Text and UTF-8 binary frames are
/// delivered; control frames are handled by tungstenite itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Link>> {
        let url = url.to_string();
        async move {
            let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| ClientError::Connection(format!("{url}: {e}")))?;
            let (ws_sink, ws_stream) = socket.split();

            let sink = ws_sink
                .sink_map_err(|e| ClientError::Connection(e.to_string()))
                .with(|frame: String| future::ready(Ok::<_, ClientError>(Message::text(frame))));

            let stream = ws_stream.filter_map(|message| {
                future::ready(match message {
                    Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => Some(Ok(text)),
                        Err(_) => {
                            debug!(
                                component = "transport",
                                event = "transport.frame.non_utf8",
                                "Dropping non-UTF-8 binary frame"
                            );
                            None
                        }
                    },
                    Ok(_) => None,
                    Err(e) => Some(Err(ClientError::Connection(e.to_string()))),
                })
            });

            Ok(Link::new(sink, stream))
        }
        .boxed()
    }
}

// -- In-process --------------------------------------------------------------

/// Create a connected connector/listener pair. Every `connect` on the
/// connector yields a fresh [`MemoryPeer`] from the listener.
pub fn memory_pair() -> (MemoryConnector, MemoryListener) {
    let (incoming_tx, incoming_rx) = mpsc::unbounded();
    (
        MemoryConnector {
            incoming: incoming_tx,
        },
        MemoryListener {
            incoming: incoming_rx,
        },
    )
}

#[derive(Clone)]
pub struct MemoryConnector {
    incoming: mpsc::UnboundedSender<MemoryPeer>,
}

impl Connector for MemoryConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Link>> {
        let (to_server_tx, to_server_rx) = mpsc::unbounded::<String>();
        let (to_client_tx, to_client_rx) = mpsc::unbounded::<String>();
        let peer = MemoryPeer {
            url: url.to_string(),
            outbound: to_client_tx,
            inbound: to_server_rx,
        };

        let result = self
            .incoming
            .unbounded_send(peer)
            .map_err(|_| ClientError::Connection(format!("nothing is listening at {url}")))
            .map(|()| {
                Link::new(
                    to_server_tx.sink_map_err(|_| ClientError::ConnectionLost),
                    to_client_rx.map(Ok::<String, ClientError>),
                )
            });
        future::ready(result).boxed()
    }
}

pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryListener {
    /// Wait for the next client link. `None` once every connector is gone.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.next().await
    }
}

/// Server end of an in-process link. Dropping it closes the link.
pub struct MemoryPeer {
    url: String,
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Push a frame to the client. `false` once the client side is gone.
    pub fn send(&self, frame: impl Into<String>) -> bool {
        self.outbound.unbounded_send(frame.into()).is_ok()
    }

    /// Next frame from the client. `None` once the client closed the link.
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.next().await
    }
}
