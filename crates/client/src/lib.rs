//! Aerolink Client
//!
//! Real-time session synchronization over one persistent connection:
//! request/response RPC multiplexed with server pushes, a subscription
//! registry, an optimistic session-state cache, and a coordinator for
//! mid-prompt permission decisions.
//!
//! Start with [`Client`].

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod permissions;
pub mod rpc;
pub mod services;
pub mod session_state;
pub mod sessions;
pub mod subscriptions;
pub mod transport;

pub use client::Client;
pub use config::ClientConfig;
pub use connection::{ConnectionState, ConnectionStatus};
pub use error::{ClientError, Result};
pub use permissions::{PermissionRequest, PermissionState};
pub use services::{TerminalEvent, TerminalStream};
pub use session_state::{ChatEntry, EntryOrigin, SessionChange, SessionEvent, SessionSnapshot};
pub use subscriptions::{SessionSubscription, SubscriptionStatus};
pub use transport::{memory_pair, Connector, MemoryConnector, MemoryListener, MemoryPeer, WsConnector};
