//! Message feed for the SafeTap community chat
//!
//! The [`FeedController`] keeps one ordered, deduplicated sequence of chat
//! messages. It is fed by optimistic local sends and by snapshots from a
//! realtime [`RemoteChannel`], and it persists the sequence through a
//! [`MessageStore`] so the next start is warm. [`Presenter`] turns messages
//! into display rows.
use thiserror::Error;

mod controller;
mod feed;
mod identity;
mod model;
mod present;
pub mod remote;
mod settings;
mod store;
mod util;

pub use controller::{ConnectionStatus, FeedController, SubscriptionHandle};
pub use feed::Feed;
pub use identity::{Identity, IdentityProvider, StaticIdentity};
pub use model::{demo_seed, Message, NewEntry, Origin, RemoteEntry, RemoteTimestamp};
pub use present::{format_time, initials, Alignment, Presenter, Row};
pub use remote::{MemoryChannel, RemoteChannel, SnapshotStream, TcpChannel};
pub use settings::Settings;
pub use store::{FileStore, KeyValueStore, MemoryStore, MessageStore};
pub use util::{new_local_id, now_millis};

/// Failures of the feed. Everything except `Validation` and `TooLong` is
/// reported as a warning and never fails the calling operation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("message text is empty")]
    Validation,

    #[error("{field} longer than {max} bytes")]
    TooLong { field: &'static str, max: usize },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("remote backend unavailable: {0}")]
    RemoteInit(String),

    #[error("remote write failed: {0}")]
    RemoteWrite(String),

    #[error("remote subscription failed: {0}")]
    RemoteSubscribe(String),

    #[error("invalid timestamp: {0}")]
    Timestamp(String),
}
