//! Realtime backends the feed can subscribe to and write through
use crate::{
    model::{NewEntry, RemoteEntry},
    settings::Settings,
    Error,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::info;

mod memory;
mod tcp;

pub use memory::MemoryChannel;
pub use tcp::TcpChannel;

/// Stream of snapshots, each holding up to `limit` most recent entries
pub type SnapshotStream = BoxStream<'static, Result<Vec<RemoteEntry>, Error>>;

/// Subscription and write access to a named remote collection
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Starts delivering snapshots of `collection`. The first snapshot holds
    /// the current state; later ones follow every change. The stream ends or
    /// yields an error when the subscription drops.
    async fn subscribe(&self, collection: &str, limit: usize) -> Result<SnapshotStream, Error>;

    /// Appends an entry and returns the id the backend assigned to it
    async fn append(&self, collection: &str, entry: NewEntry) -> Result<String, Error>;
}

/// Connects to the relay named in `settings`
pub async fn connect(settings: &Settings) -> Result<TcpChannel, Error> {
    let addr = settings
        .remote_addr
        .as_deref()
        .ok_or_else(|| Error::RemoteInit("remote backend not configured".into()))?;
    info!(%addr, "connecting to relay");
    TcpChannel::connect(addr)
        .await
        .map_err(|e| Error::RemoteInit(format!("{addr}: {e}")))
}
