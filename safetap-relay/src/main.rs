/// Development relay standing in for the SafeTap realtime backend
///
/// Keeps named collections in memory, stores appended entries under fresh
/// ids and pushes a new snapshot to every subscriber of a collection when it
/// changes.
use anyhow::Result;
use clap::Parser;
use futures::{SinkExt, TryStreamExt};
use parking_lot::Mutex;
use safetap_protocol::{
    ClientFrame, ClientFrameCodec, Entry, Posted, ServerFrame, ServerFrameCodec,
};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::{
    io::WriteHalf,
    net::{TcpListener, TcpStream},
    sync::broadcast::{self, error::RecvError},
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};
use uuid::Uuid;

// Name of a collection that changed
type Change = String;
type Writer = FramedWrite<WriteHalf<TcpStream>, ServerFrameCodec>;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bind to this addr
    #[arg(short, long, default_value = "localhost:3000")]
    addr: String,
}

/// All collections, entries kept with their timestamp for ordering
#[derive(Debug, Default)]
struct Collections {
    entries: Mutex<HashMap<String, Vec<(i64, Entry)>>>,
}

impl Collections {
    fn append(&self, collection: &str, posted: Posted) -> String {
        let id = Uuid::new_v4().to_string();
        let timestamp = posted.timestamp;
        self.entries
            .lock()
            .entry(collection.to_string())
            .or_default()
            .push((timestamp, Entry::assign(id.clone(), posted)));
        id
    }

    // Latest `limit` entries, oldest first
    fn snapshot(&self, collection: &str, limit: usize) -> Vec<Entry> {
        let entries = self.entries.lock();
        let Some(entries) = entries.get(collection) else {
            return Vec::new();
        };
        let mut entries = entries.clone();
        entries.sort_by(|a, b| (a.0, &a.1.id).cmp(&(b.0, &b.1.id)));
        let skip = entries.len().saturating_sub(limit);
        entries.into_iter().skip(skip).map(|(_, entry)| entry).collect()
    }
}

// A client's interest in one collection
#[derive(Debug)]
struct Subscription {
    collection: String,
    limit: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let listener = TcpListener::bind(&args.addr).await?;
    info!(addr = %args.addr, "relay listening");
    let collections = Arc::new(Collections::default());
    let (change_tx, _change_rx) = broadcast::channel::<Change>(256);
    let client_id = AtomicUsize::from(0);

    loop {
        let (stream, addr) = listener.accept().await?;
        tokio::spawn(handle_client(
            client_id.fetch_add(1, Ordering::Relaxed),
            stream,
            addr,
            collections.clone(),
            change_tx.clone(),
            change_tx.subscribe(),
        ));
    }
}

async fn handle_client(
    client_id: usize,
    stream: TcpStream,
    addr: SocketAddr,
    collections: Arc<Collections>,
    change_tx: broadcast::Sender<Change>,
    mut change_rx: broadcast::Receiver<Change>,
) {
    info!(%addr, client_id, "client connected");
    let (rx, tx) = tokio::io::split(stream);
    let mut reader = FramedRead::new(rx, ClientFrameCodec::default());
    let mut writer = FramedWrite::new(tx, ServerFrameCodec::default());
    let mut subscriptions: HashMap<String, Subscription> = HashMap::new();
    let result: Result<()> = async {
        loop {
            tokio::select! {
                // Requests from the client
                maybe_frame = reader.try_next() => {
                    let Some(frame) = maybe_frame? else {
                        break;
                    };
                    match frame {
                        ClientFrame::Subscribe { reference, collection, limit } => {
                            debug!(client_id, %collection, limit, "subscribe");
                            let entries = collections.snapshot(&collection, limit);
                            writer.send(ServerFrame::snapshot_within_limit(&reference, entries)).await?;
                            subscriptions.insert(reference, Subscription { collection, limit });
                        }
                        ClientFrame::Append { reference, collection, posted } => {
                            if let Some(reason) = posted.refusal() {
                                debug!(client_id, reason, "append refused");
                                writer.send(ServerFrame::nack(reference, reason)).await?;
                            } else {
                                let id = collections.append(&collection, posted);
                                debug!(client_id, %collection, %id, "append");
                                writer.send(ServerFrame::ack(reference, id)).await?;
                                if let Err(e) = change_tx.send(collection) {
                                    warn!(%e, "relay error");
                                }
                            }
                        }
                        ClientFrame::Unsubscribe { reference } => {
                            subscriptions.remove(&reference);
                        }
                        ClientFrame::Leave => {
                            info!(client_id, "client left");
                            break;
                        }
                    }
                }

                // Push fresh snapshots for collections that changed
                maybe_change = change_rx.recv() => {
                    match maybe_change {
                        Ok(changed) => {
                            push_snapshots(&mut writer, &collections, &subscriptions, Some(&changed)).await?
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(client_id, skipped, "lagged, refreshing every subscription");
                            push_snapshots(&mut writer, &collections, &subscriptions, None).await?
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }
        Ok(())
    }
    .await;
    match result {
        Ok(()) => info!(client_id, "client disconnected"),
        Err(err) => warn!(client_id, %err, "client dropped"),
    }
}

// Sends a snapshot for every subscription on `changed`, or on every
// collection when `changed` is `None`
async fn push_snapshots(
    writer: &mut Writer,
    collections: &Collections,
    subscriptions: &HashMap<String, Subscription>,
    changed: Option<&str>,
) -> Result<()> {
    for (reference, subscription) in subscriptions {
        if changed.is_some_and(|changed| changed != subscription.collection) {
            continue;
        }
        let entries = collections.snapshot(&subscription.collection, subscription.limit);
        writer.send(ServerFrame::snapshot_within_limit(reference, entries)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::{handle_client, Collections};
    use futures::{SinkExt, StreamExt};
    use safetap_protocol::{
        ClientFrame, ClientFrameCodec, Posted, ServerFrame, ServerFrameCodec, MAX_TEXT_LEN,
    };
    use std::sync::Arc;
    use tokio::{
        net::{TcpListener, TcpStream},
        sync::broadcast,
    };
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[tokio::test]
    async fn test_oversized_append_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let collections = Arc::new(Collections::default());
        let (change_tx, _) = broadcast::channel(16);
        let relay = {
            let collections = collections.clone();
            tokio::spawn(async move {
                let (stream, addr) = listener.accept().await.unwrap();
                let change_rx = change_tx.subscribe();
                handle_client(0, stream, addr, collections, change_tx, change_rx).await;
            })
        };

        let (rx, tx) = tokio::io::split(TcpStream::connect(addr).await.unwrap());
        let mut reader = FramedRead::new(rx, ServerFrameCodec::default());
        let mut writer = FramedWrite::new(tx, ClientFrameCodec::default());
        let too_long = Posted::new("u1", None, "x".repeat(MAX_TEXT_LEN + 1), 1);
        writer.send(ClientFrame::append("r1", "chat", too_long)).await.unwrap();
        let reply = reader.next().await.unwrap().unwrap();
        assert_eq!(reply, ServerFrame::nack("r1", "text too long"));

        // The connection survives and later appends are stored
        writer
            .send(ClientFrame::append("r2", "chat", Posted::new("u1", None, "hi", 2)))
            .await
            .unwrap();
        let reply = reader.next().await.unwrap().unwrap();
        assert!(matches!(reply, ServerFrame::Ack { ref reference, .. } if reference == "r2"));
        assert_eq!(collections.snapshot("chat", 50).len(), 1);

        writer.send(ClientFrame::leave()).await.unwrap();
        relay.await.unwrap();
    }

    #[test]
    fn test_snapshot_keeps_latest_in_order() {
        let collections = Collections::default();
        for (text, timestamp) in [("b", 20), ("c", 30), ("a", 10)] {
            collections.append("chat", Posted::new("u1", None, text, timestamp));
        }
        collections.append("other", Posted::new("u1", None, "x", 5));

        let texts: Vec<_> = collections
            .snapshot("chat", 2)
            .into_iter()
            .map(|entry| entry.text)
            .collect();
        assert_eq!(texts, ["b", "c"]);
        assert_eq!(collections.snapshot("chat", 10)[0].timestamp, "10");
        assert!(collections.snapshot("missing", 10).is_empty());
    }
}
