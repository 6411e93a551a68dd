/// Backend reached over TCP through the development relay
use super::{RemoteChannel, SnapshotStream};
use crate::{
    model::{NewEntry, RemoteEntry},
    Error,
};
use async_trait::async_trait;
use futures::{stream, SinkExt, StreamExt};
use parking_lot::Mutex;
use safetap_protocol::{ClientFrame, ClientFrameCodec, Posted, ServerFrame, ServerFrameCodec};
use std::{collections::HashMap, sync::Arc};
use tokio::{
    io::{ReadHalf, WriteHalf},
    net::{TcpStream, ToSocketAddrs},
    runtime::Handle,
    sync::{mpsc, oneshot, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};
use uuid::Uuid;

const CONNECTION_CLOSED: &str = "relay connection closed";

type Reader = FramedRead<ReadHalf<TcpStream>, ServerFrameCodec>;
type Writer = FramedWrite<WriteHalf<TcpStream>, ClientFrameCodec>;
type SnapshotSender = mpsc::UnboundedSender<Result<Vec<RemoteEntry>, Error>>;

// Where replies from the relay go, keyed by request reference
#[derive(Default)]
struct Routes {
    acks: HashMap<String, oneshot::Sender<Result<String, Error>>>,
    snapshots: HashMap<String, SnapshotSender>,
}

impl Routes {
    fn deliver(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::Snapshot { reference, entries } => {
                let delivered = match self.snapshots.get(&reference) {
                    Some(tx) => tx
                        .send(Ok(entries.into_iter().map(RemoteEntry::from).collect()))
                        .is_ok(),
                    None => {
                        debug!(%reference, "snapshot for unknown subscription");
                        return;
                    }
                };
                if !delivered {
                    self.snapshots.remove(&reference);
                }
            }
            ServerFrame::Ack { reference, id } => {
                if let Some(tx) = self.acks.remove(&reference) {
                    let _ = tx.send(Ok(id));
                }
            }
            ServerFrame::Nack { reference, reason } => {
                if let Some(tx) = self.acks.remove(&reference) {
                    let _ = tx.send(Err(Error::RemoteWrite(reason)));
                } else if let Some(tx) = self.snapshots.remove(&reference) {
                    let _ = tx.send(Err(Error::RemoteSubscribe(reason)));
                }
            }
        }
    }

    // Fails everything still waiting on the relay
    fn close(&mut self) {
        for (_, tx) in self.acks.drain() {
            let _ = tx.send(Err(Error::RemoteWrite(CONNECTION_CLOSED.into())));
        }
        for (_, tx) in self.snapshots.drain() {
            let _ = tx.send(Err(Error::RemoteSubscribe(CONNECTION_CLOSED.into())));
        }
    }
}

/// One connection to the relay, shared by any number of subscriptions and
/// writes
pub struct TcpChannel {
    writer: Arc<AsyncMutex<Writer>>,
    routes: Arc<Mutex<Routes>>,
    reader: JoinHandle<()>,
}

impl TcpChannel {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, safetap_protocol::Error> {
        let (rx, tx) = tokio::io::split(TcpStream::connect(addr).await?);
        let reader = FramedRead::new(rx, ServerFrameCodec::default());
        let writer = FramedWrite::new(tx, ClientFrameCodec::default());
        let routes = Arc::new(Mutex::new(Routes::default()));
        Ok(Self {
            writer: Arc::new(AsyncMutex::new(writer)),
            reader: tokio::spawn(dispatch(reader, routes.clone())),
            routes,
        })
    }

    /// Tells the relay this client is leaving
    pub async fn close(&self) -> Result<(), safetap_protocol::Error> {
        self.send(ClientFrame::leave()).await
    }

    async fn send(&self, frame: ClientFrame) -> Result<(), safetap_protocol::Error> {
        self.writer.lock().await.send(frame).await
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl RemoteChannel for TcpChannel {
    async fn subscribe(&self, collection: &str, limit: usize) -> Result<SnapshotStream, Error> {
        let reference = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().snapshots.insert(reference.clone(), tx);
        let frame = ClientFrame::subscribe(reference.clone(), collection, limit);
        if let Err(e) = self.send(frame).await {
            self.routes.lock().snapshots.remove(&reference);
            return Err(Error::RemoteSubscribe(e.to_string()));
        }
        let guard = Unsubscribe {
            reference,
            writer: self.writer.clone(),
            routes: self.routes.clone(),
        };
        let snapshots = stream::unfold((rx, guard), |(mut rx, guard)| async move {
            rx.recv().await.map(|item| (item, (rx, guard)))
        });
        Ok(snapshots.boxed())
    }

    async fn append(&self, collection: &str, entry: NewEntry) -> Result<String, Error> {
        let reference = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.routes.lock().acks.insert(reference.clone(), tx);
        let NewEntry {
            sender_id,
            sender_name,
            text,
            timestamp,
        } = entry;
        let posted = Posted::new(sender_id, sender_name, text, timestamp);
        if let Err(e) = self
            .send(ClientFrame::append(reference.clone(), collection, posted))
            .await
        {
            self.routes.lock().acks.remove(&reference);
            return Err(Error::RemoteWrite(e.to_string()));
        }
        rx.await
            .unwrap_or_else(|_| Err(Error::RemoteWrite(CONNECTION_CLOSED.into())))
    }
}

// Routes relay frames until the connection ends
async fn dispatch(mut reader: Reader, routes: Arc<Mutex<Routes>>) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(frame) => {
                trace!(reference = frame.reference(), "relay frame");
                routes.lock().deliver(frame)
            }
            Err(err) => {
                warn!(%err, "dropping relay connection");
                break;
            }
        }
    }
    routes.lock().close();
}

// Unsubscribes once the snapshot stream is dropped
struct Unsubscribe {
    reference: String,
    writer: Arc<AsyncMutex<Writer>>,
    routes: Arc<Mutex<Routes>>,
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.routes.lock().snapshots.remove(&self.reference);
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let writer = self.writer.clone();
        let frame = ClientFrame::unsubscribe(std::mem::take(&mut self.reference));
        runtime.spawn(async move {
            if let Err(err) = writer.lock().await.send(frame).await {
                debug!(%err, "unsubscribe not delivered");
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::TcpChannel;
    use crate::{
        model::{NewEntry, RemoteTimestamp},
        remote::RemoteChannel,
        Error,
    };
    use futures::{SinkExt, StreamExt};
    use safetap_protocol::{ClientFrame, ClientFrameCodec, Entry, ServerFrame, ServerFrameCodec};
    use tokio::net::TcpListener;
    use tokio_util::codec::{FramedRead, FramedWrite};

    fn new_entry(text: &str) -> NewEntry {
        NewEntry {
            sender_id: "u1".into(),
            sender_name: Some("Jane".into()),
            text: text.into(),
            timestamp: 1_000,
        }
    }

    // Answers one subscribe with an empty snapshot, acks the first append,
    // refuses the second and then hangs up
    async fn scripted_relay(listener: TcpListener) {
        let (stream, _) = listener.accept().await.unwrap();
        let (rx, tx) = tokio::io::split(stream);
        let mut reader = FramedRead::new(rx, ClientFrameCodec::default());
        let mut writer = FramedWrite::new(tx, ServerFrameCodec::default());
        let mut subscription = None;
        let mut appends = 0;
        while let Some(Ok(frame)) = reader.next().await {
            match frame {
                ClientFrame::Subscribe { reference, .. } => {
                    writer.send(ServerFrame::snapshot(&reference, vec![])).await.unwrap();
                    subscription = Some(reference);
                }
                ClientFrame::Append {
                    reference, posted, ..
                } if appends == 0 => {
                    appends += 1;
                    writer.send(ServerFrame::ack(reference, "r1")).await.unwrap();
                    let entry = Entry::assign("r1", posted);
                    let sub = subscription.clone().unwrap();
                    writer.send(ServerFrame::snapshot(sub, vec![entry])).await.unwrap();
                }
                ClientFrame::Append { reference, .. } => {
                    writer.send(ServerFrame::nack(reference, "full")).await.unwrap();
                    break;
                }
                ClientFrame::Unsubscribe { .. } | ClientFrame::Leave => break,
            }
        }
    }

    #[tokio::test]
    async fn test_round_trip_through_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = tokio::spawn(scripted_relay(listener));

        let channel = TcpChannel::connect(addr).await.unwrap();
        let mut snapshots = channel.subscribe("chat", 50).await.unwrap();
        assert!(snapshots.next().await.unwrap().unwrap().is_empty());

        assert_eq!(channel.append("chat", new_entry("hi")).await, Ok("r1".into()));
        let snapshot = snapshots.next().await.unwrap().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].text, "hi");
        assert_eq!(snapshot[0].timestamp, Some(RemoteTimestamp::Text("1000".into())));

        assert_eq!(
            channel.append("chat", new_entry("again")).await,
            Err(Error::RemoteWrite("full".into()))
        );
        relay.await.unwrap();

        // Relay hung up, so the subscription reports the drop and ends
        assert_eq!(
            snapshots.next().await,
            Some(Err(Error::RemoteSubscribe("relay connection closed".into())))
        );
        assert!(snapshots.next().await.is_none());
    }
}
