/// The message feed controller
use crate::{
    feed::Feed,
    model::{Message, Origin, RemoteEntry},
    remote::RemoteChannel,
    store::MessageStore,
    util::{new_local_id, now_millis},
    Error,
};
use futures::StreamExt;
use parking_lot::Mutex;
use safetap_protocol::{MAX_NAME_LEN, MAX_TEXT_LEN};
use std::sync::Arc;
use tokio::{
    runtime::Handle,
    sync::{broadcast, watch},
    task,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const WARNING_CAPACITY: usize = 64;

/// Connection state of the feed as shown to the user
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub enum ConnectionStatus {
    /// No snapshot subscription established yet
    Connecting,
    /// Snapshots are flowing
    Live,
    /// Remote side unavailable; only local state is shown
    Disconnected(String),
}

/// Cancels a snapshot subscription. Cancelling twice is harmless.
#[derive(Clone, Debug)]
pub struct SubscriptionHandle {
    token: CancellationToken,
}

impl SubscriptionHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct State {
    feed: Feed,
    // Target of remote writes, bound by `subscribe_remote`
    channel: Option<Arc<dyn RemoteChannel>>,
}

// Everything spawned tasks need to reach
struct Shared {
    state: Mutex<State>,
    store: MessageStore,
    collection: String,
    page_size: usize,
    view: watch::Sender<Vec<Message>>,
    status: watch::Sender<ConnectionStatus>,
    warnings: broadcast::Sender<Error>,
}

impl Shared {
    // Persists and publishes. Called with the state lock held so that store
    // writes happen in mutation order. Tasks reach it through `spawn_blocking`
    // since a file store syncs to disk.
    fn commit(&self, state: &State) {
        let messages = state.feed.messages();
        if let Err(err) = self.store.save(messages) {
            self.warn(err);
        }
        self.view.send_replace(messages.to_vec());
    }

    fn warn(&self, err: Error) {
        warn!(%err, "message feed warning");
        // Nobody listening is fine
        let _ = self.warnings.send(err);
    }

    fn disconnected(&self, err: Error) {
        self.status
            .send_replace(ConnectionStatus::Disconnected(err.to_string()));
        self.warn(err);
    }

    // Live subscriptions pass their token. The check happens under the state
    // lock, the same lock `subscribe_remote` and `teardown` cancel under, so
    // nothing merges after a cancel returns. Returns false once cancelled.
    fn apply_snapshot(&self, entries: Vec<RemoteEntry>, token: Option<&CancellationToken>) -> bool {
        let now = now_millis();
        let incoming: Vec<Message> = entries
            .into_iter()
            .filter_map(|entry| match entry.into_message(now) {
                Ok(message) => Some(message),
                Err(err) => {
                    self.warn(err);
                    None
                }
            })
            .collect();
        let mut state = self.state.lock();
        if token.is_some_and(CancellationToken::is_cancelled) {
            return false;
        }
        if state.feed.merge(incoming) {
            self.commit(&state);
        }
        true
    }

    fn publish_status(&self, token: &CancellationToken, status: ConnectionStatus) -> bool {
        let _state = self.state.lock();
        if token.is_cancelled() {
            return false;
        }
        self.status.send_replace(status);
        true
    }

    fn lost(&self, token: &CancellationToken, err: Error) {
        if self.publish_status(token, ConnectionStatus::Disconnected(err.to_string())) {
            self.warn(err);
        }
    }

    fn acknowledge(&self, local_id: &str, remote_id: &str) {
        let mut state = self.state.lock();
        if state.feed.rekey(local_id, remote_id) {
            debug!(%local_id, %remote_id, "write acknowledged");
            self.commit(&state);
        }
    }

    async fn follow(self: Arc<Self>, channel: Arc<dyn RemoteChannel>, token: CancellationToken) {
        let mut snapshots = match channel.subscribe(&self.collection, self.page_size).await {
            Ok(snapshots) => snapshots,
            Err(err) => return self.lost(&token, subscribe_error(err)),
        };
        if !self.publish_status(&token, ConnectionStatus::Live) {
            return;
        }
        info!(collection = %self.collection, "subscribed to remote feed");
        while let Some(snapshot) = snapshots.next().await {
            match snapshot {
                Ok(entries) => {
                    // Persisting may block on the disk
                    let shared = self.clone();
                    let live = token.clone();
                    let merged = task::spawn_blocking(move || {
                        shared.apply_snapshot(entries, Some(&live))
                    });
                    if !matches!(merged.await, Ok(true)) {
                        return;
                    }
                }
                Err(err) => return self.lost(&token, subscribe_error(err)),
            }
        }
        self.lost(&token, Error::RemoteSubscribe("subscription closed".into()));
    }
}

fn subscribe_error(err: Error) -> Error {
    match err {
        Error::RemoteSubscribe(_) => err,
        other => Error::RemoteSubscribe(other.to_string()),
    }
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), Error> {
    if value.len() > max {
        return Err(Error::TooLong { field, max });
    }
    Ok(())
}

fn write_error(err: Error) -> Error {
    match err {
        Error::RemoteWrite(_) => err,
        other => Error::RemoteWrite(other.to_string()),
    }
}

/// Single source of truth for the visible message sequence
///
/// Merges optimistic local sends with snapshots from a [`RemoteChannel`]
/// and persists every change to its [`MessageStore`]. All mutations are
/// serialized through one lock. Remote failures never fail an operation;
/// they become [warnings](FeedController::warnings) and status changes.
///
/// Remote work runs on Tokio tasks, so `send` and `subscribe_remote` must
/// be called from within a Tokio runtime.
pub struct FeedController {
    shared: Arc<Shared>,
    seed: Vec<Message>,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

impl FeedController {
    pub fn new(store: MessageStore, collection: impl Into<String>, page_size: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    feed: Feed::new(),
                    channel: None,
                }),
                store,
                collection: collection.into(),
                page_size,
                view: watch::channel(Vec::new()).0,
                status: watch::channel(ConnectionStatus::Connecting).0,
                warnings: broadcast::channel(WARNING_CAPACITY).0,
            }),
            seed: Vec::new(),
            subscription: Mutex::new(None),
        }
    }

    /// Content shown on the very first run, before anything was persisted
    pub fn with_seed(mut self, seed: Vec<Message>) -> Self {
        self.seed = seed;
        self
    }

    /// Loads the persisted sequence as the visible state
    ///
    /// Falls back to the seed when nothing was persisted and to an empty
    /// sequence when the store fails. A store failure is returned as a
    /// warning rather than an error.
    pub fn initialize(&self) -> Option<Error> {
        let (messages, first_run, warning) = match self.shared.store.load() {
            Ok(Some(messages)) => (messages, false, None),
            Ok(None) => (self.seed.clone(), true, None),
            Err(err) => (Vec::new(), false, Some(err)),
        };
        let mut state = self.shared.state.lock();
        state.feed = Feed::from_messages(messages);
        info!(messages = state.feed.len(), first_run, "message feed initialized");
        if first_run && !state.feed.is_empty() {
            self.shared.commit(&state);
        } else {
            self.shared.view.send_replace(state.feed.messages().to_vec());
        }
        drop(state);
        if let Some(err) = &warning {
            self.shared.warn(err.clone());
        }
        warning
    }

    /// Subscribes to `channel` and makes it the target of remote writes
    ///
    /// Any previous subscription of this controller is cancelled first.
    pub fn subscribe_remote(&self, channel: Arc<dyn RemoteChannel>) -> SubscriptionHandle {
        let handle = SubscriptionHandle {
            token: CancellationToken::new(),
        };
        {
            let mut state = self.shared.state.lock();
            let mut subscription = self.subscription.lock();
            if let Some(previous) = subscription.replace(handle.clone()) {
                previous.cancel();
            }
            state.channel = Some(channel.clone());
            self.shared.status.send_replace(ConnectionStatus::Connecting);
        }

        let token = handle.token.clone();
        let follow = self.shared.clone().follow(channel, token.clone());
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => debug!("remote subscription cancelled"),
                        _ = follow => {}
                    }
                });
            }
            Err(err) => self
                .shared
                .disconnected(Error::RemoteSubscribe(err.to_string())),
        }
        handle
    }

    /// Applies a snapshot from the remote side
    ///
    /// Normalizes timestamps, merges by id, reconciles pending entries and
    /// persists the result. Applying the same snapshot again changes nothing.
    pub fn on_snapshot(&self, entries: Vec<RemoteEntry>) {
        self.shared.apply_snapshot(entries, None);
    }

    /// Shows `text` immediately and writes it to the remote side
    ///
    /// Blank text, and text or sender fields longer than the relay stores,
    /// are rejected before anything changes. The returned message
    /// is the optimistic entry as it now appears in the sequence. The write
    /// runs in the background; its failure is reported as a warning and the
    /// entry stays pending. Without a bound channel the entry is local-only.
    pub fn send(&self, text: &str, sender_id: &str, sender_name: &str) -> Result<Message, Error> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::Validation);
        }
        let sender_name = Some(sender_name.trim())
            .filter(|name| !name.is_empty())
            .map(String::from);
        check_len("message text", text, MAX_TEXT_LEN)?;
        check_len("sender id", sender_id, MAX_NAME_LEN)?;
        check_len("sender name", sender_name.as_deref().unwrap_or_default(), MAX_NAME_LEN)?;

        let mut state = self.shared.state.lock();
        // Never older than this sender's previous message
        let now = now_millis();
        let timestamp = state
            .feed
            .latest_from(sender_id)
            .map_or(now, |latest| latest.max(now));
        let channel = state.channel.clone();
        let origin = match channel {
            Some(_) => Origin::LocalPending,
            None => Origin::LocalOnly,
        };
        let message = Message::new(
            new_local_id(),
            sender_id,
            sender_name,
            text,
            timestamp,
            origin,
        );
        state.feed.push(message.clone());
        self.shared.commit(&state);
        drop(state);

        if let Some(channel) = channel {
            self.dispatch(channel, &message);
        }
        Ok(message)
    }

    fn dispatch(&self, channel: Arc<dyn RemoteChannel>, message: &Message) {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => return self.shared.warn(Error::RemoteWrite(err.to_string())),
        };
        let shared = self.shared.clone();
        let local_id = message.id.clone();
        let entry = message.to_new_entry();
        runtime.spawn(async move {
            match channel.append(&shared.collection, entry).await {
                Ok(remote_id) => {
                    task::spawn_blocking(move || shared.acknowledge(&local_id, &remote_id));
                }
                Err(err) => shared.warn(write_error(err)),
            }
        });
    }

    /// Records that the remote side could not be set up
    ///
    /// Sends keep working in local-only mode until a channel is bound.
    pub fn mark_disconnected(&self, err: Error) {
        self.shared.state.lock().channel = None;
        self.shared.disconnected(err);
    }

    /// Cancels the active subscription. Writes already in flight continue.
    pub fn teardown(&self) {
        let _state = self.shared.state.lock();
        if let Some(handle) = self.subscription.lock().take() {
            handle.cancel();
        }
    }

    /// The visible sequence
    pub fn messages(&self) -> Vec<Message> {
        self.shared.state.lock().feed.messages().to_vec()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    /// Receives the visible sequence after every change
    pub fn watch_messages(&self) -> watch::Receiver<Vec<Message>> {
        self.shared.view.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Receives every warning raised after this call
    pub fn warnings(&self) -> broadcast::Receiver<Error> {
        self.shared.warnings.subscribe()
    }
}

impl Drop for FeedController {
    fn drop(&mut self) {
        self.teardown();
    }
}
