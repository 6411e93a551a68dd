/// Line-mode SafeTap chat: stdin lines are sent, feed changes are printed
use crate::components::chat_history::ChatHistory;
use anyhow::Result;
use safetap_feed::{
    demo_seed, now_millis, remote, ConnectionStatus, Error, FeedController, FileStore,
    IdentityProvider, MessageStore, Presenter, Settings, StaticIdentity,
};
use std::sync::Arc;
use time::UtcOffset;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

fn describe(status: &ConnectionStatus) -> String {
    match status {
        ConnectionStatus::Connecting => "-- connecting...".to_string(),
        ConnectionStatus::Live => "-- chat live".to_string(),
        ConnectionStatus::Disconnected(reason) => format!("-- disconnected: {reason}"),
    }
}

pub async fn run(settings: Settings, name: Option<String>) -> Result<()> {
    let mut identity = StaticIdentity::resolve(settings.auth_uid.as_deref()).identity();
    if let Some(name) = name {
        identity.name = name;
    }
    info!(id = %identity.id, name = %identity.name, "chatting as");

    let store = MessageStore::new(
        FileStore::open(&settings.storage)?,
        settings.storage_key.clone(),
    );
    let controller = FeedController::new(store, settings.collection_path(), settings.page_size)
        .with_seed(demo_seed(&identity, now_millis()));
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let presenter = Presenter::new(identity.id.clone(), offset);
    controller.initialize();

    let channel = match remote::connect(&settings).await {
        Ok(channel) => {
            let channel = Arc::new(channel);
            controller.subscribe_remote(channel.clone());
            Some(channel)
        }
        Err(err) => {
            controller.mark_disconnected(err);
            None
        }
    };

    let mut history = ChatHistory::default();
    let mut view = controller.watch_messages();
    let mut status = controller.watch_status();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("{}", describe(&status.borrow_and_update()));
    let rows = presenter.rows(&view.borrow_and_update());
    for line in history.update(&rows) {
        println!("{line}");
    }

    loop {
        tokio::select! {
            // render feed changes
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let rows = presenter.rows(&view.borrow_and_update());
                for line in history.update(&rows) {
                    println!("{line}");
                }
            }

            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("{}", describe(&status.borrow_and_update()));
            }

            // turn input lines into sends
            maybe_line = lines.next_line() => {
                let Some(line) = maybe_line? else {
                    break;
                };
                match controller.send(&line, &identity.id, &identity.name) {
                    Ok(_) | Err(Error::Validation) => {}
                    Err(err) => warn!(%err, "send failed"),
                }
            }

            _ = tokio::signal::ctrl_c() => break,
        }
    }

    controller.teardown();
    if let Some(channel) = channel {
        if let Err(err) = channel.close().await {
            warn!(%err, "could not say goodbye to relay");
        }
    }
    Ok(())
}
