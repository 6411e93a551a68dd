/// Data model of the message feed
use crate::{identity::Identity, Error};
use safetap_protocol::Entry;
use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Where a message currently stands with respect to the remote backend
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    /// Sent optimistically, waiting for a snapshot to confirm it
    LocalPending,
    /// Seen in a snapshot from the remote backend
    RemoteConfirmed,
    /// Created while no remote backend was available; never confirmed
    LocalOnly,
}

/// One chat entry of the visible sequence
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub text: String,
    /// Epoch milliseconds, the sort key of the sequence
    pub timestamp: i64,
    pub origin: Origin,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        sender_id: impl Into<String>,
        sender_name: Option<String>,
        text: impl Into<String>,
        timestamp: i64,
        origin: Origin,
    ) -> Self {
        Self {
            id: id.into(),
            sender_id: sender_id.into(),
            sender_name,
            text: text.into(),
            timestamp,
            origin,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.origin == Origin::LocalPending
    }

    /// True when `other` carries the same content from the same sender
    /// within the same second. Used to pair an optimistic entry with its
    /// confirmed copy before the server id is known.
    pub fn same_content(&self, other: &Message) -> bool {
        self.sender_id == other.sender_id
            && self.text == other.text
            && second_bucket(self.timestamp) == second_bucket(other.timestamp)
    }

    /// The payload written to the remote backend for this message
    pub fn to_new_entry(&self) -> NewEntry {
        NewEntry {
            sender_id: self.sender_id.clone(),
            sender_name: self.sender_name.clone(),
            text: self.text.clone(),
            timestamp: self.timestamp,
        }
    }
}

// Rounds to the nearest whole second
fn second_bucket(millis: i64) -> i64 {
    millis.saturating_add(500).div_euclid(1000)
}

/// Timestamp as delivered by a remote backend
///
/// Backends hand out either raw epoch milliseconds, a `{seconds, nanos}`
/// timestamp object or text. Text may hold epoch milliseconds or RFC 3339.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteTimestamp {
    Millis(i64),
    Platform { seconds: i64, nanos: u32 },
    Text(String),
}

impl RemoteTimestamp {
    /// Normalizes to epoch milliseconds
    pub fn to_millis(&self) -> Result<i64, Error> {
        match self {
            Self::Millis(millis) => Ok(*millis),
            Self::Platform { seconds, nanos } => seconds
                .checked_mul(1000)
                .and_then(|millis| millis.checked_add(i64::from(*nanos / 1_000_000)))
                .ok_or_else(|| Error::Timestamp(format!("{seconds}s {nanos}ns"))),
            Self::Text(text) => {
                let text = text.trim();
                if let Ok(millis) = text.parse::<i64>() {
                    return Ok(millis);
                }
                OffsetDateTime::parse(text, &Rfc3339)
                    .map(|ts| (ts.unix_timestamp_nanos() / 1_000_000) as i64)
                    .map_err(|_| Error::Timestamp(text.to_string()))
            }
        }
    }
}

/// Entry as delivered inside a snapshot, before normalization
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub text: String,
    #[serde(default)]
    pub timestamp: Option<RemoteTimestamp>,
}

impl RemoteEntry {
    pub fn new(
        id: impl Into<String>,
        sender_id: impl Into<String>,
        sender_name: Option<String>,
        text: impl Into<String>,
        timestamp: RemoteTimestamp,
    ) -> Self {
        Self {
            id: id.into(),
            sender_id: sender_id.into(),
            sender_name,
            text: text.into(),
            timestamp: Some(timestamp),
        }
    }

    /// Converts into a confirmed message. A missing timestamp becomes `now`.
    pub fn into_message(self, now: i64) -> Result<Message, Error> {
        let timestamp = match &self.timestamp {
            Some(ts) => ts.to_millis()?,
            None => now,
        };
        Ok(Message {
            id: self.id,
            sender_id: self.sender_id,
            sender_name: self.sender_name.filter(|name| !name.trim().is_empty()),
            text: self.text,
            timestamp,
            origin: Origin::RemoteConfirmed,
        })
    }
}

impl From<Entry> for RemoteEntry {
    fn from(value: Entry) -> Self {
        let Entry {
            id,
            sender_id,
            sender_name,
            text,
            timestamp,
        } = value;
        Self {
            id,
            sender_id,
            sender_name,
            text,
            timestamp: Some(timestamp)
                .filter(|ts| !ts.trim().is_empty())
                .map(RemoteTimestamp::Text),
        }
    }
}

/// Payload of a remote write
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEntry {
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub text: String,
    pub timestamp: i64,
}

/// First-run demo content, shown until anything has been persisted
pub fn demo_seed(viewer: &Identity, now: i64) -> Vec<Message> {
    const MINUTE: i64 = 60_000;
    let seed = |n: u32, sender: &Identity, text: &str, minutes_ago: i64| {
        Message::new(
            format!("demo-{n}"),
            sender.id.clone(),
            Some(sender.name.clone()),
            text,
            now - minutes_ago * MINUTE,
            Origin::LocalOnly,
        )
    };
    let john = Identity::new("demo-john", "John Doe");
    let jane = Identity::new("demo-jane", "Jane Smith");
    vec![
        seed(1, &john, "Hey everyone! How is everyone doing?", 5),
        seed(2, viewer, "I'm doing great! Just finished the project.", 3),
        seed(3, &jane, "That's awesome! Can you share the details?", 2),
        seed(4, viewer, "Sure! I'll send it over shortly.", 0),
    ]
}
