/// Model definition for entries carried between client and relay

/// Longest message text, in bytes, the relay stores
pub const MAX_TEXT_LEN: usize = 8 * 1024;

/// Longest sender id or sender name, in bytes
pub const MAX_NAME_LEN: usize = 128;

/// Entry as written by a client, before the relay assigns it an id
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct Posted {
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub text: String,
    /// Epoch milliseconds chosen by the sender
    pub timestamp: i64,
}

impl Posted {
    pub fn new(
        sender_id: impl Into<String>,
        sender_name: Option<String>,
        text: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            sender_name,
            text: text.into(),
            timestamp,
        }
    }

    /// Why the relay refuses to store this entry, if it does
    ///
    /// The limits keep a full page of entries inside one frame.
    pub fn refusal(&self) -> Option<&'static str> {
        let name_len = self.sender_name.as_deref().map_or(0, str::len);
        if self.text.trim().is_empty() {
            Some("empty text")
        } else if self.text.len() > MAX_TEXT_LEN {
            Some("text too long")
        } else if self.sender_id.len() > MAX_NAME_LEN || name_len > MAX_NAME_LEN {
            Some("sender too long")
        } else {
            None
        }
    }
}

/// Entry as stored by the relay and delivered inside snapshots
///
/// The timestamp is kept in its textual form; clients accept either epoch
/// milliseconds or RFC 3339 and normalize on their side.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct Entry {
    pub id: String,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub text: String,
    pub timestamp: String,
}

impl Entry {
    pub fn new(
        id: impl Into<String>,
        sender_id: impl Into<String>,
        sender_name: Option<String>,
        text: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            sender_id: sender_id.into(),
            sender_name,
            text: text.into(),
            timestamp: timestamp.into(),
        }
    }

    /// Stores a posted entry under the id assigned by the relay
    pub fn assign(id: impl Into<String>, posted: Posted) -> Self {
        let Posted {
            sender_id,
            sender_name,
            text,
            timestamp,
        } = posted;
        Self {
            id: id.into(),
            sender_id,
            sender_name,
            text,
            timestamp: timestamp.to_string(),
        }
    }
}
