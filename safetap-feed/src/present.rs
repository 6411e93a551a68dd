/// Display rows for the visible sequence
use crate::model::{Message, Origin};
use time::{macros::format_description, OffsetDateTime, UtcOffset};

const PLACEHOLDER_INITIAL: &str = "U";
const OWN_LABEL: &str = "You";
const UNKNOWN_SENDER: &str = "Stranger";
const UNKNOWN_TIME: &str = "--:--";

/// Which side of the conversation a row sits on
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum Alignment {
    Own,
    Other,
}

/// Everything a UI needs to draw one message
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct Row {
    pub id: String,
    pub alignment: Alignment,
    pub label: String,
    pub initials: String,
    pub text: String,
    pub time: String,
    pub pending: bool,
}

/// Maps messages to rows for one viewer
#[derive(Clone, Debug)]
pub struct Presenter {
    viewer_id: String,
    offset: UtcOffset,
}

impl Presenter {
    pub fn new(viewer_id: impl Into<String>, offset: UtcOffset) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            offset,
        }
    }

    pub fn row(&self, message: &Message) -> Row {
        let own = message.sender_id == self.viewer_id;
        let label = if own {
            OWN_LABEL.to_string()
        } else {
            message
                .sender_name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN_SENDER.to_string())
        };
        Row {
            id: message.id.clone(),
            alignment: if own { Alignment::Own } else { Alignment::Other },
            label,
            initials: initials(message.sender_name.as_deref()),
            text: message.text.clone(),
            time: format_time(message.timestamp, self.offset),
            pending: message.origin != Origin::RemoteConfirmed,
        }
    }

    pub fn rows(&self, messages: &[Message]) -> Vec<Row> {
        messages.iter().map(|message| self.row(message)).collect()
    }
}

/// First letters of the first and last word, uppercased
pub fn initials(name: Option<&str>) -> String {
    let mut words = name.unwrap_or_default().split_whitespace();
    let Some(first) = words.next() else {
        return PLACEHOLDER_INITIAL.to_string();
    };
    let mut letters: String = first.chars().take(1).flat_map(char::to_uppercase).collect();
    if let Some(last) = words.last() {
        letters.extend(last.chars().take(1).flat_map(char::to_uppercase));
    }
    letters
}

/// Hour and minute of an epoch millisecond timestamp at `offset`, on a 12
/// hour clock with zero padded hours (`09:05 AM`)
pub fn format_time(millis: i64, offset: UtcOffset) -> String {
    let format = format_description!("[hour repr:12]:[minute] [period]");
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .ok()
        .and_then(|ts| ts.to_offset(offset).format(format).ok())
        .unwrap_or_else(|| UNKNOWN_TIME.to_string())
}

#[cfg(test)]
mod test {
    use super::{format_time, initials, Alignment, Presenter};
    use crate::model::{Message, Origin};
    use time::{macros::offset, UtcOffset};

    #[test]
    fn test_initials() {
        #[rustfmt::skip]
        let tests = vec![
            (Some("John Doe"), "JD"),
            (Some("Madonna"), "M"),
            (Some("  mary   ann  lee "), "ML"),
            (Some("élodie durand"), "ÉD"),
            (Some(""), "U"),
            (Some("   "), "U"),
            (None, "U"),
        ];
        for (name, expected) in tests {
            assert_eq!(initials(name), expected, "{name:?}");
        }
    }

    #[test]
    fn test_format_time() {
        // 2023-11-14T22:13:20Z
        let ts = 1_700_000_000_000;
        assert_eq!(format_time(ts, UtcOffset::UTC), "10:13 PM");
        assert_eq!(format_time(ts, offset!(+2)), "12:13 AM");
        assert_eq!(format_time(ts - 13 * 3_600_000, UtcOffset::UTC), "09:13 AM");
        assert_eq!(format_time(i64::MAX, UtcOffset::UTC), "--:--");
    }

    #[test]
    fn test_rows() {
        let presenter = Presenter::new("me", UtcOffset::UTC);
        let messages = vec![
            Message::new("1", "me", Some("Jane Smith".into()), "hi", 0, Origin::LocalPending),
            Message::new("2", "them", Some("John Doe".into()), "yo", 0, Origin::RemoteConfirmed),
            Message::new("3", "them", None, "psst", 0, Origin::RemoteConfirmed),
        ];
        let rows = presenter.rows(&messages);

        assert_eq!(rows[0].alignment, Alignment::Own);
        assert_eq!(rows[0].label, "You");
        assert_eq!(rows[0].initials, "JS");
        assert!(rows[0].pending);

        assert_eq!(rows[1].alignment, Alignment::Other);
        assert_eq!(rows[1].label, "John Doe");
        assert_eq!(rows[1].initials, "JD");
        assert_eq!(rows[1].time, "12:00 AM");
        assert!(!rows[1].pending);

        assert_eq!(rows[2].label, "Stranger");
        assert_eq!(rows[2].initials, "U");
    }

    #[test]
    fn test_rows_are_deterministic() {
        let presenter = Presenter::new("me", offset!(-5));
        let message = Message::new("1", "x", Some("A B".into()), "t", 123_456, Origin::LocalOnly);
        assert_eq!(presenter.row(&message), presenter.row(&message));
    }
}
