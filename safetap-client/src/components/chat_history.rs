/// Prints chat rows as they appear in the feed
use safetap_feed::{Alignment, Row};
use std::collections::HashSet;

/// Remembers what has been printed so every message shows up once
///
/// A message changes id when the relay acknowledges it. A new row with the
/// label and text of a printed pending row whose id vanished is treated as
/// that same message.
#[derive(Debug, Default)]
pub struct ChatHistory {
    shown: HashSet<String>,
    pending: Vec<Row>,
}

impl ChatHistory {
    /// Lines to print for the current rows
    pub fn update(&mut self, rows: &[Row]) -> Vec<String> {
        let current: HashSet<&str> = rows.iter().map(|row| row.id.as_str()).collect();
        let mut lines = Vec::new();
        for row in rows {
            if !self.shown.insert(row.id.clone()) {
                if !row.pending {
                    self.pending.retain(|shown| shown.id != row.id);
                }
                continue;
            }
            let rekeyed = self.pending.iter().position(|shown| {
                !current.contains(shown.id.as_str())
                    && shown.label == row.label
                    && shown.text == row.text
            });
            match rekeyed {
                Some(index) if row.pending => self.pending[index] = row.clone(),
                Some(index) => {
                    self.pending.remove(index);
                }
                None => {
                    lines.push(decorate(row));
                    if row.pending {
                        self.pending.push(row.clone());
                    }
                }
            }
        }
        lines
    }
}

fn decorate(row: &Row) -> String {
    let marker = if row.pending { " (sending)" } else { "" };
    match row.alignment {
        Alignment::Own => format!("{:>8} {}: {}{}", row.time, row.label, row.text, marker),
        Alignment::Other => format!(
            "{:>8} [{}] {}: {}{}",
            row.time, row.initials, row.label, row.text, marker
        ),
    }
}
