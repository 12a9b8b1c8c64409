//! Event Record & Parser (§4.2). Parsing is a pure function from a raw
//! line to an [`Event`]; an `Event` is immutable after construction.

use crate::error::{self, ParseError};
use crate::types::Guid;
use indexmap::IndexMap;
use snafu::ensure;
use std::time::{SystemTime, UNIX_EPOCH};

/// The four event header characters recognised by the buffer (§4.1).
pub const HEADER_NOTIFY: char = '!';
pub const HEADER_NOMATCH: char = '?';
pub const HEADER_ATTACH: char = '+';
pub const HEADER_DETACH: char = '-';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Notify,
    Nomatch,
    Attach,
    Detach,
}

impl EventType {
    fn from_header(c: char) -> Result<Self, ParseError> {
        match c {
            HEADER_NOTIFY => Ok(EventType::Notify),
            HEADER_NOMATCH => Ok(EventType::Nomatch),
            HEADER_ATTACH => Ok(EventType::Attach),
            HEADER_DETACH => Ok(EventType::Detach),
            other => error::UnknownEventType { header: other }.fail(),
        }
    }
}

/// Classification of a [`Event`] as used by the Case File (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    SoftError,
    DeviceGone,
    VdevRemoved,
    Ignored,
}

/// An immutable parsed event: header type, ordered key/value map, and
/// the original raw line it was parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventType,
    pub kv: IndexMap<String, String>,
    pub raw: String,
}

impl Event {
    /// Well-known accessors used throughout the Case Engine.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.kv.get(key).map(String::as_str)
    }

    pub fn class(&self) -> Option<&str> {
        self.get("class")
    }

    pub fn pool_guid(&self) -> Option<Guid> {
        self.get("pool_guid").and_then(|v| v.parse().ok())
    }

    pub fn vdev_guid(&self) -> Option<Guid> {
        self.get("vdev_guid").and_then(|v| v.parse().ok())
    }

    /// `Event::timestamp()` — the `timestamp` field parsed as seconds
    /// since the epoch. Fails if the field is absent (it is injected by
    /// the Event Buffer at parse time, so this should not happen for
    /// events that passed through `extract_event`).
    pub fn timestamp(&self) -> Option<u64> {
        self.get("timestamp").and_then(|v| v.parse().ok())
    }

    /// Classification per §4.5's event-classification rules.
    pub fn classify(&self) -> Classification {
        match self.class() {
            Some("ereport.fs.zfs.io") | Some("ereport.fs.zfs.checksum") => {
                Classification::SoftError
            }
            Some("resource.fs.zfs.removed") => Classification::DeviceGone,
            _ => {
                if self.get("type") == Some("misc.fs.zfs.vdev_remove") {
                    Classification::VdevRemoved
                } else {
                    Classification::Ignored
                }
            }
        }
    }

    /// Re-serialise this event back to its raw-line form, used when
    /// writing committed/tentative buckets to disk (§4.6). The `raw`
    /// field already carries this text (including the trailing
    /// newline), so this is a straight clone; kept as a named method so
    /// call sites read intention rather than reaching into a field.
    pub fn to_line(&self) -> String {
        self.raw.clone()
    }
}

/// Parse a single line (without requiring a trailing newline) into an
/// [`Event`]. `now` supplies the injected timestamp when the line lacks
/// one; callers reading from the live Event Buffer pass the buffer's own
/// clock read, callers replaying from disk pass the original event's
/// recorded time where available, falling back to the current time.
pub fn parse(line: &str, now: impl FnOnce() -> u64) -> Result<Event, ParseError> {
    let line = line.trim_end_matches('\n').trim_end_matches('\r');
    let mut chars = line.chars();
    let header = chars.next().ok_or_else(|| {
        error::InvalidFormat {
            reason: "empty line".to_string(),
        }
        .build()
    })?;
    let kind = EventType::from_header(header)?;
    if kind == EventType::Nomatch {
        return error::DiscardedEventType.fail();
    }

    let rest = chars.as_str();
    let mut kv = IndexMap::new();
    let mut cursor = rest;

    if matches!(kind, EventType::Attach | EventType::Detach) {
        let (device_name, after) = take_token(cursor);
        ensure!(
            !device_name.is_empty(),
            error::InvalidFormat {
                reason: "missing device-name".to_string(),
            }
        );
        let after = after.trim_start();
        let after = after.strip_prefix("at ").map(str::trim_start).unwrap_or(after);
        let parent_marker = " on ";
        let parent = if let Some(pos) = after.find(parent_marker) {
            let (_, tail) = after.split_at(pos + parent_marker.len());
            let (parent_token, tail) = take_token(tail);
            ensure!(
                !parent_token.is_empty(),
                error::InvalidFormat {
                    reason: "missing parent after 'on'".to_string(),
                }
            );
            cursor = tail;
            Some(parent_token.to_string())
        } else {
            cursor = after;
            None
        };
        kv.insert("device-name".to_string(), device_name.to_string());
        if let Some(parent) = parent {
            kv.insert("parent".to_string(), parent);
        }
    }

    for token in cursor.split_whitespace() {
        let eq = token.find('=').ok_or_else(|| {
            error::InvalidFormat {
                reason: format!("expected key=value, got '{}'", token),
            }
            .build()
        })?;
        let (key, value) = token.split_at(eq);
        let value = &value[1..];
        ensure!(
            !key.is_empty() && !value.contains('='),
            error::InvalidFormat {
                reason: format!("stray '=' in token '{}'", token),
            }
        );
        kv.insert(key.to_string(), value.to_string());
    }

    if !kv.contains_key("system") {
        kv.insert("system".to_string(), "none".to_string());
    }
    if !kv.contains_key("timestamp") {
        kv.insert("timestamp".to_string(), now().to_string());
    }

    let mut raw = line.to_string();
    raw.push('\n');
    Ok(Event { kind, kv, raw })
}

/// Seconds since the epoch, used as the default clock for `parse`.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn take_token(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(idx) => (&s[..idx], &s[idx..]),
        None => (s, ""),
    }
}
