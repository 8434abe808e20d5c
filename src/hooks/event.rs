//! Push events handed to post-receive hooks.

use std::fmt;
use std::str::FromStr;

use crate::store::{RefSnapshot, HEADS_PREFIX};

/// Placeholder previous id used when the real id is not tracked.
pub const SENTINEL_PREVIOUS: &str = "unknown";
/// Placeholder new id used when the real id is not tracked.
pub const SENTINEL_NEW: &str = "current";
/// Object id git uses for "no object" (ref creation / deletion).
pub const ZERO_ID: &str = "0000000000000000000000000000000000000000";

/// One ref update, serialized to hooks as `<previous> <new> <ref>\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    pub previous: String,
    pub new: String,
    pub ref_name: String,
}

impl PushEvent {
    /// Event for `ref_name` with sentinel ids.  Consumers must treat the ids
    /// as a trigger only, not as data for diffing.
    pub fn synthesized(ref_name: impl Into<String>) -> Self {
        Self {
            previous: SENTINEL_PREVIOUS.to_string(),
            new: SENTINEL_NEW.to_string(),
            ref_name: ref_name.into(),
        }
    }

    /// `true` if the ids are sentinels rather than object ids.
    pub fn is_synthesized(&self) -> bool {
        self.previous == SENTINEL_PREVIOUS && self.new == SENTINEL_NEW
    }

    pub fn is_deletion(&self) -> bool {
        is_zero_id(&self.new)
    }

    /// Branch name for `refs/heads/*` refs.
    pub fn branch(&self) -> Option<&str> {
        self.ref_name.strip_prefix(HEADS_PREFIX)
    }

    /// Events for every ref whose id differs between two snapshots, ordered
    /// by ref name.  Deleted refs get [`ZERO_ID`] as their new id.
    pub fn diff(before: &RefSnapshot, after: &RefSnapshot) -> Vec<PushEvent> {
        let mut events = Vec::new();

        for (ref_name, new) in after {
            match before.get(ref_name) {
                Some(previous) if previous == new => {}
                previous => events.push(PushEvent {
                    previous: previous.cloned().unwrap_or_else(|| ZERO_ID.to_string()),
                    new: new.clone(),
                    ref_name: ref_name.clone(),
                }),
            }
        }
        for (ref_name, previous) in before {
            if !after.contains_key(ref_name) {
                events.push(PushEvent {
                    previous: previous.clone(),
                    new: ZERO_ID.to_string(),
                    ref_name: ref_name.clone(),
                });
            }
        }

        events.sort_by(|a, b| a.ref_name.cmp(&b.ref_name));
        events
    }
}

fn is_zero_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b == b'0')
}

impl fmt::Display for PushEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.previous, self.new, self.ref_name)
    }
}

impl FromStr for PushEvent {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(previous), Some(new), Some(ref_name), None) => Ok(Self {
                previous: previous.to_string(),
                new: new.to_string(),
                ref_name: ref_name.to_string(),
            }),
            _ => Err(format!("malformed push event line: {line:?}")),
        }
    }
}

/// Hook stdin payload: one line per event.
pub fn encode_events(events: &[PushEvent]) -> String {
    events.iter().map(|e| format!("{e}\n")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(refs: &[(&str, &str)]) -> RefSnapshot {
        refs.iter()
            .map(|(r, id)| (r.to_string(), id.to_string()))
            .collect()
    }

    #[test]
    fn synthesized_line_uses_sentinels() {
        let event = PushEvent::synthesized("refs/heads/main");
        assert_eq!(event.to_string(), "unknown current refs/heads/main");
        assert!(event.is_synthesized());
        assert!(!event.is_deletion());
        assert_eq!(event.branch(), Some("main"));
    }

    #[test]
    fn line_round_trips_through_parse() {
        let line = "unknown current refs/heads/main";
        let event: PushEvent = line.parse().unwrap();
        assert_eq!(event.to_string(), line);
        assert!("only two".parse::<PushEvent>().is_err());
        assert!("a b c d".parse::<PushEvent>().is_err());
    }

    #[test]
    fn diff_reports_updates_creations_and_deletions() {
        let before = snapshot(&[
            ("refs/heads/main", "aaa"),
            ("refs/heads/stale", "bbb"),
            ("refs/tags/v1", "ccc"),
        ]);
        let after = snapshot(&[
            ("refs/heads/main", "ddd"),
            ("refs/heads/feature", "eee"),
            ("refs/tags/v1", "ccc"),
        ]);

        let events = PushEvent::diff(&before, &after);
        let lines: Vec<String> = events.iter().map(ToString::to_string).collect();
        assert_eq!(
            lines,
            vec![
                format!("{ZERO_ID} eee refs/heads/feature"),
                "aaa ddd refs/heads/main".to_string(),
                format!("bbb {ZERO_ID} refs/heads/stale"),
            ]
        );
        assert!(events[2].is_deletion());
    }

    #[test]
    fn diff_of_identical_snapshots_is_empty() {
        let refs = snapshot(&[("refs/heads/main", "aaa")]);
        assert!(PushEvent::diff(&refs, &refs).is_empty());
    }

    #[test]
    fn encode_writes_one_line_per_event() {
        let events = vec![
            PushEvent::synthesized("refs/heads/main"),
            PushEvent::synthesized("refs/heads/dev"),
        ];
        assert_eq!(
            encode_events(&events),
            "unknown current refs/heads/main\nunknown current refs/heads/dev\n"
        );
    }
}
