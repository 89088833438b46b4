//! Classified internal events republished from webhook deliveries.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::ChangeKey;

/// The kinds of review-system events the engine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    ChangeMerged,
    ChangeAbandoned,
    ChangeStaged,
    ChangeUnstaged,
    /// First patchset of a change appeared. Cherry-picks always begin as
    /// revision 1, so this is the signal that a replica now exists.
    PatchsetCreated,
    IntegrationPass,
    IntegrationFail,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ChangeMerged => "change-merged",
            EventKind::ChangeAbandoned => "change-abandoned",
            EventKind::ChangeStaged => "change-staged",
            EventKind::ChangeUnstaged => "change-unstaged",
            EventKind::PatchsetCreated => "patchset-created",
            EventKind::IntegrationPass => "change-integration-pass",
            EventKind::IntegrationFail => "change-integration-fail",
        }
    }

    /// Maps an inbound webhook `type` field to a kind.
    pub fn parse(s: &str) -> Option<EventKind> {
        match s {
            "change-merged" => Some(EventKind::ChangeMerged),
            "change-abandoned" => Some(EventKind::ChangeAbandoned),
            "change-staged" => Some(EventKind::ChangeStaged),
            "change-unstaged" => Some(EventKind::ChangeUnstaged),
            "patchset-created" => Some(EventKind::PatchsetCreated),
            "change-integration-pass" => Some(EventKind::IntegrationPass),
            "change-integration-fail" => Some(EventKind::IntegrationFail),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified event's identity: what happened, and to which change.
///
/// Listener subscriptions are keyed by this pair; the context is the
/// affected change's fully-qualified key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub kind: EventKind,
    pub context: String,
}

impl EventKey {
    pub fn new(kind: EventKind, context: impl Into<String>) -> Self {
        EventKey {
            kind,
            context: context.into(),
        }
    }

    pub fn for_change(kind: EventKind, change: &ChangeKey) -> Self {
        EventKey {
            kind,
            context: change.to_string(),
        }
    }

    /// The `"<kind>|<context>"` form used as a persisted-listener map key.
    pub fn storage_key(&self) -> String {
        format!("{}|{}", self.kind, self.context)
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ids::ChangeKey;

    #[test]
    fn kind_parse_matches_as_str() {
        for kind in [
            EventKind::ChangeMerged,
            EventKind::ChangeAbandoned,
            EventKind::ChangeStaged,
            EventKind::ChangeUnstaged,
            EventKind::PatchsetCreated,
            EventKind::IntegrationPass,
            EventKind::IntegrationFail,
        ] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("ref-updated"), None);
    }

    #[test]
    fn storage_key_is_kind_pipe_context() {
        let key = EventKey::for_change(
            EventKind::PatchsetCreated,
            &ChangeKey::new("qt/base", "6.5", "Iabc"),
        );
        assert_eq!(key.storage_key(), "patchset-created|qt/base~6.5~Iabc");
    }
}
