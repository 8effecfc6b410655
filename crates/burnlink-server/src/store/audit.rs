//! Link lifecycle audit trail.
//!
//! Entries identify links by store id only. Access tokens and content never
//! reach this table.

use serde::{Deserialize, Serialize};

use super::now_millis;

/// What happened to a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkEvent {
    #[serde(rename = "link.create")]
    Create,
    #[serde(rename = "link.redeem")]
    Redeem,
    /// Removed by the background sweep after expiry.
    #[serde(rename = "link.expired")]
    Expired,
    /// Manual prune through the admin endpoint.
    #[serde(rename = "link.prune")]
    Prune,
}

/// How it ended. Names match the `reason` field of HTTP error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    NotFound,
    AlreadyAccessed,
    Expired,
    ServerError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Assigned by the store on write.
    pub seq: u64,
    /// Unix milliseconds.
    pub at: i64,
    pub event: LinkEvent,
    pub outcome: Outcome,
    pub record_id: Option<String>,
    pub source_ip: String,
    pub note: Option<String>,
}

impl AuditEntry {
    pub fn new(event: LinkEvent, outcome: Outcome, source_ip: impl Into<String>) -> Self {
        Self {
            seq: 0,
            at: now_millis(),
            event,
            outcome,
            record_id: None,
            source_ip: source_ip.into(),
            note: None,
        }
    }

    pub fn record(mut self, id: impl Into<String>) -> Self {
        self.record_id = Some(id.into());
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Selects entries for `Store::list_audit`. Bounds are inclusive unix ms.
#[derive(Debug, Clone)]
pub struct AuditFilter {
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub event: Option<LinkEvent>,
    pub record_id: Option<String>,
    pub limit: usize,
}

impl Default for AuditFilter {
    fn default() -> Self {
        Self {
            since: None,
            until: None,
            event: None,
            record_id: None,
            limit: 100,
        }
    }
}

impl AuditFilter {
    pub(crate) fn matches(&self, entry: &AuditEntry) -> bool {
        self.event.map_or(true, |e| e == entry.event)
            && self
                .record_id
                .as_deref()
                .map_or(true, |id| entry.record_id.as_deref() == Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names() {
        let entry = AuditEntry::new(LinkEvent::Redeem, Outcome::AlreadyAccessed, "10.0.0.1")
            .record("abc");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["event"], "link.redeem");
        assert_eq!(json["outcome"], "already_accessed");
        assert_eq!(json["record_id"], "abc");
    }

    #[test]
    fn filter_by_event_and_record() {
        let create = AuditEntry::new(LinkEvent::Create, Outcome::Ok, "ip").record("a");
        let redeem = AuditEntry::new(LinkEvent::Redeem, Outcome::Ok, "ip").record("b");

        let by_event = AuditFilter {
            event: Some(LinkEvent::Create),
            ..AuditFilter::default()
        };
        assert!(by_event.matches(&create));
        assert!(!by_event.matches(&redeem));

        let by_record = AuditFilter {
            record_id: Some("b".into()),
            ..AuditFilter::default()
        };
        assert!(!by_record.matches(&create));
        assert!(by_record.matches(&redeem));
        assert!(AuditFilter::default().matches(&create));
    }
}
