//! Core domain model for dealsync.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "dealsync-core";

/// Canonical in-memory shape of a deal, shared by both snapshots and the upsert call.
///
/// `title` is the only identity either source exposes, so it doubles as the join key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl Deal {
    pub fn new(title: impl Into<String>, value: f64) -> Self {
        Self {
            title: title.into(),
            currency: None,
            value,
            status: None,
        }
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = Some(currency.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }
}

/// Merge result keyed by title. Ordered so dispatch batches are stable across runs.
pub type ReconciledSet = BTreeMap<String, Deal>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_optional_fields_are_omitted_from_the_wire_shape() {
        let deal = Deal::new("Acme renewal", 120.5);
        let json = serde_json::to_value(&deal).expect("serialize");
        assert_eq!(json, serde_json::json!({ "title": "Acme renewal", "value": 120.5 }));
    }

    #[test]
    fn populated_fields_round_out_the_wire_shape() {
        let deal = Deal::new("Acme renewal", 10.0)
            .with_currency("EUR")
            .with_status("open");
        let json = serde_json::to_value(&deal).expect("serialize");
        assert_eq!(json["currency"], "EUR");
        assert_eq!(json["status"], "open");
    }
}
