//! Persistence bookkeeping carried by every record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Audit, soft-delete and optimistic-lock fields.
///
/// Stores own these values: they stamp `updated_*` and bump `version` on
/// every write, and reject an update whose `version` is stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Audit {
    pub created_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub updated_by: Option<String>,
    pub deleted: bool,
    pub version: i64,
}

impl Audit {
    /// Audit fields for a record that has not been written yet.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            created_by: None,
            updated_at: now,
            updated_by: None,
            deleted: false,
            version: 0,
        }
    }

    /// Stamps a first write.
    pub fn stamp_insert(&mut self, actor: &str, now: DateTime<Utc>) {
        self.created_at = now;
        self.created_by = Some(actor.to_string());
        self.updated_at = now;
        self.updated_by = Some(actor.to_string());
    }

    /// Stamps an update and advances the version.
    pub fn stamp_update(&mut self, actor: &str, now: DateTime<Utc>) {
        self.updated_at = now;
        self.updated_by = Some(actor.to_string());
        self.version += 1;
    }
}

impl Default for Audit {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}
