//! Emission records and submission validation.
//!
//! Validation is structural only: every required field must be present with
//! the right JSON type. Value ranges (negative quantities, unknown units) are
//! not checked.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

/// A committed emission record.
///
/// Serializes with camelCase keys; this is also the payload published on the
/// audit topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub record_id: String,
    pub user_id: String,
    pub org: String,
    pub emission_gas_name: String,
    pub quantity: f64,
    pub unit: String,
}

/// Whether a dispatch creates a new record or updates an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    #[serde(rename = "created")]
    Create,
    #[serde(rename = "updated")]
    Update,
}

impl OperationType {
    /// Past-tense verb used in responses: `"created"` / `"updated"`.
    pub fn past_tense(&self) -> &'static str {
        match self {
            OperationType::Create => "created",
            OperationType::Update => "updated",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.past_tense())
    }
}

/// Identity of the submitter, derived from the submission.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProjection {
    pub user_id: String,
    /// Display name. Not part of the record; defaults to empty.
    #[serde(default)]
    pub name: String,
    pub org: String,
}

/// A record as submitted, before an id has been assigned.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordDraft {
    #[serde(default)]
    pub record_id: Option<String>,
    pub user_id: String,
    pub org: String,
    pub emission_gas_name: String,
    pub quantity: f64,
    pub unit: String,
}

impl RecordDraft {
    /// Bind the draft to its final id.
    pub fn into_record(self, record_id: String) -> Record {
        Record {
            record_id,
            user_id: self.user_id,
            org: self.org,
            emission_gas_name: self.emission_gas_name,
            quantity: self.quantity,
            unit: self.unit,
        }
    }
}

/// Output of [`validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub draft: RecordDraft,
    pub user: UserProjection,
}

impl Submission {
    /// Record id supplied by the caller, if any. Present means update.
    pub fn requested_id(&self) -> Option<&str> {
        self.draft.record_id.as_deref()
    }
}

/// Type-check a raw submission and its user projection.
///
/// The record is checked first; a well-formed record with a malformed user
/// projection (e.g. a non-string `name`) still fails.
pub fn validate(raw: &Value) -> Result<Submission, ValidationError> {
    if !raw.is_object() {
        return Err(ValidationError::record("expected a JSON object"));
    }

    let draft = RecordDraft::deserialize(raw).map_err(ValidationError::record)?;
    let user = UserProjection::deserialize(raw).map_err(ValidationError::user)?;

    Ok(Submission { draft, user })
}
