//! Request fixtures.

use serde_json::{json, Value};

/// A well-formed create submission.
pub fn record_submission() -> Value {
    json!({
        "userId": "user-1",
        "org": "org-1",
        "emissionGasName": "CO2",
        "quantity": 100,
        "unit": "kg"
    })
}

/// A well-formed update submission for `record_id`.
pub fn update_submission(record_id: &str, quantity: f64) -> Value {
    let mut value = record_submission();
    value["recordId"] = json!(record_id);
    value["quantity"] = json!(quantity);
    value
}
