//! Best-effort structured event records
//!
//! Compaction lifecycle events are serialized as one JSON object per
//! record and handed to the `log` facade; listeners that want them
//! subscribe to the [`EVENTS_TARGET`] log target. Delivery is
//! fire-and-forget and never affects the job outcome.

use serde_json::Value as JsonValue;

/// Log target carrying the JSON event records
pub const EVENTS_TARGET: &str = "lsm_compaction::events";

pub(crate) fn emit(record: &JsonValue) {
    log::info!(target: EVENTS_TARGET, "{record}");
}
