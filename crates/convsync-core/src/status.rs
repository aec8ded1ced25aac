//! Effective delivery status of an outgoing message.

use crate::models::{OutgoingStatus, Stage};

/// Highest stage reached, scanning the hierarchy from `failed` downwards.
///
/// `failed` wins over any other stage present. An absent or empty status
/// resolves to `pending`.
pub fn highest_status(status: Option<&OutgoingStatus>) -> Stage {
    let Some(status) = status else {
        return Stage::Pending;
    };

    Stage::HIERARCHY
        .iter()
        .rev()
        .copied()
        .find(|stage| status.contains(*stage))
        .unwrap_or(Stage::Pending)
}
