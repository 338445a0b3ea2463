use chrono::{DateTime, Utc};

use crate::contract::{AccessKeyRecord, KeyStatus};

/// Whether a key should be reported: Active and at least `alert_after_days`
/// whole days old. Elapsed days are truncated, not rounded, so a key created
/// 364 days and 23 hours ago is not yet reportable.
pub fn is_key_interesting(
    key: &AccessKeyRecord,
    now: DateTime<Utc>,
    alert_after_days: i64,
) -> bool {
    if key.status != KeyStatus::Active {
        return false;
    }

    let elapsed_days = now.signed_duration_since(key.created_at).num_days();
    elapsed_days >= alert_after_days
}
