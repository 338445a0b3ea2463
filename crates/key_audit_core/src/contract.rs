use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_ALERT_AFTER_DAYS: i64 = 365;
pub const NOTIFICATION_SUBJECT: &str = "Access Key Expired";

/// Lifecycle state of an access key as reported by the identity store.
/// Records with any other state are treated as malformed and skipped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum KeyStatus {
    Active,
    Inactive,
}

impl KeyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Inactive => "Inactive",
        }
    }
}

/// A user entry as returned by the identity-listing service. The name is
/// optional because enumeration services occasionally surface malformed
/// records; nameless users are filtered out, never fatal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
    pub user_name: Option<String>,
}

impl UserRecord {
    pub fn named(user_name: impl Into<String>) -> Self {
        Self {
            user_name: Some(user_name.into()),
        }
    }

    /// Returns the trimmed user name, or `None` for a malformed record.
    pub fn usable_name(&self) -> Option<&str> {
        self.user_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessKeyRecord {
    pub user_name: String,
    pub access_key_id: Option<String>,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
}

/// One user's stale keys, in discovery order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserKeyGroup {
    pub user_name: String,
    pub keys: Vec<AccessKeyRecord>,
}

/// Normalized run configuration for one audit invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditSettings {
    pub alert_after_days: i64,
    pub topic_arn: String,
    pub subject: String,
}

/// Summary returned to the invocation trigger after a completed run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditOutcome {
    pub status: String,
    pub users_scanned: usize,
    pub users_with_stale_keys: usize,
    pub stale_keys_found: usize,
    pub notifications_published: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ValidationError {}

pub fn normalize_settings(
    alert_after_days: Option<i64>,
    topic_arn: impl Into<String>,
) -> Result<AuditSettings, ValidationError> {
    let alert_after_days = alert_after_days.unwrap_or(DEFAULT_ALERT_AFTER_DAYS);
    if alert_after_days <= 0 {
        return Err(ValidationError::new(
            "ALERT_AFTER_N_DAYS must be a positive number of days",
        ));
    }

    let topic_arn = topic_arn.into().trim().to_string();
    if topic_arn.is_empty() {
        return Err(ValidationError::new("notification topic cannot be empty"));
    }

    Ok(AuditSettings {
        alert_after_days,
        topic_arn,
        subject: NOTIFICATION_SUBJECT.to_string(),
    })
}
