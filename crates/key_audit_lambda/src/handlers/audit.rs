use chrono::{DateTime, Utc};
use serde_json::json;

use key_audit_core::contract::{
    AccessKeyRecord, AuditOutcome, AuditSettings, UserKeyGroup, UserRecord,
};
use key_audit_core::report::{format_group_message, group_keys_by_user};
use key_audit_core::staleness::is_key_interesting;

use crate::adapters::identity::IdentityDirectory;
use crate::adapters::notify::AlertPublisher;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditHandlerError {
    pub message: String,
}

impl AuditHandlerError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AuditHandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for AuditHandlerError {}

/// Runs one audit invocation: enumerate users, collect each user's stale
/// active keys, group them per user, and publish one notification per group.
///
/// Enumeration failures abort the run before any notification goes out.
/// Publish failures are collected so every group gets exactly one delivery
/// attempt; any failure surfaces as an aggregate error after the loop.
pub fn run_audit(
    settings: &AuditSettings,
    directory: &dyn IdentityDirectory,
    publisher: &dyn AlertPublisher,
    now: DateTime<Utc>,
) -> Result<AuditOutcome, AuditHandlerError> {
    log_audit_info(
        "audit_started",
        json!({
            "alert_after_days": settings.alert_after_days,
            "topic_arn": settings.topic_arn.clone(),
        }),
    );

    let users = collect_users(directory)?;
    let named_users: Vec<&str> = users
        .iter()
        .filter_map(UserRecord::usable_name)
        .collect();
    let skipped_users = users.len() - named_users.len();
    if skipped_users > 0 {
        log_audit_info(
            "malformed_users_skipped",
            json!({ "skipped": skipped_users }),
        );
    }
    log_audit_info(
        "users_enumerated",
        json!({ "users_scanned": named_users.len() }),
    );

    let mut interesting_keys: Vec<AccessKeyRecord> = Vec::new();
    for user_name in &named_users {
        let keys = directory.list_access_keys(user_name).map_err(|error| {
            AuditHandlerError::new(format!(
                "failed to list access keys for user {user_name}: {error}"
            ))
        })?;
        interesting_keys.extend(
            keys.into_iter()
                .filter(|key| is_key_interesting(key, now, settings.alert_after_days)),
        );
    }

    let groups = group_keys_by_user(interesting_keys);
    let stale_keys_found: usize = groups.iter().map(|group| group.keys.len()).sum();
    log_audit_info(
        "stale_keys_grouped",
        json!({
            "users_with_stale_keys": groups.len(),
            "stale_keys_found": stale_keys_found,
        }),
    );

    let notifications_published = publish_groups(settings, publisher, &groups)?;

    let outcome = AuditOutcome {
        status: "ok".to_string(),
        users_scanned: named_users.len(),
        users_with_stale_keys: groups.len(),
        stale_keys_found,
        notifications_published,
    };
    log_audit_info(
        "audit_completed",
        json!({
            "users_scanned": outcome.users_scanned,
            "users_with_stale_keys": outcome.users_with_stale_keys,
            "stale_keys_found": outcome.stale_keys_found,
            "notifications_published": outcome.notifications_published,
        }),
    );
    Ok(outcome)
}

/// Merges every page of the user listing into one sequence, chaining
/// continuation tokens until the directory reports no further pages.
fn collect_users(directory: &dyn IdentityDirectory) -> Result<Vec<UserRecord>, AuditHandlerError> {
    let mut users = Vec::new();
    let mut continuation_token: Option<String> = None;

    loop {
        let page = directory
            .list_users_page(continuation_token.as_deref())
            .map_err(|error| AuditHandlerError::new(format!("failed to list users: {error}")))?;
        users.extend(page.users);

        if !page.has_more {
            return Ok(users);
        }

        match page.next_token {
            Some(token) => continuation_token = Some(token),
            None => {
                return Err(AuditHandlerError::new(
                    "user listing reported more pages but returned no continuation token",
                ));
            }
        }
    }
}

fn publish_groups(
    settings: &AuditSettings,
    publisher: &dyn AlertPublisher,
    groups: &[UserKeyGroup],
) -> Result<usize, AuditHandlerError> {
    let mut failed_users: Vec<String> = Vec::new();
    let mut published = 0usize;

    for group in groups {
        let message = format_group_message(group);
        match publisher.publish(&settings.topic_arn, &settings.subject, &message) {
            Ok(()) => published += 1,
            Err(error) => {
                log_audit_error(
                    "notification_failed",
                    json!({
                        "user_name": group.user_name.clone(),
                        "error": error,
                    }),
                );
                failed_users.push(group.user_name.clone());
            }
        }
    }

    if failed_users.is_empty() {
        Ok(published)
    } else {
        Err(AuditHandlerError::new(format!(
            "failed to publish notifications for users: {}",
            failed_users.join(", ")
        )))
    }
}

fn log_audit_info(event: &str, details: serde_json::Value) {
    eprintln!(
        "{}",
        json!({
            "component": "stale_key_auditor",
            "event": event,
            "timestamp": Utc::now().to_rfc3339(),
            "details": details,
        })
    );
}

fn log_audit_error(event: &str, details: serde_json::Value) {
    eprintln!(
        "{}",
        json!({
            "component": "stale_key_auditor",
            "level": "error",
            "event": event,
            "timestamp": Utc::now().to_rfc3339(),
            "details": details,
        })
    );
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::{Duration, TimeZone};
    use key_audit_core::contract::{normalize_settings, KeyStatus};

    use super::*;
    use crate::adapters::identity::UserPage;

    struct PagedDirectory {
        pages: Vec<UserPage>,
        keys_by_user: Vec<(String, Vec<AccessKeyRecord>)>,
        requested_tokens: Mutex<Vec<Option<String>>>,
    }

    impl PagedDirectory {
        fn new(pages: Vec<UserPage>, keys_by_user: Vec<(String, Vec<AccessKeyRecord>)>) -> Self {
            Self {
                pages,
                keys_by_user,
                requested_tokens: Mutex::new(Vec::new()),
            }
        }

        fn single_page(
            users: Vec<UserRecord>,
            keys_by_user: Vec<(String, Vec<AccessKeyRecord>)>,
        ) -> Self {
            Self::new(
                vec![UserPage {
                    users,
                    has_more: false,
                    next_token: None,
                }],
                keys_by_user,
            )
        }
    }

    impl IdentityDirectory for PagedDirectory {
        fn list_users_page(&self, continuation_token: Option<&str>) -> Result<UserPage, String> {
            let mut requested = self.requested_tokens.lock().expect("poisoned mutex");
            requested.push(continuation_token.map(str::to_string));
            let page_index = requested.len() - 1;
            self.pages
                .get(page_index)
                .cloned()
                .ok_or_else(|| "no more pages".to_string())
        }

        fn list_access_keys(&self, user_name: &str) -> Result<Vec<AccessKeyRecord>, String> {
            Ok(self
                .keys_by_user
                .iter()
                .find(|(name, _)| name == user_name)
                .map(|(_, keys)| keys.clone())
                .unwrap_or_default())
        }
    }

    struct CapturingPublisher {
        deliveries: Mutex<Vec<(String, String, String)>>,
        fail_when_body_contains: Option<String>,
    }

    impl CapturingPublisher {
        fn new() -> Self {
            Self {
                deliveries: Mutex::new(Vec::new()),
                fail_when_body_contains: None,
            }
        }

        fn failing_when_body_contains(needle: &str) -> Self {
            Self {
                deliveries: Mutex::new(Vec::new()),
                fail_when_body_contains: Some(needle.to_string()),
            }
        }

        fn deliveries(&self) -> Vec<(String, String, String)> {
            self.deliveries.lock().expect("poisoned mutex").clone()
        }
    }

    impl AlertPublisher for CapturingPublisher {
        fn publish(&self, topic_arn: &str, subject: &str, message: &str) -> Result<(), String> {
            if let Some(needle) = &self.fail_when_body_contains {
                if message.contains(needle.as_str()) {
                    return Err("simulated delivery failure".to_string());
                }
            }
            self.deliveries.lock().expect("poisoned mutex").push((
                topic_arn.to_string(),
                subject.to_string(),
                message.to_string(),
            ));
            Ok(())
        }
    }

    fn test_settings() -> AuditSettings {
        normalize_settings(Some(365), "arn:aws:sns:eu-west-1:123456789012:stale-keys")
            .expect("settings should pass")
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).single().expect("valid timestamp")
    }

    fn stale_key(user_name: &str, access_key_id: &str, now: DateTime<Utc>) -> AccessKeyRecord {
        AccessKeyRecord {
            user_name: user_name.to_string(),
            access_key_id: Some(access_key_id.to_string()),
            status: KeyStatus::Active,
            created_at: now - Duration::days(400),
        }
    }

    fn fresh_key(user_name: &str, access_key_id: &str, now: DateTime<Utc>) -> AccessKeyRecord {
        AccessKeyRecord {
            user_name: user_name.to_string(),
            access_key_id: Some(access_key_id.to_string()),
            status: KeyStatus::Active,
            created_at: now - Duration::days(30),
        }
    }

    fn inactive_key(user_name: &str, access_key_id: &str, now: DateTime<Utc>) -> AccessKeyRecord {
        AccessKeyRecord {
            user_name: user_name.to_string(),
            access_key_id: Some(access_key_id.to_string()),
            status: KeyStatus::Inactive,
            created_at: now - Duration::days(4_000),
        }
    }

    #[test]
    fn merges_all_user_pages_in_order() {
        let now = fixed_now();
        let directory = PagedDirectory::new(
            vec![
                UserPage {
                    users: vec![UserRecord::named("u1"), UserRecord::named("u2")],
                    has_more: true,
                    next_token: Some("t1".to_string()),
                },
                UserPage {
                    users: vec![UserRecord::named("u3"), UserRecord::named("u4")],
                    has_more: true,
                    next_token: Some("t2".to_string()),
                },
                UserPage {
                    users: vec![UserRecord::named("u5")],
                    has_more: false,
                    next_token: None,
                },
            ],
            Vec::new(),
        );
        let publisher = CapturingPublisher::new();

        let outcome = run_audit(&test_settings(), &directory, &publisher, now)
            .expect("audit should pass");

        assert_eq!(outcome.users_scanned, 5);
        assert_eq!(
            *directory.requested_tokens.lock().expect("poisoned mutex"),
            vec![None, Some("t1".to_string()), Some("t2".to_string())]
        );
    }

    #[test]
    fn malformed_paging_state_aborts_before_any_publish() {
        let now = fixed_now();
        let directory = PagedDirectory::new(
            vec![UserPage {
                users: vec![UserRecord::named("alice")],
                has_more: true,
                next_token: None,
            }],
            vec![("alice".to_string(), vec![stale_key("alice", "AKIA-A1", now)])],
        );
        let publisher = CapturingPublisher::new();

        let error = run_audit(&test_settings(), &directory, &publisher, now)
            .expect_err("audit should fail");

        assert!(error.message.contains("no continuation token"));
        assert!(publisher.deliveries().is_empty());
    }

    #[test]
    fn nameless_users_are_skipped_not_fatal() {
        let now = fixed_now();
        let directory = PagedDirectory::single_page(
            vec![
                UserRecord { user_name: None },
                UserRecord::named("alice"),
                UserRecord::named("   "),
            ],
            vec![("alice".to_string(), vec![stale_key("alice", "AKIA-A1", now)])],
        );
        let publisher = CapturingPublisher::new();

        let outcome = run_audit(&test_settings(), &directory, &publisher, now)
            .expect("audit should pass");

        assert_eq!(outcome.users_scanned, 1);
        assert_eq!(publisher.deliveries().len(), 1);
    }

    #[test]
    fn users_without_interesting_keys_trigger_no_publish() {
        let now = fixed_now();
        let directory = PagedDirectory::single_page(
            vec![UserRecord::named("alice"), UserRecord::named("bob")],
            vec![
                (
                    "alice".to_string(),
                    vec![inactive_key("alice", "AKIA-A1", now)],
                ),
                ("bob".to_string(), vec![fresh_key("bob", "AKIA-B1", now)]),
            ],
        );
        let publisher = CapturingPublisher::new();

        let outcome = run_audit(&test_settings(), &directory, &publisher, now)
            .expect("audit should pass");

        assert_eq!(outcome.users_with_stale_keys, 0);
        assert_eq!(outcome.notifications_published, 0);
        assert!(publisher.deliveries().is_empty());
    }

    #[test]
    fn publishes_exactly_one_notification_per_group() {
        let now = fixed_now();
        let directory = PagedDirectory::single_page(
            vec![
                UserRecord::named("alice"),
                UserRecord::named("bob"),
                UserRecord::named("carol"),
            ],
            vec![
                (
                    "alice".to_string(),
                    vec![
                        stale_key("alice", "AKIA-A1", now),
                        fresh_key("alice", "AKIA-A2", now),
                        stale_key("alice", "AKIA-A3", now),
                    ],
                ),
                ("bob".to_string(), vec![stale_key("bob", "AKIA-B1", now)]),
                (
                    "carol".to_string(),
                    vec![stale_key("carol", "AKIA-C1", now)],
                ),
            ],
        );
        let publisher = CapturingPublisher::new();
        let settings = test_settings();

        let outcome =
            run_audit(&settings, &directory, &publisher, now).expect("audit should pass");

        assert_eq!(outcome.notifications_published, 3);
        assert_eq!(outcome.stale_keys_found, 4);

        let deliveries = publisher.deliveries();
        assert_eq!(deliveries.len(), 3);
        for (topic_arn, subject, _) in &deliveries {
            assert_eq!(topic_arn, &settings.topic_arn);
            assert_eq!(subject, "Access Key Expired");
        }

        let alice_body = &deliveries[0].2;
        assert!(alice_body.contains("AKIA-A1"));
        assert!(alice_body.contains("AKIA-A3"));
        assert!(!alice_body.contains("AKIA-A2"));
        assert!(!alice_body.contains("AKIA-B1"));
        assert!(deliveries[1].2.contains("AKIA-B1"));
        assert!(deliveries[2].2.contains("AKIA-C1"));
    }

    #[test]
    fn one_failed_publish_does_not_block_remaining_groups() {
        let now = fixed_now();
        let directory = PagedDirectory::single_page(
            vec![UserRecord::named("alice"), UserRecord::named("bob")],
            vec![
                (
                    "alice".to_string(),
                    vec![stale_key("alice", "AKIA-A1", now)],
                ),
                ("bob".to_string(), vec![stale_key("bob", "AKIA-B1", now)]),
            ],
        );
        let publisher = CapturingPublisher::failing_when_body_contains("AKIA-A1");

        let error = run_audit(&test_settings(), &directory, &publisher, now)
            .expect_err("audit should fail");

        assert_eq!(
            error.message,
            "failed to publish notifications for users: alice"
        );
        let deliveries = publisher.deliveries();
        assert_eq!(deliveries.len(), 1);
        assert!(deliveries[0].2.contains("AKIA-B1"));
    }

    #[test]
    fn key_enumeration_failure_aborts_before_any_publish() {
        struct FailingKeysDirectory;

        impl IdentityDirectory for FailingKeysDirectory {
            fn list_users_page(&self, _token: Option<&str>) -> Result<UserPage, String> {
                Ok(UserPage {
                    users: vec![UserRecord::named("alice")],
                    has_more: false,
                    next_token: None,
                })
            }

            fn list_access_keys(&self, _user_name: &str) -> Result<Vec<AccessKeyRecord>, String> {
                Err("service unavailable".to_string())
            }
        }

        let publisher = CapturingPublisher::new();
        let error = run_audit(
            &test_settings(),
            &FailingKeysDirectory,
            &publisher,
            fixed_now(),
        )
        .expect_err("audit should fail");

        assert!(error
            .message
            .contains("failed to list access keys for user alice"));
        assert!(publisher.deliveries().is_empty());
    }

    #[test]
    fn detection_is_deterministic_across_runs() {
        let now = fixed_now();
        let build_directory = || {
            PagedDirectory::single_page(
                vec![UserRecord::named("alice"), UserRecord::named("bob")],
                vec![
                    (
                        "alice".to_string(),
                        vec![stale_key("alice", "AKIA-A1", now)],
                    ),
                    ("bob".to_string(), vec![stale_key("bob", "AKIA-B1", now)]),
                ],
            )
        };

        let publisher_a = CapturingPublisher::new();
        let publisher_b = CapturingPublisher::new();
        let outcome_a = run_audit(&test_settings(), &build_directory(), &publisher_a, now)
            .expect("audit should pass");
        let outcome_b = run_audit(&test_settings(), &build_directory(), &publisher_b, now)
            .expect("audit should pass");

        assert_eq!(outcome_a, outcome_b);
        assert_eq!(publisher_a.deliveries(), publisher_b.deliveries());
    }
}
