use aws_sdk_iam::types::{AccessKeyMetadata, StatusType};
use chrono::{DateTime, Utc};
use lambda_runtime::{service_fn, Error, LambdaEvent};
use serde_json::Value;

use key_audit_core::contract::{
    normalize_settings, AccessKeyRecord, AuditOutcome, KeyStatus, UserRecord,
};
use key_audit_lambda::adapters::identity::{IdentityDirectory, UserPage};
use key_audit_lambda::adapters::notify::AlertPublisher;
use key_audit_lambda::handlers::audit::run_audit;

struct IamIdentityDirectory {
    iam_client: aws_sdk_iam::Client,
}

impl IdentityDirectory for IamIdentityDirectory {
    fn list_users_page(&self, continuation_token: Option<&str>) -> Result<UserPage, String> {
        let client = self.iam_client.clone();
        let marker = continuation_token.map(str::to_string);

        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async move {
                let output = client
                    .list_users()
                    .set_marker(marker)
                    .send()
                    .await
                    .map_err(|error| format!("failed to list iam users: {error}"))?;

                let users = output
                    .users()
                    .iter()
                    .map(|user| UserRecord {
                        user_name: Some(user.user_name().to_string()),
                    })
                    .collect();

                Ok(UserPage {
                    users,
                    has_more: output.is_truncated(),
                    next_token: output.marker().map(str::to_string),
                })
            })
        })
    }

    fn list_access_keys(&self, user_name: &str) -> Result<Vec<AccessKeyRecord>, String> {
        let client = self.iam_client.clone();
        let owner = user_name.to_string();

        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async move {
                let mut keys = Vec::new();
                let mut marker: Option<String> = None;

                // The IAM key listing paginates like the user listing does.
                loop {
                    let output = client
                        .list_access_keys()
                        .user_name(&owner)
                        .set_marker(marker.clone())
                        .send()
                        .await
                        .map_err(|error| {
                            format!("failed to list access keys for {owner}: {error}")
                        })?;

                    keys.extend(
                        output
                            .access_key_metadata()
                            .iter()
                            .filter_map(|metadata| access_key_record(&owner, metadata)),
                    );

                    if !output.is_truncated() {
                        return Ok(keys);
                    }
                    match output.marker() {
                        Some(token) => marker = Some(token.to_string()),
                        None => {
                            return Err(format!(
                                "access key listing for {owner} reported more pages but returned no marker"
                            ));
                        }
                    }
                }
            })
        })
    }
}

/// Maps one IAM metadata entry into the audit contract. Entries missing a
/// status or creation date, or carrying an unrecognized status, are skipped.
fn access_key_record(owner: &str, metadata: &AccessKeyMetadata) -> Option<AccessKeyRecord> {
    let status = match metadata.status()? {
        StatusType::Active => KeyStatus::Active,
        StatusType::Inactive => KeyStatus::Inactive,
        _ => return None,
    };
    let created = metadata.create_date()?;
    let created_at = DateTime::<Utc>::from_timestamp(created.secs(), created.subsec_nanos())?;

    Some(AccessKeyRecord {
        user_name: metadata
            .user_name()
            .map(str::to_string)
            .unwrap_or_else(|| owner.to_string()),
        access_key_id: metadata.access_key_id().map(str::to_string),
        status,
        created_at,
    })
}

struct SnsAlertPublisher {
    sns_client: aws_sdk_sns::Client,
}

impl AlertPublisher for SnsAlertPublisher {
    fn publish(&self, topic_arn: &str, subject: &str, message: &str) -> Result<(), String> {
        let client = self.sns_client.clone();
        let topic_arn = topic_arn.to_string();
        let subject = subject.to_string();
        let message = message.to_string();

        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async move {
                client
                    .publish()
                    .topic_arn(topic_arn)
                    .subject(subject)
                    .message(message)
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|error| format!("failed to publish to sns: {error}"))
            })
        })
    }
}

async fn handle_request(_event: LambdaEvent<Value>) -> Result<AuditOutcome, Error> {
    let alert_after_days = match std::env::var("ALERT_AFTER_N_DAYS") {
        Ok(raw) => Some(raw.trim().parse::<i64>().map_err(|_| {
            Error::from(format!("ALERT_AFTER_N_DAYS must be an integer, got `{raw}`"))
        })?),
        Err(_) => None,
    };
    let topic_arn = std::env::var("ALERT_TOPIC_ARN")
        .map_err(|_| Error::from("ALERT_TOPIC_ARN must be configured"))?;

    let settings = normalize_settings(alert_after_days, topic_arn)
        .map_err(|error| Error::from(error.message().to_string()))?;

    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let directory = IamIdentityDirectory {
        iam_client: aws_sdk_iam::Client::new(&aws_config),
    };
    let publisher = SnsAlertPublisher {
        sns_client: aws_sdk_sns::Client::new(&aws_config),
    };

    run_audit(&settings, &directory, &publisher, Utc::now())
        .map_err(|error| Error::from(error.message))
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    lambda_runtime::run(service_fn(handle_request)).await
}
