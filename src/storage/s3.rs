//! Live permission probe for S3 backup targets.
//!
//! Before a target is replicated, the proposing node checks that the bucket
//! is reachable with the given credentials and that the key can list, write,
//! read and delete objects.  The probe object is
//! `sylve-permcheck-{uuid}.txt` and is removed again on success.

use std::time::Duration;

use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::cluster::domains::s3::S3ConfigInput;

/// Upper bound for the whole probe, including client setup.
const PROBE_TIMEOUT: Duration = Duration::from_secs(20);

const PROBE_BODY: &[u8] = b"sylve permission check";

/// Build a path-style client for `target` with static credentials.
async fn client_for(target: &S3ConfigInput) -> Client {
    let creds = aws_sdk_s3::config::Credentials::new(
        &target.access_key,
        &target.secret_key,
        None,
        None,
        "sylve-s3-config",
    );
    let timeouts = aws_config::timeout::TimeoutConfig::builder()
        .operation_timeout(PROBE_TIMEOUT)
        .build();
    let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(target.region.clone()))
        .endpoint_url(&target.endpoint)
        .credentials_provider(creds)
        .timeout_config(timeouts)
        .load()
        .await;
    let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
        .force_path_style(true)
        .build();
    Client::from_conf(s3_config)
}

/// Check that `target` grants every permission backups need.
pub async fn validate_target(target: &S3ConfigInput) -> anyhow::Result<()> {
    match tokio::time::timeout(PROBE_TIMEOUT, probe(target)).await {
        Ok(result) => result,
        Err(_) => anyhow::bail!(
            "s3_config_validation_failed: timed out after {}s",
            PROBE_TIMEOUT.as_secs()
        ),
    }
}

async fn probe(target: &S3ConfigInput) -> anyhow::Result<()> {
    let client = client_for(target).await;
    let bucket = target.bucket.as_str();

    if let Err(e) = client.head_bucket().bucket(bucket).send().await {
        anyhow::bail!(
            "s3_config_validation_failed: bucket {bucket} not accessible: {}",
            aws_sdk_s3::error::DisplayErrorContext(e)
        );
    }

    let mut denied = Vec::new();
    if let Err(e) = client
        .list_objects_v2()
        .bucket(bucket)
        .max_keys(1)
        .send()
        .await
    {
        debug!(error = %aws_sdk_s3::error::DisplayErrorContext(e), "list probe failed");
        denied.push("s3:ListBucket");
    }

    let key = format!("sylve-permcheck-{}.txt", uuid::Uuid::new_v4());
    let put = client
        .put_object()
        .bucket(bucket)
        .key(&key)
        .body(ByteStream::from_static(PROBE_BODY))
        .send()
        .await;

    match put {
        Ok(_) => {
            let read = match client.get_object().bucket(bucket).key(&key).send().await {
                Ok(out) => out.body.collect().await.is_ok(),
                Err(_) => false,
            };
            if !read {
                denied.push("s3:GetObject");
            }
            if client
                .delete_object()
                .bucket(bucket)
                .key(&key)
                .send()
                .await
                .is_err()
            {
                denied.push("s3:DeleteObject");
            }
        }
        Err(e) => {
            debug!(error = %aws_sdk_s3::error::DisplayErrorContext(e), "put probe failed");
            denied.push("s3:PutObject");
        }
    }

    if denied.is_empty() {
        info!(bucket, endpoint = %target.endpoint, "s3 target validated");
        Ok(())
    } else {
        Err(anyhow::anyhow!(denied_message(&denied)))
    }
}

fn denied_message(denied: &[&str]) -> String {
    format!(
        "s3_config_validation_failed: missing/denied permissions -> {}",
        denied.join(", ")
    )
}
