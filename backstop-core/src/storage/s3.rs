/*!
Amazon S3 remote tier.

Objects are stored under an optional key prefix. The write-time checksum travels in
the `sha256` user metadata of each object, so listings can tell an intact mirror
from a stale or foreign one without downloading anything.
*/

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream as S3Body;
use aws_sdk_s3::Client as S3Client;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, error, info};

use super::{AsyncObjectStorage, RemoteObject};
use crate::artifact::checksum_reader;
use crate::config::S3Target;
use crate::{BackupError, Result};

/// User metadata key holding the artifact checksum
pub const CHECKSUM_METADATA_KEY: &str = "sha256";

const HEAD_CONCURRENCY: usize = 8;

/// Amazon S3 storage adapter
///
/// # Authentication
/// The adapter uses the standard AWS credential provider chain:
/// 1. Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_SESSION_TOKEN)
/// 2. AWS credentials file (~/.aws/credentials)
/// 3. IAM roles for EC2 instances
/// 4. ECS task roles
///
/// # Example
/// ```rust,no_run
/// use backstop_core::config::S3Target;
/// use backstop_core::storage::{block_on, BlockingObjectStorage, S3ObjectStorage};
/// use std::time::Duration;
///
/// let target = S3Target {
///     bucket: "db-backups".to_string(),
///     prefix: "orders".to_string(),
///     region: Some("eu-west-1".to_string()),
///     endpoint: None,
/// };
/// let adapter = block_on(S3ObjectStorage::connect(
///     "offsite",
///     &target,
///     Duration::from_secs(300),
/// ))?;
/// let storage = BlockingObjectStorage::new(adapter);
/// # Ok::<(), backstop_core::BackupError>(())
/// ```
#[derive(Debug)]
pub struct S3ObjectStorage {
    name: String,
    client: S3Client,
    bucket: String,
    prefix: String,
    operation_timeout: Duration,
}

impl S3ObjectStorage {
    /// Build a client for `target` from the ambient AWS configuration
    ///
    /// # Arguments
    /// * `name` - Tier name used in reports
    /// * `target` - Bucket, prefix and optional region/endpoint overrides
    /// * `operation_timeout` - Upper bound for any single S3 request
    ///
    /// Every call is a single attempt; [`RemoteStore`](crate::remote::RemoteStore)
    /// owns retries for all tiers.
    pub async fn connect(
        name: &str,
        target: &S3Target,
        operation_timeout: Duration,
    ) -> Result<Self> {
        if target.bucket.is_empty() {
            return Err(BackupError::validation("S3 tier requires a bucket name"));
        }

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &target.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        if sdk_config.credentials_provider().is_none() {
            return Err(BackupError::auth(
                "AWS credentials not found; configure the standard AWS credential chain",
            ));
        }

        let mut s3_config = S3ConfigBuilder::from(&sdk_config);
        if let Some(endpoint) = &target.endpoint {
            s3_config = s3_config.endpoint_url(endpoint).force_path_style(true);
        }

        info!(tier = %name, bucket = %target.bucket, prefix = %target.prefix, "Initialized S3 tier");

        Ok(Self {
            name: name.to_string(),
            client: S3Client::from_conf(s3_config.build()),
            bucket: target.bucket.clone(),
            prefix: target.prefix.trim_matches('/').to_string(),
            operation_timeout,
        })
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn full_key(&self, key: &str) -> String {
        join_key(&self.prefix, key)
    }

    async fn with_timeout<T, F>(&self, op: &str, key: &str, future: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.operation_timeout, future)
            .await
            .map_err(|_| {
                BackupError::network(format!(
                    "S3 {op} for '{key}' timed out after {:?}",
                    self.operation_timeout
                ))
            })?
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<(String, u64)>> {
        let full_prefix = self.full_key(prefix);
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix);
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }
            let response = self
                .with_timeout("list_objects_v2", &full_prefix, async {
                    request
                        .send()
                        .await
                        .map_err(|e| map_s3_error("list_objects_v2", e, &full_prefix))
                })
                .await?;

            for object in response.contents() {
                let (Some(key), Some(size)) = (object.key(), object.size()) else {
                    continue;
                };
                let relative = strip_key_prefix(&self.prefix, key);
                if relative.is_empty() || relative.contains('/') {
                    continue;
                }
                objects.push((relative.to_string(), size.max(0) as u64));
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }
        Ok(objects)
    }

    async fn checksum_of(&self, key: &str) -> Result<Option<String>> {
        let full_key = self.full_key(key);
        self.with_timeout("head_object", &full_key, async {
            let response = self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(&full_key)
                .send()
                .await
                .map_err(|e| map_s3_error("head_object", e, &full_key))?;
            Ok(response
                .metadata()
                .and_then(|metadata| metadata.get(CHECKSUM_METADATA_KEY))
                .cloned())
        })
        .await
    }

    async fn put_object(&self, full_key: &str, source: &Path, checksum: &str) -> Result<()> {
        let body = S3Body::from_path(source).await.map_err(|e| {
            BackupError::write(format!("failed to open {}: {e}", source.display()))
        })?;
        self.with_timeout("put_object", full_key, async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(full_key)
                .metadata(CHECKSUM_METADATA_KEY, checksum)
                .body(body)
                .send()
                .await
                .map_err(|e| map_s3_error("put_object", e, full_key))
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AsyncObjectStorage for S3ObjectStorage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let keys = self.list_keys(prefix).await?;
        debug!(tier = %self.name, bucket = %self.bucket, count = keys.len(), "listed S3 objects");

        stream::iter(keys)
            .map(|(key, size_bytes)| async move {
                let checksum = match self.checksum_of(&key).await {
                    Ok(checksum) => checksum,
                    // deleted between list and head
                    Err(BackupError::NotFound(_)) => return Ok(None),
                    Err(e) => return Err(e),
                };
                Ok(Some(RemoteObject {
                    key,
                    size_bytes,
                    checksum,
                }))
            })
            .buffer_unordered(HEAD_CONCURRENCY)
            .try_filter_map(|object| async move { Ok(object) })
            .try_collect::<Vec<_>>()
            .await
            .map(|mut objects| {
                objects.sort_by(|a, b| a.key.cmp(&b.key));
                objects
            })
    }

    async fn upload(&self, key: &str, source: &Path, checksum: &str) -> Result<()> {
        let path = source.to_path_buf();
        let (actual, size) = tokio::task::spawn_blocking(move || {
            std::fs::File::open(&path).and_then(checksum_reader)
        })
        .await
        .map_err(|e| BackupError::write(format!("checksum task failed: {e}")))?
        .map_err(|e| BackupError::write(format!("failed to read {}: {e}", source.display())))?;
        if actual != checksum {
            return Err(BackupError::IntegrityCheckFailed {
                key: key.to_string(),
                expected: checksum.to_string(),
                actual,
            });
        }

        let full_key = self.full_key(key);
        info!(tier = %self.name, bucket = %self.bucket, key = %full_key, size, "Uploading artifact to S3");
        self.put_object(&full_key, source, checksum).await.map_err(|e| {
            error!(tier = %self.name, bucket = %self.bucket, key = %full_key, error = %e, "Failed to upload artifact to S3");
            e
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_key = self.full_key(key);
        // DeleteObject succeeds for missing keys, so existence is checked first
        self.checksum_of(key).await?;
        self.with_timeout("delete_object", &full_key, async {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&full_key)
                .send()
                .await
                .map_err(|e| map_s3_error("delete_object", e, &full_key))
        })
        .await?;
        debug!(tier = %self.name, bucket = %self.bucket, key = %full_key, "Deleted artifact from S3");
        Ok(())
    }
}

fn join_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}/{key}")
    }
}

fn strip_key_prefix<'a>(prefix: &str, key: &'a str) -> &'a str {
    if prefix.is_empty() {
        return key;
    }
    key.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or("")
}

/// Map AWS SDK errors to the remote error taxonomy
fn map_s3_error<E>(op: &str, error: SdkError<E>, key: &str) -> BackupError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &error {
        SdkError::DispatchFailure(dispatch_err) => {
            BackupError::network(format!("S3 {op} request failed to dispatch: {dispatch_err:?}"))
        }
        SdkError::TimeoutError(_) => {
            BackupError::network(format!("S3 {op} request timed out (key: {key})"))
        }
        SdkError::ResponseError(response_err) => {
            BackupError::network(format!("S3 {op} response error: {response_err:?}"))
        }
        SdkError::ConstructionFailure(_) => {
            BackupError::validation(format!("S3 {op} request could not be built: {error}"))
        }
        SdkError::ServiceError(service_err) => {
            let status = service_err.raw().status().as_u16();
            let code = service_err.err().code().unwrap_or("Unknown");
            let message = service_err.err().message().unwrap_or("no message");
            match (code, status) {
                ("AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken", _)
                | (_, 401 | 403) => BackupError::auth(format!("S3 {op} denied ({code}): {message}")),
                ("NoSuchKey" | "NotFound", _) | (_, 404) if code != "NoSuchBucket" => {
                    BackupError::not_found(format!("S3 object '{key}' not found"))
                }
                ("NoSuchBucket" | "InvalidBucketName", _) => {
                    BackupError::validation(format!("S3 bucket unusable ({code}): {message}"))
                }
                (_, 500..=599) | ("SlowDown" | "InternalError" | "RequestTimeout", _) => {
                    BackupError::network(format!("S3 {op} service error ({code}): {message}"))
                }
                _ => BackupError::validation(format!("S3 {op} rejected ({code}, HTTP {status}): {message}")),
            }
        }
        _ => BackupError::network(format!("S3 {op} error: {error}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::operation::head_object::HeadObjectError;
    use backstop_retry::RetryableError;

    #[test]
    fn test_key_prefixing() {
        assert_eq!(join_key("", "orders.sql.gz"), "orders.sql.gz");
        assert_eq!(join_key("backups/prod", "orders.sql.gz"), "backups/prod/orders.sql.gz");

        assert_eq!(strip_key_prefix("backups", "backups/orders.sql.gz"), "orders.sql.gz");
        assert_eq!(strip_key_prefix("backups", "backups-old/orders.sql.gz"), "");
        assert_eq!(strip_key_prefix("", "orders.sql.gz"), "orders.sql.gz");
    }

    #[test]
    fn test_timeout_maps_to_transient_network_error() {
        let timeout_error = SdkError::<HeadObjectError>::timeout_error("deadline elapsed");
        let mapped = map_s3_error("head_object", timeout_error, "test-key");

        assert!(matches!(mapped, BackupError::Network(_)));
        assert!(mapped.to_string().contains("test-key"));
        assert!(mapped.is_transient());
    }

    #[test]
    fn test_construction_failure_is_permanent() {
        let failure = SdkError::<HeadObjectError>::construction_failure("missing bucket");
        let mapped = map_s3_error("head_object", failure, "test-key");
        assert!(matches!(mapped, BackupError::Validation(_)));
        assert!(!mapped.is_transient());
    }
}
