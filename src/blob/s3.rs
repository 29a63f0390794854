use std::time::Instant;

use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{BlobStore, locator_segments};
use crate::error::StoreError;
use crate::model::BlobLocator;

/// Upper bound of keys accepted by one DeleteObjects request
const DELETE_BATCH_SIZE: usize = 1000;

/// Blob store backed by an S3 bucket, optionally under a key prefix
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    prefix: String,
}

impl S3BlobStore {
    pub fn new(client: S3Client, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: normalize_prefix(&prefix.into()),
        }
    }

    /// Build a client from the default AWS credential chain and region
    pub async fn from_env(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(S3Client::new(&config), bucket, prefix)
    }

    fn key_for(&self, locator: &BlobLocator) -> Result<String, StoreError> {
        let relative = locator_segments(locator)?.join("/");
        Ok(format!("{}{}", self.prefix, relative))
    }
}

/// `""` stays empty, anything else ends with exactly one `/`
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

fn delete_request(keys: &[String]) -> Result<Delete, StoreError> {
    let objects = keys
        .iter()
        .map(|key| ObjectIdentifier::builder().key(key).build())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StoreError::blob(format!("build delete request: {}", e)))?;
    Delete::builder()
        .set_objects(Some(objects))
        .quiet(true)
        .build()
        .map_err(|e| StoreError::blob(format!("build delete request: {}", e)))
}

/// Execution time encoded in the last segment of an object key
fn key_timestamp(key: &str) -> Result<DateTime<Utc>, StoreError> {
    let name = key.rsplit('/').next().unwrap_or(key);
    BlobLocator::timestamp_of(name)
        .map_err(|e| StoreError::blob(format!("object '{}': {}", key, e)))
}

#[async_trait]
impl BlobStore for S3BlobStore {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn save_file(&self, locator: &BlobLocator, data: &[u8]) -> Result<(), StoreError> {
        let key = self.key_for(locator)?;
        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .if_none_match("*")
            .content_type("application/yaml")
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!(bucket = %self.bucket, key = %key, size_bytes = data.len(), "Blob uploaded");
                Ok(())
            }
            // 412 when the key exists, 409 when a concurrent upload of it is in flight
            Err(e)
                if e.raw_response()
                    .is_some_and(|r| matches!(r.status().as_u16(), 409 | 412)) =>
            {
                let existing = self.download_file(locator).await?;
                if existing == data {
                    debug!(
                        bucket = %self.bucket,
                        key = %key,
                        "Blob already archived with identical content"
                    );
                    Ok(())
                } else {
                    Err(StoreError::duplicate(format!(
                        "s3://{}/{} already holds a different payload",
                        self.bucket, key
                    )))
                }
            }
            Err(e) => Err(StoreError::blob(format!(
                "upload s3://{}/{}: {}",
                self.bucket,
                key,
                DisplayErrorContext(&e)
            ))),
        }
    }

    async fn download_file(&self, locator: &BlobLocator) -> Result<Vec<u8>, StoreError> {
        let key = self.key_for(locator)?;
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| match e.as_service_error() {
                Some(service) if service.is_no_such_key() => {
                    StoreError::not_found(format!("s3://{}/{}", self.bucket, key))
                }
                _ => StoreError::blob(format!(
                    "download s3://{}/{}: {}",
                    self.bucket,
                    key,
                    DisplayErrorContext(&e)
                )),
            })?;

        let data = response.body.collect().await.map_err(|e| {
            StoreError::blob(format!("read body of s3://{}/{}: {}", self.bucket, key, e))
        })?;
        Ok(data.into_bytes().to_vec())
    }

    async fn delete_file(&self, locator: &BlobLocator) -> Result<(), StoreError> {
        let key = self.key_for(locator)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                StoreError::blob(format!(
                    "delete s3://{}/{}: {}",
                    self.bucket,
                    key,
                    DisplayErrorContext(&e)
                ))
            })?;

        debug!(bucket = %self.bucket, key = %key, "Blob deleted");
        Ok(())
    }

    async fn purge(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let started = Instant::now();
        info!(
            bucket = %self.bucket,
            prefix = %self.prefix,
            cutoff = %cutoff,
            "Starting S3 blob purge"
        );

        let mut expired = Vec::new();
        let mut continuation_token: Option<String> = None;
        let mut total_listed = 0;

        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket);
            if !self.prefix.is_empty() {
                request = request.prefix(&self.prefix);
            }
            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(|e| {
                StoreError::blob(format!("list s3://{}: {}", self.bucket, DisplayErrorContext(&e)))
            })?;

            let contents = response.contents();
            total_listed += contents.len();
            debug!(batch_size = contents.len(), total_listed, "Retrieved S3 objects batch");

            for object in contents {
                let Some(key) = object.key() else { continue };
                if key_timestamp(key)? < cutoff {
                    expired.push(key.to_string());
                }
            }

            if response.is_truncated().unwrap_or(false) {
                continuation_token = response.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        let mut removed = 0;
        for batch in expired.chunks(DELETE_BATCH_SIZE) {
            let response = self
                .client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete_request(batch)?)
                .send()
                .await
                .map_err(|e| {
                    StoreError::blob(format!(
                        "delete batch from s3://{}: {}",
                        self.bucket,
                        DisplayErrorContext(&e)
                    ))
                })?;

            if let Some(failed) = response.errors().first() {
                return Err(StoreError::blob(format!(
                    "delete s3://{}/{}: {} ({} of {} keys failed)",
                    self.bucket,
                    failed.key().unwrap_or("<unknown>"),
                    failed.message().unwrap_or("no message"),
                    response.errors().len(),
                    batch.len()
                )));
            }
            removed += batch.len() as u64;
            debug!(batch_size = batch.len(), removed, "Removed expired blob batch");
        }

        info!(
            bucket = %self.bucket,
            total_listed,
            removed,
            duration_ms = started.elapsed().as_millis() as u64,
            "S3 blob purge completed"
        );
        Ok(removed)
    }
}
