use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use bytes::Bytes;
use futures::stream::{self, TryStreamExt};
use thiserror::Error;

use crate::args::S3Args;

/// Retry budget for a single put: 3 attempts, 1 s initial backoff, doubled.
const PUT_ATTEMPTS: u32 = 3;
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum StoreError {
    /// Worth retrying: network failure, timeout, throttling, 5xx
    #[error("transient object-store error: {0}")]
    Transient(String),
    /// Do not retry: auth, missing bucket, 4xx
    #[error("permanent object-store error: {0}")]
    Permanent(String),
    /// Object storage is not configured; the feature stays disabled
    #[error("object store configuration missing")]
    ConfigMissing,
}

/// One object to upload.
#[derive(Debug, Clone)]
pub struct PutRequest {
    pub key: String,
    pub body: Bytes,
    pub content_type: &'static str,
    pub cache_control: &'static str,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Single put, no retry. Callers wanting retry go through [`put_with_retry`].
    async fn put(&self, req: &PutRequest) -> Result<(), StoreError>;

    /// All keys under a prefix, in listing order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Delete everything under a prefix; returns the number of objects removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError>;
}

/// Put with exponential backoff on transient failures.
pub async fn put_with_retry(store: &dyn ObjectStore, req: &PutRequest) -> Result<(), StoreError> {
    let mut backoff = BACKOFF_INITIAL;
    let mut last_err = None;
    for attempt in 1..=PUT_ATTEMPTS {
        match store.put(req).await {
            Ok(()) => return Ok(()),
            Err(e @ StoreError::Transient(_)) => {
                tracing::warn!(key = %req.key, attempt, error = %e, "transient upload failure");
                last_err = Some(e);
                if attempt < PUT_ATTEMPTS {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| StoreError::Transient("upload failed".to_string())))
}

/// Upload a set of objects with bounded in-flight concurrency. Fails on the
/// first object that exhausts its retries.
pub async fn put_many(
    store: &dyn ObjectStore,
    requests: Vec<PutRequest>,
    concurrency: usize,
) -> Result<usize, StoreError> {
    let total = requests.len();
    stream::iter(requests.into_iter().map(Ok::<_, StoreError>))
        .try_for_each_concurrent(concurrency.max(1), |req| async move {
            put_with_retry(store, &req).await
        })
        .await?;
    Ok(total)
}

/// S3 (or S3-compatible) backend.
pub struct S3Store {
    client: S3Client,
    bucket: String,
}

impl S3Store {
    /// Build the store from CLI args. Returns `ConfigMissing` when no
    /// bucket is configured so callers can leave the feature disabled.
    pub async fn from_args(args: &S3Args) -> Result<Self, StoreError> {
        let Some(ref bucket) = args.bucket else {
            return Err(StoreError::ConfigMissing);
        };

        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(args.region.clone()));
        if let Some(ref endpoint) = args.endpoint {
            config_loader = config_loader.endpoint_url(endpoint);
        }
        let config = config_loader.load().await;

        Ok(Self {
            client: S3Client::new(&config),
            bucket: bucket.clone(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn classify<E: std::fmt::Debug>(err: SdkError<E>) -> StoreError {
    match &err {
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            let detail = format!("status {}: {:?}", status, ctx.err());
            if status >= 500 || status == 429 {
                StoreError::Transient(detail)
            } else {
                StoreError::Permanent(detail)
            }
        }
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            StoreError::Transient(format!("{err}"))
        }
        _ => StoreError::Permanent(format!("{err}")),
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, req: &PutRequest) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&req.key)
            .body(ByteStream::from(req.body.clone()))
            .content_type(req.content_type)
            .cache_control(req.cache_control)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(classify)?;

            if let Some(contents) = response.contents {
                for object in contents {
                    if let Some(key) = object.key {
                        keys.push(key);
                    }
                }
            }

            if response.is_truncated.unwrap_or(false) {
                continuation_token = response.next_continuation_token;
            } else {
                break;
            }
        }

        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let keys = self.list(prefix).await?;
        let mut deleted = 0;

        // DeleteObjects caps at 1000 keys per request
        for chunk in keys.chunks(1000) {
            let identifiers: Vec<ObjectIdentifier> = chunk
                .iter()
                .map(|key| {
                    ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .map_err(|e| StoreError::Permanent(e.to_string()))
                })
                .collect::<Result<_, _>>()?;

            let delete = Delete::builder()
                .set_objects(Some(identifiers))
                .build()
                .map_err(|e| StoreError::Permanent(e.to_string()))?;

            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(classify)?;
            deleted += chunk.len();
        }

        Ok(deleted)
    }
}
