//! Remote object storage for pre-staging inputs and fetching outputs.
//!
//! The backend is only entered outside the scheduling loop: one bulk
//! `upload` before reduction starts, one bulk `download` after it proves
//! its answers. Transfers fan out with a bounded level of concurrency on a
//! backend-owned current-thread runtime.

use std::collections::HashSet;

use aws_sdk_s3::primitives::ByteStream;
use camino::Utf8PathBuf;
use futures::StreamExt;
use tracing::debug;

use crate::error::StorageError;
use crate::hash::Hash;
use crate::store;

const CONCURRENT_TRANSFERS: usize = 16;

/// One object to push: local blob path → remote key.
#[derive(Debug, Clone)]
pub struct PutRequest {
    pub path: Utf8PathBuf,
    pub key: Hash,
}

/// One object to pull: remote key → local blob path.
#[derive(Debug, Clone)]
pub struct GetRequest {
    pub key: Hash,
    pub path: Utf8PathBuf,
}

pub trait StorageBackend {
    /// In-memory dedup hint: was this object already pushed (by us or a
    /// previous phase)?
    fn is_available(&self, hash: &Hash) -> bool;

    fn mark_available(&mut self, hash: Hash);

    /// Bulk parallel upload. Every succeeded object is marked available
    /// and reported through `on_each_ok`; the first failure aborts.
    fn upload(
        &mut self,
        requests: &[PutRequest],
        on_each_ok: &mut dyn FnMut(&PutRequest),
    ) -> Result<(), StorageError>;

    /// Bulk parallel download.
    fn download(&mut self, requests: &[GetRequest]) -> Result<(), StorageError>;
}

/// S3-compatible object storage. Endpoint and region are configurable so
/// MinIO-style deployments work unchanged.
pub struct S3Backend {
    runtime: tokio::runtime::Runtime,
    client: aws_sdk_s3::Client,
    bucket: String,
    available: HashSet<Hash>,
}

impl S3Backend {
    pub fn new(
        bucket: impl Into<String>,
        region: Option<String>,
        endpoint: Option<String>,
    ) -> Result<Self, StorageError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let client = runtime.block_on(async {
            let mut loader = aws_config::from_env()
                .behavior_version(aws_config::BehaviorVersion::latest());

            if let Some(region) = region {
                loader = loader.region(aws_config::Region::new(region));
            }
            if let Some(endpoint) = endpoint {
                loader = loader.endpoint_url(endpoint);
            }

            let config = loader.load().await;
            aws_sdk_s3::Client::new(&config)
        });

        Ok(Self {
            runtime,
            client,
            bucket: bucket.into(),
            available: HashSet::new(),
        })
    }
}

impl StorageBackend for S3Backend {
    fn is_available(&self, hash: &Hash) -> bool {
        self.available.contains(hash)
    }

    fn mark_available(&mut self, hash: Hash) {
        self.available.insert(hash);
    }

    fn upload(
        &mut self,
        requests: &[PutRequest],
        on_each_ok: &mut dyn FnMut(&PutRequest),
    ) -> Result<(), StorageError> {
        let client = &self.client;
        let bucket = &self.bucket;

        let results: Vec<Result<usize, StorageError>> = self.runtime.block_on(async {
            futures::stream::iter(requests.iter().enumerate().map(|(i, request)| async move {
                let body = ByteStream::from_path(request.path.as_std_path())
                    .await
                    .map_err(|e| StorageError::Transfer {
                        key: request.key.clone(),
                        reason: e.to_string(),
                    })?;

                client
                    .put_object()
                    .bucket(bucket)
                    .key(request.key.as_str())
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| StorageError::Transfer {
                        key: request.key.clone(),
                        reason: e.to_string(),
                    })?;

                debug!(key = %request.key, "uploaded");
                Ok(i)
            }))
            .buffer_unordered(CONCURRENT_TRANSFERS)
            .collect()
            .await
        });

        for result in results {
            let i = result?;
            self.available.insert(requests[i].key.clone());
            on_each_ok(&requests[i]);
        }

        Ok(())
    }

    fn download(&mut self, requests: &[GetRequest]) -> Result<(), StorageError> {
        let client = &self.client;
        let bucket = &self.bucket;

        let results: Vec<Result<(usize, Vec<u8>), StorageError>> =
            self.runtime.block_on(async {
                futures::stream::iter(requests.iter().enumerate().map(
                    |(i, request)| async move {
                        let transfer_error = |reason: String| StorageError::Transfer {
                            key: request.key.clone(),
                            reason,
                        };

                        let response = client
                            .get_object()
                            .bucket(bucket)
                            .key(request.key.as_str())
                            .send()
                            .await
                            .map_err(|e| transfer_error(e.to_string()))?;

                        let bytes = response
                            .body
                            .collect()
                            .await
                            .map_err(|e| transfer_error(e.to_string()))?
                            .into_bytes();

                        debug!(key = %request.key, "downloaded");
                        Ok((i, bytes.to_vec()))
                    },
                ))
                .buffer_unordered(CONCURRENT_TRANSFERS)
                .collect()
                .await
            });

        for result in results {
            let (i, bytes) = result?;
            let path = &requests[i].path;
            let dir = path
                .parent()
                .map(|p| p.to_owned())
                .unwrap_or_else(|| Utf8PathBuf::from("."));
            std::fs::create_dir_all(&dir)?;
            store::atomic_write(&dir, path, &bytes)?;
        }

        Ok(())
    }
}
