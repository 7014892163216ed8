//! S3 storage: containers are buckets, folders are key prefixes.

use super::{join_key, unpacked_name, StorageBridge};
use crate::error::AppError;
use crate::package::archive::{validate_entry_name, PackageArchive};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use serde_json::Value;

#[derive(Clone, Debug)]
pub struct S3Storage {
    client: Client,
}

fn s3_error<E: std::error::Error>(op: &str, target: &str, e: E) -> AppError {
    AppError::Internal(format!("s3 {} on {}: {}", op, target, DisplayErrorContext(e)))
}

impl S3Storage {
    pub fn new(client: Client) -> Self {
        S3Storage { client }
    }

    /// Client from the service's `config`: optional `region`, `endpoint` (path-style addressing,
    /// for S3-compatible servers). Credentials come from the default AWS provider chain.
    pub async fn from_config(config: &Value) -> Result<Self, AppError> {
        let text = |key: &str| {
            config
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
        };
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = text("region") {
            loader = loader.region(Region::new(region));
        }
        let sdk_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = text("endpoint") {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Ok(S3Storage::new(Client::from_conf(builder.build())))
    }

    fn folder_prefix(folder: &str) -> Option<String> {
        let folder = folder.trim_matches('/');
        if folder.is_empty() {
            None
        } else {
            Some(format!("{}/", folder))
        }
    }
}

#[async_trait]
impl StorageBridge for S3Storage {
    async fn container_exists(&self, container: &str) -> Result<bool, AppError> {
        if container.is_empty() {
            return Ok(false);
        }
        match self.client.head_bucket().bucket(container).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(s3_error("head_bucket", container, service_error))
                }
            }
        }
    }

    async fn folder_exists(&self, container: &str, folder: &str) -> Result<bool, AppError> {
        if !self.container_exists(container).await? {
            return Ok(false);
        }
        let out = self
            .client
            .list_objects_v2()
            .bucket(container)
            .set_prefix(Self::folder_prefix(folder))
            .max_keys(1)
            .send()
            .await
            .map_err(|e| s3_error("list_objects_v2", container, e))?;
        Ok(!out.contents().is_empty())
    }

    async fn pack_folder(
        &self,
        container: &str,
        folder: &str,
        archive: &mut PackageArchive,
        entry_root: &str,
    ) -> Result<usize, AppError> {
        let prefix = Self::folder_prefix(folder);
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(container)
            .set_prefix(prefix.clone())
            .into_paginator()
            .send();
        let mut packed = 0;
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| s3_error("list_objects_v2", container, e))?;
            for object in page.contents() {
                let key = match object.key() {
                    Some(k) if !k.ends_with('/') => k,
                    _ => continue,
                };
                let relative = match &prefix {
                    Some(p) => key.strip_prefix(p.as_str()).unwrap_or(key),
                    None => key,
                };
                let body = self
                    .client
                    .get_object()
                    .bucket(container)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| s3_error("get_object", key, e))?
                    .body
                    .collect()
                    .await
                    .map_err(|e| s3_error("get_object body", key, e))?;
                archive.write_entry(&join_key(&[entry_root, relative]), body.into_bytes().to_vec())?;
                packed += 1;
            }
        }
        tracing::debug!(bucket = %container, folder, files = packed, "packed s3 folder");
        Ok(packed)
    }

    async fn unpack_archive(
        &self,
        container: &str,
        folder: &str,
        archive: &mut PackageArchive,
        strip_prefix: Option<&str>,
    ) -> Result<usize, AppError> {
        let mut written = 0;
        for (name, bytes) in archive.drain_entries() {
            let relative = match unpacked_name(&name, strip_prefix) {
                Some(r) => r,
                None => continue,
            };
            validate_entry_name(relative).map_err(|e| AppError::BadRequest(e.to_string()))?;
            let key = join_key(&[folder, relative]);
            self.client
                .put_object()
                .bucket(container)
                .key(&key)
                .body(ByteStream::from(bytes))
                .send()
                .await
                .map_err(|e| s3_error("put_object", &key, e))?;
            written += 1;
        }
        tracing::debug!(bucket = %container, folder, files = written, "unpacked archive to s3");
        Ok(written)
    }
}
