// projectbackup/src/storage/s3.rs
use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;

use super::{Storage, StorageResult};
use crate::config::SpacesConfig;
use crate::errors::StorageError;

/// S3-compatible object storage (DigitalOcean Spaces, MinIO, B2, AWS).
///
/// Directories are key prefixes. `make_directory` writes an empty `prefix/`
/// marker object so that freshly created, still empty directories show up in
/// listings the same way they do on disk.
pub struct S3Storage {
    client: s3::Client,
    bucket: String,
    folder_prefix: Option<String>,
}

impl S3Storage {
    pub async fn connect(spaces_config: SpacesConfig) -> Self {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&spaces_config.endpoint_url)
            .region(Region::new(spaces_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &spaces_config.access_key_id,
                &spaces_config.secret_access_key,
                None, // session_token
                None, // expiry
                "Static", // provider_name
            ))
            .load()
            .await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(spaces_config.use_path_style)
            .build();

        tracing::debug!(
            endpoint = %spaces_config.endpoint_url,
            bucket = %spaces_config.bucket_name,
            "S3 client configured"
        );

        Self {
            client: s3::Client::from_conf(s3_config),
            bucket: spaces_config.bucket_name,
            folder_prefix: spaces_config.folder_prefix,
        }
    }

    fn key(&self, path: &str) -> String {
        match &self.folder_prefix {
            Some(prefix) => super::join_path(&[prefix, path]),
            None => super::join_path(&[path]),
        }
    }

    fn dir_key(&self, path: &str) -> String {
        format!("{}/", self.key(path))
    }

    /// Every object key below `prefix`, following continuation tokens.
    async fn keys_under(&self, path: &str) -> StorageResult<Vec<String>> {
        let prefix = self.dir_key(path);
        let mut keys = Vec::new();
        let mut continuation_token = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| StorageError::remote(path, DisplayErrorContext(e)))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );

            if response.is_truncated().unwrap_or(false) {
                continuation_token = response.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        Ok(keys)
    }

    /// Strips the configured folder prefix off a key returned by the bucket.
    fn relative(&self, key: &str) -> String {
        let key = key.trim_end_matches('/');
        match &self.folder_prefix {
            Some(prefix) => {
                let prefix = format!("{}/", prefix.trim_matches('/'));
                key.strip_prefix(&prefix).unwrap_or(key).to_string()
            }
            None => key.to_string(),
        }
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await;
        if head.is_ok() {
            return Ok(true);
        }

        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(self.dir_key(path))
            .max_keys(1)
            .send()
            .await
            .map_err(|e| StorageError::remote(path, DisplayErrorContext(e)))?;

        Ok(response.key_count().unwrap_or(0) > 0 || !response.contents().is_empty())
    }

    async fn make_directory(&self, path: &str) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.dir_key(path))
            .body(ByteStream::from_static(b""))
            .send()
            .await
            .map_err(|e| StorageError::remote(path, DisplayErrorContext(e)))?;
        Ok(())
    }

    async fn list_directories(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let list_prefix = self.dir_key(prefix);
        let mut directories = Vec::new();
        let mut continuation_token = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&list_prefix)
                .delimiter("/")
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| StorageError::remote(prefix, DisplayErrorContext(e)))?;

            directories.extend(
                response
                    .common_prefixes()
                    .iter()
                    .filter_map(|common| common.prefix())
                    .map(|key| self.relative(key)),
            );

            if response.is_truncated().unwrap_or(false) {
                continuation_token = response.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        Ok(directories)
    }

    async fn delete_directory(&self, path: &str) -> StorageResult<()> {
        let keys = self.keys_under(path).await?;
        for key in &keys {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| StorageError::remote(key.as_str(), DisplayErrorContext(e)))?;
        }
        tracing::debug!(path, objects = keys.len(), "deleted S3 prefix");
        Ok(())
    }

    async fn put_file(&self, path: &str, source: &Path) -> StorageResult<()> {
        let body = ByteStream::from_path(source)
            .await
            .map_err(|e| StorageError::remote(source.display().to_string(), e))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .body(body)
            .send()
            .await
            .map_err(|e| StorageError::remote(path, DisplayErrorContext(e)))?;
        Ok(())
    }
}
