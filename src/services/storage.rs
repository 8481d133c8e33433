use s3::creds::Credentials;
use s3::{Bucket, Region};

/// Durable object storage for imported media.
#[async_trait::async_trait]
pub trait RemoteFileStore: Send + Sync {
    /// Store `data` under `key`, returning the key the object is reachable by.
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<String, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Client for S3-compatible object storage (R2, MinIO, S3).
pub struct S3FileStore {
    bucket: Box<Bucket>,
}

impl S3FileStore {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }
}

#[async_trait::async_trait]
impl RemoteFileStore for S3FileStore {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<String, StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, content_type)
            .await?;
        let code = response.status_code();
        if !(200..300).contains(&code) {
            return Err(StorageError::Status { key: key.to_string(), code });
        }
        Ok(key.to_string())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let response = self.bucket.delete_object(key).await?;
        let code = response.status_code();
        // Deleting a missing object is not an error.
        if !(200..300).contains(&code) && code != 404 {
            return Err(StorageError::Status { key: key.to_string(), code });
        }
        Ok(())
    }
}

/// Storage key for one file of an asset: `media/{asset}/{attempt}/{stem}.{ext}`.
///
/// Each import attempt writes under its own prefix, so rolling back a failed
/// attempt never touches objects a committed resource points to.
pub fn storage_key(
    asset_identifier: uuid::Uuid,
    attempt: uuid::Uuid,
    file_stem: &str,
    extension: &str,
) -> String {
    format!("media/{}/{}/{}.{}", asset_identifier, attempt, file_stem, extension)
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Storage returned HTTP {code} for {key}")]
    Status { key: String, code: u16 },

    #[error("Storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Configuration problems will not fix themselves on retry.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StorageError::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_storage_key_is_scoped_by_attempt() {
        let asset = Uuid::new_v4();
        let first = storage_key(asset, Uuid::new_v4(), "thumb-320", "jpg");
        let second = storage_key(asset, Uuid::new_v4(), "thumb-320", "jpg");
        assert!(first.starts_with(&format!("media/{asset}/")));
        assert!(first.ends_with("/thumb-320.jpg"));
        assert_ne!(first, second);
    }
}
