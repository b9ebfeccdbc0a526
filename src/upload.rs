//! Optional remote upload of rendered artifacts

use crate::{ScreenshotError, UploadConfig};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use tracing::debug;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `key`, returning its public URL
    async fn upload(&self, key: &str, data: Bytes, content_type: &str) -> Result<String, ScreenshotError>;
}

/// S3 or S3-compatible object storage
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
    public_base_url: String,
}

impl S3ObjectStore {
    /// Build a client from the ambient AWS credential chain
    pub async fn from_config(config: &UploadConfig) -> Self {
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = aws_sdk_s3::Client::from_conf(builder.build());

        Self {
            client,
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
            public_base_url: public_base_url(config),
        }
    }

    pub fn object_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

fn public_base_url(config: &UploadConfig) -> String {
    match (&config.public_base_url, &config.endpoint) {
        (Some(base), _) => base.trim_end_matches('/').to_string(),
        (None, Some(endpoint)) => format!("{}/{}", endpoint.trim_end_matches('/'), config.bucket),
        (None, None) => format!("https://{}.s3.{}.amazonaws.com", config.bucket, config.region),
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn upload(&self, key: &str, data: Bytes, content_type: &str) -> Result<String, ScreenshotError> {
        let object_key = self.object_key(key);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| ScreenshotError::UploadFailed(e.to_string()))?;

        debug!("Uploaded {} to bucket {}", object_key, self.bucket);
        Ok(format!("{}/{}", self.public_base_url, object_key))
    }
}
