//! Pushes captured photos to Firebase Storage.

use std::{path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};
use log::debug;
use reqwest::{blocking::Client, header::CONTENT_TYPE};
use serde::Deserialize;

use crate::{capture::CapturedImage, config::StorageConfig};

pub const JPEG_CONTENT_TYPE: &str = "image/jpeg";

/// Remote location of one photo: `<folder>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub folder: String,
    pub name: String,
}

impl UploadTarget {
    pub fn for_image(folder: &str, image: &CapturedImage) -> Self {
        UploadTarget {
            folder: folder.trim_matches('/').to_string(),
            name: image.name.clone(),
        }
    }

    pub fn object_key(&self) -> String {
        if self.folder.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.folder, self.name)
        }
    }
}

/// Object metadata echoed back by the storage service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedObject {
    pub name: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Blocking upload; callers run it off the UI thread.
pub trait Uploader: Send + Sync + 'static {
    fn upload(&self, target: &UploadTarget, file: &Path) -> Result<UploadedObject>;
}

pub struct FirebaseUploader {
    client: Client,
    config: StorageConfig,
}

impl FirebaseUploader {
    pub fn new(config: StorageConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("failed to build http client")?;
        Ok(FirebaseUploader { client, config })
    }

    /// `{endpoint}/v0/b/{bucket}/o`
    pub fn objects_url(&self) -> String {
        format!(
            "{}/v0/b/{}/o",
            self.config.endpoint.trim_end_matches('/'),
            self.config.bucket
        )
    }
}

impl Uploader for FirebaseUploader {
    fn upload(&self, target: &UploadTarget, file: &Path) -> Result<UploadedObject> {
        if self.config.bucket.is_empty() {
            return Err(anyhow!("no storage bucket configured"));
        }
        let body = std::fs::read(file).with_context(|| format!("read {}", file.display()))?;
        let key = target.object_key();
        debug!("uploading {} ({} bytes) as {key}", file.display(), body.len());
        let response = self
            .client
            .post(self.objects_url())
            .query(&[("uploadType", "media"), ("name", key.as_str())])
            .header(CONTENT_TYPE, JPEG_CONTENT_TYPE)
            .body(body)
            .send()
            .with_context(|| format!("upload {key}"))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            return Err(anyhow!("upload {key} rejected with {status}: {detail}"));
        }
        response
            .json::<UploadedObject>()
            .with_context(|| format!("upload {key}: unreadable response"))
    }
}
