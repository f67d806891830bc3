//! Object-store client for final artifacts.
//!
//! Streams files from disk so a multi-hundred-MB final never sits in RAM,
//! switches to multipart above a size threshold, and read-back verifies
//! every upload with a HEAD. The store is an S3-compatible gateway holding
//! the real credentials; this client presents a static bearer token.

use reqwest::{Body, Client};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::config::{Config, ObjectStoreConfig};

/// Part size for multipart uploads
const PART_SIZE: u64 = 16 * 1024 * 1024;
const CHECKSUM_HEADER: &str = "x-amz-meta-sha256";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("object store not configured")]
    NotConfigured,

    #[error("failed to read {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("read-back verification failed: {0}")]
    Verify(String),
}

/// Proof of a verified upload, persisted into `metadata.json`, the store,
/// and the deferred-retry queue
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UploadReceipt {
    pub url: String,
    pub key: String,
    pub size_bytes: u64,
    pub checksum_sha256: String,
}

#[derive(Clone)]
pub struct ObjectStoreClient {
    client: Client,
    config: ObjectStoreConfig,
}

impl ObjectStoreClient {
    pub fn new(config: &Config) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.object_store.upload_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            config: config.object_store.clone(),
        }
    }

    /// Check if the store is configured
    pub fn is_configured(&self) -> bool {
        !self.config.endpoint.is_empty() && !self.config.bucket.is_empty()
    }

    /// Key layout: `<prefix>/<user_id>/<date>/<booking_id>.mp4`
    pub fn object_key(&self, user_id: &str, date: &str, booking_id: &str) -> String {
        let prefix = self.config.prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("{user_id}/{date}/{booking_id}.mp4")
        } else {
            format!("{prefix}/{user_id}/{date}/{booking_id}.mp4")
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.bucket,
            key
        )
    }

    /// Upload `path` to `key`, multipart when the file is at or above the
    /// configured threshold, and verify with a read-back HEAD.
    pub async fn put_file(&self, key: &str, path: &Path) -> Result<UploadReceipt, UploadError> {
        if !self.is_configured() {
            return Err(UploadError::NotConfigured);
        }

        let size_bytes = std::fs::metadata(path)
            .map_err(|source| UploadError::Io {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        let checksum = file_sha256(path).await.map_err(|source| UploadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        if size_bytes >= self.config.multipart_threshold_bytes {
            self.multipart_put(key, path, size_bytes, &checksum).await?;
        } else {
            self.simple_put(key, path, size_bytes, &checksum).await?;
        }

        self.verify(key, size_bytes, &checksum).await?;

        let receipt = UploadReceipt {
            url: self.object_url(key),
            key: key.to_string(),
            size_bytes,
            checksum_sha256: checksum,
        };
        info!(
            key,
            size_mb = size_bytes as f64 / (1024.0 * 1024.0),
            "Upload verified"
        );
        Ok(receipt)
    }

    /// Single-request streaming PUT
    async fn simple_put(
        &self,
        key: &str,
        path: &Path,
        size_bytes: u64,
        checksum: &str,
    ) -> Result<(), UploadError> {
        let file = File::open(path).await.map_err(|source| UploadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let stream = ReaderStream::new(file);
        let body = Body::wrap_stream(stream);

        self.client
            .put(self.object_url(key))
            .bearer_auth(&self.config.token)
            .header("Content-Type", "video/mp4")
            .header("Content-Length", size_bytes)
            .header(CHECKSUM_HEADER, checksum)
            .body(body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| UploadError::Transport(e.to_string()))?;

        debug!(key, "Simple PUT complete");
        Ok(())
    }

    /// S3-style multipart: initiate, upload parts, complete. Any failure
    /// aborts the multipart session so the store never accumulates orphan
    /// parts.
    async fn multipart_put(
        &self,
        key: &str,
        path: &Path,
        size_bytes: u64,
        checksum: &str,
    ) -> Result<(), UploadError> {
        let url = self.object_url(key);

        let initiate = self
            .client
            .post(format!("{url}?uploads"))
            .bearer_auth(&self.config.token)
            .header("Content-Type", "video/mp4")
            .header(CHECKSUM_HEADER, checksum)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| UploadError::Transport(format!("multipart initiate: {e}")))?
            .text()
            .await
            .map_err(|e| UploadError::Transport(format!("multipart initiate body: {e}")))?;

        let upload_id = extract_tag(&initiate, "UploadId").ok_or_else(|| {
            UploadError::Transport("multipart initiate response missing UploadId".into())
        })?;

        match self.upload_parts(&url, &upload_id, path, size_bytes).await {
            Ok(etags) => {
                let body = complete_body(&etags);
                self.client
                    .post(format!("{url}?uploadId={upload_id}"))
                    .bearer_auth(&self.config.token)
                    .header("Content-Type", "application/xml")
                    .body(body)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| UploadError::Transport(format!("multipart complete: {e}")))?;
                debug!(key, parts = etags.len(), "Multipart upload complete");
                Ok(())
            }
            Err(e) => {
                // Clean abort so a retry starts from scratch
                let abort = self
                    .client
                    .delete(format!("{url}?uploadId={upload_id}"))
                    .bearer_auth(&self.config.token)
                    .send()
                    .await;
                if let Err(abort_err) = abort {
                    warn!("Multipart abort failed for {key}: {abort_err}");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        url: &str,
        upload_id: &str,
        path: &Path,
        size_bytes: u64,
    ) -> Result<Vec<String>, UploadError> {
        let mut file = File::open(path).await.map_err(|source| UploadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let part_count = size_bytes.div_ceil(PART_SIZE);
        let mut etags = Vec::with_capacity(part_count as usize);

        for part_number in 1..=part_count {
            let remaining = size_bytes - (part_number - 1) * PART_SIZE;
            let this_part = remaining.min(PART_SIZE) as usize;

            let mut buf = vec![0u8; this_part];
            file.read_exact(&mut buf)
                .await
                .map_err(|source| UploadError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;

            let response = self
                .client
                .put(format!("{url}?partNumber={part_number}&uploadId={upload_id}"))
                .bearer_auth(&self.config.token)
                .header("Content-Length", this_part)
                .body(buf)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| {
                    UploadError::Transport(format!("part {part_number}/{part_count}: {e}"))
                })?;

            let etag = response
                .headers()
                .get("ETag")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            etags.push(etag);
            debug!(part_number, part_count, "Part uploaded");
        }

        Ok(etags)
    }

    /// HEAD the object back and hold it against what was sent
    async fn verify(&self, key: &str, size_bytes: u64, checksum: &str) -> Result<(), UploadError> {
        let response = self
            .client
            .head(self.object_url(key))
            .bearer_auth(&self.config.token)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| UploadError::Verify(format!("HEAD failed: {e}")))?;

        let remote_size = response
            .headers()
            .get("Content-Length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if remote_size != Some(size_bytes) {
            return Err(UploadError::Verify(format!(
                "size mismatch: sent {size_bytes}, store reports {remote_size:?}"
            )));
        }

        if let Some(remote_checksum) = response
            .headers()
            .get(CHECKSUM_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if remote_checksum != checksum {
                return Err(UploadError::Verify("checksum mismatch".into()));
            }
        }

        Ok(())
    }
}

/// SHA-256 of a file, streamed in 1 MiB chunks
pub async fn file_sha256(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Pull `<tag>value</tag>` out of a small XML response without an XML
/// dependency; the responses here are flat and tiny.
fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].trim().to_string())
}

fn complete_body(etags: &[String]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for (i, etag) in etags.iter().enumerate() {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            i + 1,
            etag
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}
