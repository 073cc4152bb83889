use crate::cleanup::Cleanup;
use eyre::{eyre, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Response envelope of the image server. `"00"` is the only success code.
#[derive(Debug, Deserialize)]
struct UploadReply {
    rescd: Option<String>,
}

/// Multipart image uploader for the remote image server.
///
/// Every upload posts two fields: `img` (the bytes, as image/jpeg) and
/// `img_path` (the remote directory the server should store it under).
#[derive(Clone)]
pub struct ImageUploader {
    client: reqwest::Client,
    url: String,
    cleanup: Cleanup,
}

impl ImageUploader {
    pub fn new(host: &str, port: u16, cleanup: Cleanup) -> Result<ImageUploader> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(3))
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| eyre!("image upload client build failed: {e}"))?;
        Ok(ImageUploader {
            client,
            url: format!("http://{host}:{port}/edge_api/img"),
            cleanup,
        })
    }

    /// Uploads a local file. The file is deleted on success. A missing file
    /// returns `true`: there is nothing left to retry for that record.
    pub async fn post_file(&self, local_path: &str, remote_dir: &str, remote_name: &str) -> bool {
        let path = Path::new(local_path);
        self.cleanup.register_path(path);

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(
                    image = local_path,
                    remote_dir,
                    error = %err,
                    "image file unreadable; skipping upload"
                );
                return true;
            }
        };

        let ok = self.post_bytes(bytes, remote_dir, remote_name).await;
        if ok {
            self.cleanup.remove_image(path);
        }
        ok
    }

    /// Uploads an in-memory image. Network errors and timeouts count as
    /// failure so the record spools and retries later.
    pub async fn post_bytes(&self, bytes: Vec<u8>, remote_dir: &str, remote_name: &str) -> bool {
        let part = match reqwest::multipart::Part::bytes(bytes)
            .file_name(remote_name.to_string())
            .mime_str("image/jpeg")
        {
            Ok(part) => part,
            Err(err) => {
                tracing::error!(remote_dir, error = %err, "multipart build failed");
                return false;
            }
        };
        let form = reqwest::multipart::Form::new()
            .part("img", part)
            .text("img_path", remote_dir.to_string());

        let response = match self.client.post(&self.url).multipart(form).send().await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(remote_dir, error = %err, "image upload request failed");
                return false;
            }
        };

        let reply: UploadReply = match response.json().await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::error!(remote_dir, error = %err, "image upload reply unreadable");
                return false;
            }
        };

        match reply.rescd.as_deref() {
            Some("00") => {
                tracing::info!(remote_dir, remote_name, "image upload success");
                true
            }
            code => {
                tracing::error!(remote_dir, remote_name, res_code = ?code, "image upload rejected");
                false
            }
        }
    }
}
