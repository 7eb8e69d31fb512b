use crate::collaborators::{ImageProcessor, MediaHandle};
use crate::http::build_client;
use async_trait::async_trait;
use reqwest::Client;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media download failed: {0}")]
    Network(String),
    #[error("media body was empty")]
    EmptyBody,
    #[error("scratch storage failed: {0}")]
    Storage(String),
    #[error("image processing failed: {0}")]
    Processing(String),
}

/// Turns a chat media id into a stored media reference.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn ingest(&self, media_id: &str) -> Result<String, MediaError>;
}

#[derive(Clone)]
pub struct ChatMediaClient {
    http: Client,
    data_api_base: String,
    access_token: String,
    scratch_dir: PathBuf,
}

impl ChatMediaClient {
    pub fn new(
        data_api_base: &str,
        access_token: &str,
        scratch_dir: PathBuf,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            http: build_client(timeout, connect_timeout),
            data_api_base: data_api_base.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
            scratch_dir,
        }
    }

    /// Downloads the asset into the scratch directory. Never retries.
    pub async fn fetch(&self, media_id: &str) -> Result<MediaHandle, MediaError> {
        let url = format!(
            "{}/v2/bot/message/{}/content",
            self.data_api_base,
            urlencoding::encode(media_id)
        );
        let mut response = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|err| MediaError::Network(err.to_string()))?;

        if !response.status().is_success() {
            return Err(MediaError::Network(format!("HTTP {}", response.status())));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|err| MediaError::Storage(err.to_string()))?;
        let path = self.scratch_dir.join(scratch_name(media_id));
        let mut file = fs::File::create(&path)
            .await
            .map_err(|err| MediaError::Storage(err.to_string()))?;

        let mut size: u64 = 0;
        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(err) => {
                    discard(&path).await;
                    return Err(MediaError::Network(err.to_string()));
                }
            };
            size += chunk.len() as u64;
            if let Err(err) = file.write_all(&chunk).await {
                discard(&path).await;
                return Err(MediaError::Storage(err.to_string()));
            }
        }
        if let Err(err) = file.flush().await {
            discard(&path).await;
            return Err(MediaError::Storage(err.to_string()));
        }
        drop(file);

        if size == 0 {
            discard(&path).await;
            return Err(MediaError::EmptyBody);
        }

        debug!(target = "intake.media", media_id = %media_id, size, "media downloaded");
        Ok(MediaHandle {
            media_id: media_id.to_string(),
            path,
            size,
            content_type,
        })
    }
}

fn scratch_name(media_id: &str) -> String {
    let safe: String = media_id
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' { ch } else { '_' })
        .collect();
    format!("{safe}-{}.bin", uuid::Uuid::new_v4().simple())
}

async fn discard(path: &Path) {
    if let Err(err) = fs::remove_file(path).await
        && err.kind() != std::io::ErrorKind::NotFound
    {
        warn!(target = "intake.media", path = %path.display(), error = %err, "scratch_cleanup_failed");
    }
}

/// Download, hand to the image processor, clean up the scratch file.
pub struct MediaIngest {
    client: ChatMediaClient,
    processor: Arc<dyn ImageProcessor>,
}

impl MediaIngest {
    pub fn new(client: ChatMediaClient, processor: Arc<dyn ImageProcessor>) -> Self {
        Self { client, processor }
    }
}

#[async_trait]
impl MediaSource for MediaIngest {
    async fn ingest(&self, media_id: &str) -> Result<String, MediaError> {
        let handle = self.client.fetch(media_id).await?;
        let result = self
            .processor
            .process(&handle)
            .await
            .map_err(|err| MediaError::Processing(err.to_string()));
        discard(&handle.path).await;
        result
    }
}
