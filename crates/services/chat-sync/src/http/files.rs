//! Files API: progress-reporting, abortable multipart upload.

use crate::backend::ProgressSender;
use crate::error::Result;
use crate::http::HttpClient;
use crate::types::api::{UploadRequest, UploadedFile};
use bytes::Bytes;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Size of the chunks the request body is streamed in.
const CHUNK_SIZE: usize = 64 * 1024;

/// Files API client.
#[derive(Clone)]
pub struct FilesApi {
    http: HttpClient,
}

/// Split `data` into cheap `Bytes` slices.
fn chunks(data: &Bytes) -> Vec<Bytes> {
    (0..data.len())
        .step_by(CHUNK_SIZE)
        .map(|start| data.slice(start..(start + CHUNK_SIZE).min(data.len())))
        .collect()
}

fn percent(sent: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    u8::try_from(sent.saturating_mul(100) / total).unwrap_or(100)
}

impl FilesApi {
    /// Create a new Files API client.
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    /// Upload a file into a channel.
    ///
    /// Progress is reported as body chunks are handed to the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails, or
    /// [`ChatSyncError::Aborted`](crate::ChatSyncError::Aborted) when `abort` fires.
    pub async fn upload(
        &self,
        req: UploadRequest,
        progress: ProgressSender,
        abort: CancellationToken,
    ) -> Result<UploadedFile> {
        let total = req.file.data.len();
        let mut sent = 0usize;
        let body_progress = progress.clone();
        let stream = futures::stream::iter(chunks(&req.file.data)).map(move |chunk| {
            sent += chunk.len();
            // the receiver may be gone when the caller stopped listening
            let _ = body_progress.send(percent(sent, total));
            Ok::<_, std::io::Error>(chunk)
        });

        let part = Part::stream_with_length(reqwest::Body::wrap_stream(stream), total as u64)
            .file_name(req.file.name.clone())
            .mime_str(&req.file.mime)?;
        let form = Form::new()
            .text("channel_id", req.channel.channel_id.clone())
            .text("channel_type", req.channel.channel_type.to_string())
            .part("file", part);

        debug!(channel = %req.channel, file = %req.file.name, size = total, "POST /v1/chat/upload");
        let uploaded: UploadedFile = self
            .http
            .post_multipart("/v1/chat/upload", form, &abort)
            .await?;
        let _ = progress.send(100);
        Ok(uploaded)
    }
}
