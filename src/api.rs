// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Remote endpoints consumed by the upload protocol

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::ApiConfig;
use crate::error::{UploadError, UploadResult};
use crate::protocol::InputLogEvent;

/// Body of a segment transfer
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Parameters of a destination request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DestinationRequest {
    pub session_id: String,
    pub sequence: u64,
    pub start_ms: u64,
    pub end_ms: u64,
    pub content_type: String,
}

/// A presigned place to put segment bytes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadDestination {
    pub remote_segment_id: String,
    pub destination_url: String,
    /// Seconds the destination stays valid
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[async_trait]
pub trait UploadApi: Send + Sync {
    async fn request_upload_destination(
        &self,
        request: &DestinationRequest,
    ) -> UploadResult<UploadDestination>;

    /// Dropping the returned future aborts the transfer
    async fn put_bytes(
        &self,
        destination_url: &str,
        content_type: &str,
        content_length: u64,
        body: ByteStream,
    ) -> UploadResult<()>;

    /// Idempotent
    async fn notify_upload_complete(
        &self,
        session_id: &str,
        remote_segment_id: &str,
    ) -> UploadResult<()>;

    async fn upload_input_logs(
        &self,
        session_id: &str,
        remote_segment_id: &str,
        destination_url: &str,
        logs: &[InputLogEvent],
    ) -> UploadResult<()>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LogUpload<'a> {
    destination_url: &'a str,
    logs: &'a [InputLogEvent],
}

/// [`UploadApi`] over HTTP
pub struct HttpUploadApi {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpUploadApi {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = reqwest::ClientBuilder::new()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        })
    }

    fn segments_url(&self, session_id: &str) -> String {
        format!("{}/sessions/{}/segments", self.base_url, session_id)
    }

    // Presigned destinations carry their own credentials, so the token is
    // only attached to origin API calls.
    fn api_post(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(url);
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

async fn check(response: Response) -> UploadResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        Err(UploadError::Transient(format!("{}: {}", status, body)))
    } else {
        Err(UploadError::Rejected {
            status: status.as_u16(),
            message: body,
        })
    }
}

#[async_trait]
impl UploadApi for HttpUploadApi {
    async fn request_upload_destination(
        &self,
        request: &DestinationRequest,
    ) -> UploadResult<UploadDestination> {
        let url = format!("{}/upload-url", self.segments_url(&request.session_id));
        let response = self.api_post(&url).json(request).send().await?;
        let destination = check(response).await?.json::<UploadDestination>().await?;
        debug!(
            "Destination for {} #{}: {}",
            request.session_id, request.sequence, destination.remote_segment_id
        );
        Ok(destination)
    }

    async fn put_bytes(
        &self,
        destination_url: &str,
        content_type: &str,
        content_length: u64,
        body: ByteStream,
    ) -> UploadResult<()> {
        let response = self
            .client
            .put(destination_url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::CONTENT_LENGTH, content_length)
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn notify_upload_complete(
        &self,
        session_id: &str,
        remote_segment_id: &str,
    ) -> UploadResult<()> {
        let url = format!(
            "{}/{}/complete",
            self.segments_url(session_id),
            remote_segment_id
        );
        let response = self.api_post(&url).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn upload_input_logs(
        &self,
        session_id: &str,
        remote_segment_id: &str,
        destination_url: &str,
        logs: &[InputLogEvent],
    ) -> UploadResult<()> {
        let url = format!("{}/{}/logs", self.segments_url(session_id), remote_segment_id);
        let response = self
            .api_post(&url)
            .json(&LogUpload {
                destination_url,
                logs,
            })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let api = HttpUploadApi::new(&ApiConfig {
            url: "https://api.example.com/v1/".to_string(),
            api_token: None,
            timeout_seconds: 5,
        })
        .unwrap();
        assert_eq!(
            api.segments_url("s-1"),
            "https://api.example.com/v1/sessions/s-1/segments"
        );
    }

    #[test]
    fn test_destination_wire_format() {
        let destination: UploadDestination = serde_json::from_str(
            r#"{"remoteSegmentId":"r-9","destinationUrl":"https://bucket/x?sig=1","expiresIn":900}"#,
        )
        .unwrap();
        assert_eq!(destination.remote_segment_id, "r-9");
        assert_eq!(destination.expires_in, Some(900));
    }
}
