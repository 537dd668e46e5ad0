use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize)]
pub struct QueuePromptRequest {
    pub prompt: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct QueuePromptResponse {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub outputs: HashMap<String, OutputNode>,
    pub status: Option<StatusInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputNode {
    pub images: Option<Vec<ImageInfo>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageInfo {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type")]
    pub image_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusInfo {
    pub status_str: Option<String>,
    pub completed: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    name: String,
    #[serde(default)]
    subfolder: String,
}

/// Client for ComfyUI API
pub struct ComfyUIClient {
    api_url: String,
    client: Client,
}

impl ComfyUIClient {
    pub fn new(api_url: impl Into<String>, client: Client) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Queue a workflow for execution
    pub async fn queue_prompt(&self, workflow: serde_json::Value) -> Result<String> {
        let url = format!("{}/prompt", self.api_url);

        let request = QueuePromptRequest {
            prompt: workflow,
            client_id: None,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send prompt to ComfyUI")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("ComfyUI API error {}: {}", status, body);
        }

        let result: QueuePromptResponse = response
            .json()
            .await
            .context("Failed to parse ComfyUI response")?;

        Ok(result.prompt_id)
    }

    pub async fn get_history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>> {
        let url = format!("{}/history/{}", self.api_url, prompt_id);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to get history from ComfyUI")?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to get history: {}", response.status());
        }

        let history: HashMap<String, HistoryEntry> = response
            .json()
            .await
            .context("Failed to parse history response")?;

        Ok(history.get(prompt_id).cloned())
    }

    /// Polls until the prompt finishes and returns every image it produced, in node order.
    pub async fn wait_for_completion(
        &self,
        prompt_id: &str,
        timeout_secs: u64,
    ) -> Result<Vec<ImageInfo>> {
        let start = std::time::Instant::now();
        let timeout = Duration::from_secs(timeout_secs);

        loop {
            if start.elapsed() > timeout {
                anyhow::bail!("Timeout waiting for ComfyUI to complete");
            }

            if let Some(history) = self.get_history(prompt_id).await? {
                if let Some(status) = &history.status {
                    if status.status_str.as_deref() == Some("error") {
                        anyhow::bail!("ComfyUI reported an execution error for {}", prompt_id);
                    }
                    if status.completed == Some(true) {
                        let images = collect_images(&history);
                        if images.is_empty() {
                            anyhow::bail!("Workflow completed but no image found");
                        }
                        tracing::info!("ComfyUI prompt {} produced {} image(s)", prompt_id, images.len());
                        return Ok(images);
                    }
                }
            }

            sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn download_image(&self, image_info: &ImageInfo) -> Result<Vec<u8>> {
        let url = format!("{}/view", self.api_url);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("filename", image_info.filename.as_str()),
                ("subfolder", image_info.subfolder.as_str()),
                ("type", image_info.image_type.as_str()),
            ])
            .send()
            .await
            .context("Failed to download image from ComfyUI")?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to download image: {}", response.status());
        }

        let bytes = response.bytes().await.context("Failed to read image bytes")?;
        Ok(bytes.to_vec())
    }

    /// Uploads an input image and returns the name a `LoadImage` node should reference.
    pub async fn upload_image(&self, bytes: Vec<u8>, filename: &str) -> Result<String> {
        let url = format!("{}/upload/image", self.api_url);
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("overwrite", "true");

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .context("Failed to upload image to ComfyUI")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("ComfyUI upload error {}: {}", status, body);
        }

        let uploaded: UploadResponse = response
            .json()
            .await
            .context("Failed to parse ComfyUI upload response")?;
        Ok(if uploaded.subfolder.is_empty() {
            uploaded.name
        } else {
            format!("{}/{}", uploaded.subfolder, uploaded.name)
        })
    }

    pub async fn test_connection(&self) -> Result<()> {
        let url = format!("{}/history", self.api_url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to connect to ComfyUI")?;

        if !response.status().is_success() {
            anyhow::bail!("ComfyUI returned error: {}", response.status());
        }

        Ok(())
    }
}

fn collect_images(history: &HistoryEntry) -> Vec<ImageInfo> {
    let mut node_ids: Vec<&String> = history.outputs.keys().collect();
    node_ids.sort();
    node_ids
        .into_iter()
        .filter_map(|id| history.outputs.get(id))
        .filter_map(|node| node.images.as_ref())
        .flatten()
        .cloned()
        .collect()
}
