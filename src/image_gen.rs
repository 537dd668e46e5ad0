//! Text-to-image and image-to-image backends used by the image tags.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::comfy_client::ComfyUIClient;
use crate::config::ComfyUIConfig;

#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Returns `n` encoded images (PNG/JPEG bytes).
    async fn generate(&self, prompt: &str, width: u32, height: u32, n: u32) -> Result<Vec<Vec<u8>>>;

    /// Re-renders `source` guided by `prompt`; `strength` is the denoise amount in `[0, 1]`.
    async fn edit(
        &self,
        source: &[u8],
        prompt: &str,
        strength: f32,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>>;
}

pub struct ComfyImageBackend {
    client: ComfyUIClient,
    config: ComfyUIConfig,
}

impl ComfyImageBackend {
    pub fn new(config: ComfyUIConfig, http: reqwest::Client) -> Self {
        Self {
            client: ComfyUIClient::new(config.api_url.clone(), http),
            config,
        }
    }

    async fn run(&self, workflow: Value) -> Result<Vec<Vec<u8>>> {
        let prompt_id = self
            .client
            .queue_prompt(workflow)
            .await
            .context("Failed to queue prompt")?;
        tracing::info!("Queued image generation: prompt_id={}", prompt_id);

        let infos = self
            .client
            .wait_for_completion(&prompt_id, self.config.timeout_secs)
            .await
            .context("Failed to wait for completion")?;

        let mut images = Vec::with_capacity(infos.len());
        for info in &infos {
            images.push(
                self.client
                    .download_image(info)
                    .await
                    .context("Failed to download generated image")?,
            );
        }
        Ok(images)
    }
}

#[async_trait]
impl ImageBackend for ComfyImageBackend {
    async fn generate(&self, prompt: &str, width: u32, height: u32, n: u32) -> Result<Vec<Vec<u8>>> {
        let workflow = txt2img_workflow(&self.config, prompt, width, height, n, random_seed());
        let mut images = self.run(workflow).await?;
        images.truncate(n as usize);
        Ok(images)
    }

    async fn edit(
        &self,
        source: &[u8],
        prompt: &str,
        strength: f32,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>> {
        let filename = format!("colloquy_edit_{}.png", uuid::Uuid::new_v4().simple());
        let uploaded = self
            .client
            .upload_image(source.to_vec(), &filename)
            .await?;
        let workflow = img2img_workflow(
            &self.config,
            &uploaded,
            prompt,
            strength,
            width,
            height,
            random_seed(),
        );
        self.run(workflow)
            .await?
            .into_iter()
            .next()
            .context("Edit produced no image")
    }
}

fn random_seed() -> u64 {
    // ComfyUI seeds must fit in a JS-safe integer.
    (uuid::Uuid::new_v4().as_u128() as u64) & ((1u64 << 53) - 1)
}

/// Checkpoint, prompt encoders, sampler and save node shared by both graphs.
fn base_nodes(config: &ComfyUIConfig, prompt: &str, seed: u64, denoise: f32, latent_node: &str) -> Value {
    json!({
        "4": {
            "class_type": "CheckpointLoaderSimple",
            "inputs": { "ckpt_name": config.model_name }
        },
        "6": {
            "class_type": "CLIPTextEncode",
            "inputs": { "text": prompt, "clip": ["4", 1] }
        },
        "7": {
            "class_type": "CLIPTextEncode",
            "inputs": { "text": config.negative_prompt, "clip": ["4", 1] }
        },
        "3": {
            "class_type": "KSampler",
            "inputs": {
                "seed": seed,
                "steps": config.steps,
                "cfg": config.cfg_scale,
                "sampler_name": config.sampler,
                "scheduler": config.scheduler,
                "denoise": denoise,
                "model": ["4", 0],
                "positive": ["6", 0],
                "negative": ["7", 0],
                "latent_image": [latent_node, 0]
            }
        },
        "8": {
            "class_type": "VAEDecode",
            "inputs": { "samples": ["3", 0], "vae": ["4", 2] }
        },
        "9": {
            "class_type": "SaveImage",
            "inputs": { "filename_prefix": "colloquy", "images": ["8", 0] }
        }
    })
}

pub fn txt2img_workflow(
    config: &ComfyUIConfig,
    prompt: &str,
    width: u32,
    height: u32,
    batch_size: u32,
    seed: u64,
) -> Value {
    let mut graph = base_nodes(config, prompt, seed, 1.0, "5");
    graph["5"] = json!({
        "class_type": "EmptyLatentImage",
        "inputs": { "width": width, "height": height, "batch_size": batch_size.max(1) }
    });
    graph
}

pub fn img2img_workflow(
    config: &ComfyUIConfig,
    uploaded_image: &str,
    prompt: &str,
    strength: f32,
    width: u32,
    height: u32,
    seed: u64,
) -> Value {
    let mut graph = base_nodes(config, prompt, seed, strength.clamp(0.0, 1.0), "12");
    graph["10"] = json!({
        "class_type": "LoadImage",
        "inputs": { "image": uploaded_image }
    });
    graph["11"] = json!({
        "class_type": "ImageScale",
        "inputs": {
            "image": ["10", 0],
            "upscale_method": "lanczos",
            "width": width,
            "height": height,
            "crop": "disabled"
        }
    });
    graph["12"] = json!({
        "class_type": "VAEEncode",
        "inputs": { "pixels": ["11", 0], "vae": ["4", 2] }
    });
    graph
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Deterministic backend producing tiny PNGs of the requested size.
    #[derive(Default)]
    pub(crate) struct FakeImageBackend {
        pub fail: bool,
        pub delay: Option<std::time::Duration>,
        pub generated: Mutex<Vec<(String, u32, u32, u32)>>,
        pub edits: Mutex<Vec<(String, f32, u32, u32)>>,
    }

    pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::new(width, height));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[async_trait]
    impl ImageBackend for FakeImageBackend {
        async fn generate(&self, prompt: &str, width: u32, height: u32, n: u32) -> Result<Vec<Vec<u8>>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                anyhow::bail!("generator offline");
            }
            self.generated
                .lock()
                .unwrap()
                .push((prompt.to_string(), width, height, n));
            Ok((0..n).map(|_| png_bytes(4, 4)).collect())
        }

        async fn edit(
            &self,
            _source: &[u8],
            prompt: &str,
            strength: f32,
            width: u32,
            height: u32,
        ) -> Result<Vec<u8>> {
            if self.fail {
                anyhow::bail!("generator offline");
            }
            self.edits
                .lock()
                .unwrap()
                .push((prompt.to_string(), strength, width, height));
            Ok(png_bytes(4, 4))
        }
    }

    #[test]
    fn txt2img_graph_carries_prompt_size_and_batch() {
        let config = ComfyUIConfig::default();
        let graph = txt2img_workflow(&config, "sunset", 512, 640, 2, 42);
        assert_eq!(graph["6"]["inputs"]["text"], "sunset");
        assert_eq!(graph["5"]["inputs"]["width"], 512);
        assert_eq!(graph["5"]["inputs"]["height"], 640);
        assert_eq!(graph["5"]["inputs"]["batch_size"], 2);
        assert_eq!(graph["3"]["inputs"]["latent_image"], json!(["5", 0]));
        assert_eq!(graph["3"]["inputs"]["seed"], 42);
    }

    #[test]
    fn img2img_graph_encodes_the_uploaded_image() {
        let config = ComfyUIConfig::default();
        let graph = img2img_workflow(&config, "in/src.png", "add snow", 1.7, 800, 600, 1);
        assert_eq!(graph["10"]["inputs"]["image"], "in/src.png");
        assert_eq!(graph["11"]["inputs"]["width"], 800);
        assert_eq!(graph["3"]["inputs"]["latent_image"], json!(["12", 0]));
        assert_eq!(graph["3"]["inputs"]["denoise"], 1.0);
        assert!(graph.get("5").is_none());
    }

    #[test]
    fn seeds_stay_within_53_bits() {
        for _ in 0..32 {
            assert!(random_seed() < (1u64 << 53));
        }
    }
}
