//! Background jobs run by the task manager.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::broadcast::{event, ConnectionManager};
use crate::database::{ChatDatabase, User};
use crate::discussion::{ImageGroup, ImageGroupKind, MessageImage};
use crate::image_gen::ImageBackend;
use crate::image_prep::encode_base64;
use crate::llm_client::{generate_json, generate_text, GenerationOptions, ModelProvider};
use crate::tags::{SlideSource, SlidesIntent};
use crate::tasks::{TaskHandle, TaskJob};

const MAX_PLANNED_SLIDES: usize = 8;

const SLIDE_PLAN_PROMPT: &str = "You plan illustrated slide shows. Given a topic, reply with JSON only: \
{\"slides\": [\"<image prompt for slide 1>\", \"<image prompt for slide 2>\", ...]}. \
Use between 3 and 8 slides. Each entry is a self-contained image generation prompt.";

const DATA_ZONE_PROMPT: &str = "Condense the following working notes into a compact summary. \
Keep every fact, figure, name and open question. Reply with the summary only.";

#[derive(Debug, Deserialize)]
struct SlidePlan {
    #[serde(default)]
    slides: Vec<String>,
}

/// Renders one image per slide and attaches them to an assistant message.
pub struct SlideshowJob {
    pub db: Arc<ChatDatabase>,
    pub models: Arc<dyn ModelProvider>,
    pub images: Arc<dyn ImageBackend>,
    pub user: User,
    pub discussion_id: String,
    pub message_id: String,
    pub intent: SlidesIntent,
}

impl SlideshowJob {
    async fn plan(&self, handle: &TaskHandle) -> Result<(String, Vec<String>)> {
        match &self.intent.source {
            SlideSource::Explicit(slides) => Ok((slides.join(" / "), slides.clone())),
            SlideSource::Topic(topic) => {
                handle.log(format!("Planning slides for '{}'", topic));
                let model = self.models.model_for(&self.user)?;
                let plan: SlidePlan = generate_json(
                    model.as_ref(),
                    SLIDE_PLAN_PROMPT,
                    topic,
                    &GenerationOptions::from_user(&self.user),
                )
                .await
                .context("Slide planning failed")?;
                let slides: Vec<String> = plan
                    .slides
                    .into_iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .take(MAX_PLANNED_SLIDES)
                    .collect();
                Ok((topic.clone(), slides))
            }
        }
    }

    /// Appends `rendered` to the message and clears its task marker.
    fn attach(&self, prompt: &str, rendered: Vec<String>) -> Result<usize> {
        let mut discussion = self
            .db
            .load_discussion(&self.discussion_id)?
            .with_context(|| format!("Discussion {} no longer exists", self.discussion_id))?;
        let activate = self.user.preferences.activate_generated_images;
        let count = rendered.len();
        let message = discussion
            .message_mut(&self.message_id)
            .with_context(|| format!("Message {} no longer exists", self.message_id))?;
        if !rendered.is_empty() {
            let start = message.images.len();
            message
                .images
                .extend(rendered.into_iter().map(|image| MessageImage {
                    image,
                    active: activate,
                }));
            message.metadata.generated_image_infos.push(ImageGroup {
                id: uuid::Uuid::new_v4().to_string(),
                prompt: prompt.to_string(),
                indices: (start..start + count).collect(),
                kind: ImageGroupKind::Slideshow,
                source_index: None,
            });
        }
        message.metadata.active_task_id = None;
        discussion.commit(&self.db)?;
        Ok(count)
    }
}

#[async_trait]
impl TaskJob for SlideshowJob {
    async fn run(self: Box<Self>, handle: TaskHandle) -> Result<Value> {
        let (prompt, slides) = match self.plan(&handle).await {
            Ok(planned) => planned,
            Err(e) => {
                self.attach("", Vec::new())?;
                return Err(e);
            }
        };
        if slides.is_empty() {
            self.attach(&prompt, Vec::new())?;
            anyhow::bail!("No slides to render");
        }

        let mut rendered = Vec::with_capacity(slides.len());
        for (i, slide) in slides.iter().enumerate() {
            if handle.is_cancelled() {
                break;
            }
            handle.log(format!("Rendering slide {}/{}", i + 1, slides.len()));
            match self
                .images
                .generate(slide, self.intent.width, self.intent.height, 1)
                .await
            {
                Ok(mut images) if !images.is_empty() => {
                    rendered.push(encode_base64(&images.swap_remove(0)));
                }
                Ok(_) => handle.log(format!("Slide {} produced no image", i + 1)),
                Err(e) => {
                    tracing::warn!("Slide {} failed: {:#}", i + 1, e);
                    handle.log(format!("Slide {} failed: {}", i + 1, e));
                }
            }
            handle.set_progress((((i + 1) * 100) / slides.len()) as u8);
        }

        let count = self.attach(&prompt, rendered)?;
        if handle.is_cancelled() {
            anyhow::bail!("Slideshow cancelled after {} slide(s)", count);
        }
        Ok(json!({
            "discussion_id": self.discussion_id,
            "message_id": self.message_id,
            "slides": count,
        }))
    }
}

/// Replaces the discussion data zone with a model-written summary.
pub struct DataZoneJob {
    pub db: Arc<ChatDatabase>,
    pub models: Arc<dyn ModelProvider>,
    pub connections: Arc<ConnectionManager>,
    pub user: User,
    pub discussion_id: String,
}

#[async_trait]
impl TaskJob for DataZoneJob {
    async fn run(self: Box<Self>, handle: TaskHandle) -> Result<Value> {
        let mut discussion = self
            .db
            .load_discussion(&self.discussion_id)?
            .with_context(|| format!("Discussion {} not found", self.discussion_id))?;

        if !discussion.data_zone.trim().is_empty() {
            handle.log("Summarizing discussion data zone");
            let model = self.models.model_for(&self.user)?;
            let summary = generate_text(
                model.as_ref(),
                DATA_ZONE_PROMPT,
                &discussion.data_zone,
                &GenerationOptions::from_user(&self.user),
            )
            .await
            .context("Data zone summary failed")?;
            if handle.is_cancelled() {
                anyhow::bail!("Cancelled before the summary was saved");
            }
            let (summary, _) = crate::llm_client::split_visible_and_thinking(&summary);
            discussion.data_zone = summary.trim().to_string();
        }
        handle.set_progress(80);

        discussion.mark_data_zone_processed();
        discussion.commit(&self.db)?;
        self.connections.send_personal(
            self.user.id,
            event(
                "data_zone_processed",
                json!({ "discussion_id": self.discussion_id }),
            ),
        );
        Ok(json!({
            "discussion_id": self.discussion_id,
            "chars": discussion.data_zone.chars().count(),
        }))
    }
}

/// Deletes the user's discussions that hold at most one message.
pub struct PruneJob {
    pub db: Arc<ChatDatabase>,
    pub user_id: i64,
}

#[async_trait]
impl TaskJob for PruneJob {
    async fn run(self: Box<Self>, handle: TaskHandle) -> Result<Value> {
        let candidates = self.db.list_prunable_discussions(self.user_id)?;
        let total = candidates.len();
        let mut deleted = 0usize;
        for (i, discussion_id) in candidates.iter().enumerate() {
            if handle.is_cancelled() {
                break;
            }
            if self.db.delete_discussion(discussion_id)? {
                deleted += 1;
            }
            handle.set_progress((((i + 1) * 100) / total.max(1)) as u8);
        }
        handle.log(format!("Pruned {} of {} discussion(s)", deleted, total));
        Ok(json!({ "deleted": deleted }))
    }
}
