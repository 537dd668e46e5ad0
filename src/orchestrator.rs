//! One chat turn, end to end.
//!
//! [`TurnOrchestrator::start_turn`] does the permission checks on the caller's
//! thread, then hands the turn to a dedicated worker thread with its own runtime.
//! The worker emits [`Frame`]s into a flume channel whose receiver becomes the
//! NDJSON response body.

use anyhow::{Context, Result};
use chrono::Local;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::broadcast::{event, ConnectionManager};
use crate::config::ServerConfig;
use crate::context::{ContextBuilder, TurnContext};
use crate::database::{ChatDatabase, User};
use crate::discussion::{
    Discussion, ImageGroup, ImageGroupKind, MessageImage, NewMessage, SenderType,
};
use crate::error::ApiError;
use crate::image_gen::ImageBackend;
use crate::image_prep::{decode_base64_image, encode_base64, prepare_image};
use crate::jobs::SlideshowJob;
use crate::llm_client::{
    generate_text, split_visible_and_thinking, ChatMessage, GenerationOptions, LanguageModel,
    ModelProvider,
};
use crate::storage::{random_prefixed_name, DataPaths};
use crate::streaming::{drive, CancelFlag, FinalizeData, Frame, StepStatus, TurnStream};
use crate::tags::{
    infer_dimensions, parse_edit_tags, parse_generate_tags, parse_memory_tags, parse_slides_tags,
    resolve_source_index, MemoryIntent, SlidesIntent, FALLBACK_DIMENSION,
};
use crate::tasks::TaskManager;
use crate::tools::ToolContext;
use crate::web_search::WebSearchAgent;

const TITLE_PROMPT: &str = "Write a short title (at most six words) for the conversation \
that starts with the exchange below. Reply with the title only.";
const TITLE_MAX_TOKENS: u32 = 32;
const TITLE_MAX_CHARS: usize = 80;

/// Inputs of one `chat` request.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub discussion_id: String,
    pub prompt: String,
    /// References into the user's temporary upload area.
    pub image_refs: Vec<String>,
    pub parent_message_id: Option<String>,
    pub is_resend: bool,
    pub web_search_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Preparing,
    Searching,
    Generating,
    TagProcessing,
    Persisting,
    Broadcasting,
    Done,
    Canceled,
    Failed,
}

/// Collaborators shared by every turn.
pub struct TurnServices {
    pub db: Arc<ChatDatabase>,
    pub paths: DataPaths,
    pub config: Arc<ServerConfig>,
    pub models: Arc<dyn ModelProvider>,
    pub context: ContextBuilder,
    pub search: Option<WebSearchAgent>,
    pub images: Option<Arc<dyn ImageBackend>>,
    pub tasks: Arc<TaskManager>,
    pub connections: Arc<ConnectionManager>,
}

type TurnKey = (i64, String);
type ActiveTurns = Arc<Mutex<HashMap<TurnKey, CancelFlag>>>;

pub struct TurnOrchestrator {
    services: Arc<TurnServices>,
    active: ActiveTurns,
}

impl TurnOrchestrator {
    pub fn new(services: TurnServices) -> Self {
        Self {
            services: Arc::new(services),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn services(&self) -> &Arc<TurnServices> {
        &self.services
    }

    /// Validates the request and starts the turn. Errors returned here happen before
    /// any frame is produced; later failures arrive as `error` frames.
    pub fn start_turn(
        &self,
        user: User,
        request: TurnRequest,
    ) -> Result<flume::Receiver<Frame>, ApiError> {
        let db = &self.services.db;
        let discussion = db
            .load_discussion(&request.discussion_id)?
            .ok_or_else(|| {
                ApiError::NotFound(format!("discussion '{}' not found", request.discussion_id))
            })?;
        match db.discussion_access(user.id, &discussion.id)? {
            Some(access) if access.can_interact() => {}
            _ => {
                return Err(ApiError::Forbidden(
                    "you cannot post in this discussion".to_string(),
                ))
            }
        }
        if let Some(parent) = request.parent_message_id.as_deref() {
            if discussion.message(parent).is_none() {
                return Err(ApiError::BadRequest(format!("unknown parent message '{}'", parent)));
            }
        }
        if request.is_resend {
            let parent = request
                .parent_message_id
                .as_deref()
                .and_then(|id| discussion.message(id));
            if !matches!(parent, Some(m) if m.sender_type == SenderType::User) {
                return Err(ApiError::BadRequest(
                    "a resend must point at a user message".to_string(),
                ));
            }
        } else if request.prompt.trim().is_empty() && request.image_refs.is_empty() {
            return Err(ApiError::BadRequest("empty prompt".to_string()));
        }

        let cancel = CancelFlag::new();
        let key: TurnKey = (user.id, discussion.id.clone());
        if let Ok(mut active) = self.active.lock() {
            active.insert(key.clone(), cancel.clone());
        }

        let (tx, rx) = flume::unbounded();
        let services = self.services.clone();
        let active = self.active.clone();
        let worker_key = key.clone();
        let worker_cancel = cancel.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("turn-{}", &discussion.id[..discussion.id.len().min(8)]))
            .spawn(move || {
                let mut stream = TurnStream::new(tx, worker_cancel.clone());
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => {
                        let turn = Turn {
                            services,
                            user,
                            request,
                            discussion,
                            temp_uploads: Vec::new(),
                        };
                        rt.block_on(turn.run(&mut stream));
                    }
                    Err(e) => {
                        tracing::error!("Turn runtime failed to start: {}", e);
                        stream.error("The server could not start this turn");
                    }
                }
                release(&active, &worker_key, &worker_cancel);
            });

        if let Err(e) = spawned {
            release(&self.active, &key, &cancel);
            return Err(ApiError::Internal(format!("failed to spawn turn worker: {}", e)));
        }
        Ok(rx)
    }

    /// Flags the caller's running turn in `discussion_id`. Returns `false` if none runs.
    pub fn stop_generation(&self, user_id: i64, discussion_id: &str) -> bool {
        let Ok(active) = self.active.lock() else {
            return false;
        };
        match active.get(&(user_id, discussion_id.to_string())) {
            Some(flag) => {
                flag.cancel();
                tracing::info!("Stop requested for discussion {} by user {}", discussion_id, user_id);
                true
            }
            None => false,
        }
    }
}

fn release(active: &Mutex<HashMap<TurnKey, CancelFlag>>, key: &TurnKey, flag: &CancelFlag) {
    if let Ok(mut active) = active.lock() {
        if active.get(key).is_some_and(|current| current.ptr_eq(flag)) {
            active.remove(key);
        }
    }
}

struct Turn {
    services: Arc<TurnServices>,
    user: User,
    request: TurnRequest,
    discussion: Discussion,
    temp_uploads: Vec<PathBuf>,
}

impl Turn {
    fn enter(&self, phase: TurnPhase) {
        tracing::debug!("Turn in {} -> {:?}", self.discussion.id, phase);
    }

    async fn run(mut self, stream: &mut TurnStream) -> TurnPhase {
        let phase = match self.execute(stream).await {
            Ok(phase) => phase,
            Err(e) => {
                tracing::error!("Turn in {} failed: {:#}", self.discussion.id, e);
                stream.error(format!("{:#}", e));
                TurnPhase::Failed
            }
        };
        self.enter(phase);
        self.cleanup_temp_uploads().await;
        phase
    }

    async fn execute(&mut self, stream: &mut TurnStream) -> Result<TurnPhase> {
        self.enter(TurnPhase::Preparing);
        let context = self
            .services
            .context
            .build(&self.user, &self.discussion, Local::now())
            .await
            .context("Failed to build turn context")?;
        let uploads = self.resolve_uploads().await;
        let user_message_id = self.persist_user_message(uploads)?;
        let model = self.services.models.model_for(&self.user)?;

        let mut augmented_prompt = None;
        let mut sources = Vec::new();
        if self.request.web_search_enabled {
            if let Some(agent) = &self.services.search {
                self.enter(TurnPhase::Searching);
                let text = self
                    .discussion
                    .message(&user_message_id)
                    .map(|m| m.content.clone())
                    .unwrap_or_default();
                if let Some(augmentation) = agent
                    .augment(model.as_ref(), &self.user.preferences, &text, stream)
                    .await
                {
                    augmented_prompt = Some(augmentation.prompt);
                    sources.extend(augmentation.sources);
                }
            }
        }
        if stream.is_cancelled() {
            return Ok(TurnPhase::Canceled);
        }

        self.enter(TurnPhase::Generating);
        let messages = self.history(&context, &user_message_id, augmented_prompt.as_deref());
        let tool_ctx = ToolContext {
            user_id: self.user.id,
            username: self.user.username.clone(),
            discussion_id: self.discussion.id.clone(),
            allowed_tools: None,
        };
        let outcome = drive(
            model.as_ref(),
            messages,
            &context.tools,
            &tool_ctx,
            &GenerationOptions::from_user(&self.user),
            self.user.preferences.rag_n_hops,
            stream,
        )
        .await?;
        if outcome.cancelled {
            return Ok(TurnPhase::Canceled);
        }
        sources.extend(outcome.sources.iter().cloned());
        let metrics = stream.metrics(outcome.tokens);

        self.enter(TurnPhase::TagProcessing);
        let prefs = self.user.preferences.clone();
        let mut content = if prefs.show_reasoning {
            outcome.raw_content.clone()
        } else {
            outcome.visible_content.clone()
        };
        if prefs.memory_enabled {
            content = self.apply_memory_tags(&content);
        }
        let sender = context
            .personality
            .as_ref()
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "assistant".to_string());
        let ai_message_id = self.discussion.add_message(NewMessage {
            parent_id: Some(user_message_id.clone()),
            sender,
            sender_type: SenderType::Assistant,
            content: content.clone(),
            images: Vec::new(),
        })?;
        self.apply_generate_tags(&ai_message_id, &content, stream).await;
        let slideshows = self.schedule_slideshows(&ai_message_id, &content, stream);
        self.apply_edit_tags(&ai_message_id, &user_message_id, &content, stream)
            .await;

        self.enter(TurnPhase::Persisting);
        let events = stream.take_events();
        if let Some(message) = self.discussion.message_mut(&ai_message_id) {
            message.binding_name = Some(model.binding_name().to_string());
            message.model_name = Some(model.model_name().to_string());
            message.tokens = Some(outcome.tokens as u32);
            message.metadata.ttft_ms = metrics.ttft_ms;
            message.metadata.tps = Some(metrics.tps);
            message.metadata.sources = sources
                .iter()
                .filter_map(|s| serde_json::to_value(s).ok())
                .collect();
            message.metadata.events = events;
            if !outcome.reasoning.is_empty() {
                message.metadata.reasoning = Some(outcome.reasoning.join("\n\n"));
            }
        }
        if let Err(e) = self.discussion.commit(&self.services.db) {
            for (task_id, _) in &slideshows {
                self.services
                    .tasks
                    .fail_unstarted(task_id, "The reply carrying this slideshow was not saved");
            }
            return Err(e).context("Failed to save the assistant reply");
        }

        let new_title = self
            .auto_title(model.as_ref(), &user_message_id, &content, stream)
            .await;
        // Queued only once this turn is done writing the discussion.
        self.enqueue_slideshows(&ai_message_id, slideshows);

        let user_message = self.discussion.message(&user_message_id).cloned();
        let ai_message = self.discussion.message(&ai_message_id).cloned();
        if let (Some(user_message), Some(ai_message)) = (user_message, ai_message) {
            stream.emit(Frame::Finalize {
                data: Box::new(FinalizeData {
                    user_message,
                    ai_message,
                }),
                new_title,
            });
        }

        self.enter(TurnPhase::Broadcasting);
        self.notify_participants(&ai_message_id);
        Ok(TurnPhase::Done)
    }

    // ---- preparation ----

    /// Moves each upload into the discussion's asset area and returns prepared base64.
    async fn resolve_uploads(&mut self) -> Vec<String> {
        if self.request.image_refs.is_empty() {
            return Vec::new();
        }
        let username = self.user.username.clone();
        let (max_width, max_height) = self.user.preferences.image_caps(&self.services.config);
        let assets = self
            .services
            .paths
            .discussion_assets_dir(&username, &self.discussion.id);

        let mut images = Vec::new();
        for reference in &self.request.image_refs {
            let Some(temp) = self.services.paths.resolve_temp_upload(&username, reference) else {
                tracing::warn!("Ignoring unusable upload reference {:?}", reference);
                continue;
            };
            self.temp_uploads.push(temp.clone());
            match move_upload(&temp, &assets).await {
                Ok(bytes) => images.push(prepare_image(&encode_base64(&bytes), max_width, max_height)),
                Err(e) => tracing::warn!("Upload {:?} skipped: {:#}", reference, e),
            }
        }
        images
    }

    async fn cleanup_temp_uploads(&self) {
        for path in &self.temp_uploads {
            match tokio::fs::remove_file(path).await {
                Ok(()) => tracing::debug!("Removed leftover upload {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove upload {:?}: {}", path, e),
            }
        }
    }

    /// Returns the id of the user message this turn answers.
    fn persist_user_message(&mut self, images: Vec<String>) -> Result<String> {
        if self.request.is_resend {
            return self
                .request
                .parent_message_id
                .clone()
                .context("Resend without a parent message");
        }
        let parent_id = self
            .request
            .parent_message_id
            .clone()
            .or_else(|| self.discussion.active_branch_id().map(str::to_string));
        let id = self.discussion.add_message(NewMessage {
            parent_id,
            sender: self.user.username.clone(),
            sender_type: SenderType::User,
            content: self.request.prompt.clone(),
            images,
        })?;
        self.discussion
            .commit(&self.services.db)
            .context("Failed to save the user message")?;
        Ok(id)
    }

    fn history(
        &self,
        context: &TurnContext,
        user_message_id: &str,
        augmented_prompt: Option<&str>,
    ) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::with_images(
            "system",
            context.system_prompt.clone(),
            &self.discussion.active_discussion_images(),
        )];
        for message in self.discussion.get_branch(user_message_id) {
            let role = match message.sender_type {
                SenderType::User => "user",
                SenderType::Assistant => "assistant",
                SenderType::System => "system",
            };
            let text = match augmented_prompt {
                Some(prompt) if message.id == user_message_id => prompt,
                _ => message.content.as_str(),
            };
            let images: Vec<String> = message.active_images().map(str::to_string).collect();
            messages.push(ChatMessage::with_images(role, text, &images));
        }
        messages
    }

    // ---- tags ----

    /// Creates first, then applies updates and deletes against the refreshed list.
    fn apply_memory_tags(&self, content: &str) -> String {
        let pass = parse_memory_tags(content);
        if pass.intents.is_empty() {
            return content.to_string();
        }
        let db = &self.services.db;
        let user_id = self.user.id;
        let (mut created, mut updated, mut deleted) = (0usize, 0usize, 0usize);

        for intent in &pass.intents {
            if let MemoryIntent::Create { title, content } = intent {
                match db.add_memory(user_id, title, content) {
                    Ok(_) => created += 1,
                    Err(e) => tracing::warn!("Failed to save memory: {:#}", e),
                }
            }
        }

        let snapshot = match db.list_memories(user_id) {
            Ok(memories) => memories,
            Err(e) => {
                tracing::warn!("Failed to list memories: {:#}", e);
                Vec::new()
            }
        };
        for intent in &pass.intents {
            match intent {
                MemoryIntent::Create { .. } => {}
                MemoryIntent::Update { index, content } => {
                    let Some(memory) = index.checked_sub(1).and_then(|i| snapshot.get(i)) else {
                        tracing::warn!("Memory #{} does not exist; update skipped", index);
                        continue;
                    };
                    match db.update_memory_content(memory.id, content) {
                        Ok(true) => updated += 1,
                        Ok(false) => tracing::warn!("Memory #{} vanished before update", index),
                        Err(e) => tracing::warn!("Failed to update memory #{}: {:#}", index, e),
                    }
                }
                MemoryIntent::Delete { index } => {
                    let Some(memory) = index.checked_sub(1).and_then(|i| snapshot.get(i)) else {
                        tracing::warn!("Memory #{} does not exist; delete skipped", index);
                        continue;
                    };
                    match db.delete_memory(memory.id) {
                        Ok(true) => deleted += 1,
                        Ok(false) => tracing::warn!("Memory #{} vanished before delete", index),
                        Err(e) => tracing::warn!("Failed to delete memory #{}: {:#}", index, e),
                    }
                }
            }
        }

        if created + updated + deleted > 0 {
            self.services.connections.send_personal(
                user_id,
                event(
                    "notification",
                    json!({
                        "kind": "memory",
                        "message": format!(
                            "Memory bank updated: {} added, {} updated, {} removed",
                            created, updated, deleted
                        ),
                        "created": created,
                        "updated": updated,
                        "deleted": deleted,
                    }),
                ),
            );
        }
        pass.cleaned
    }

    async fn apply_generate_tags(&mut self, ai_message_id: &str, content: &str, stream: &mut TurnStream) {
        let Some(backend) = self.services.images.clone() else {
            return;
        };
        if !self.user.preferences.image_generation_enabled {
            return;
        }
        for intent in parse_generate_tags(content).intents {
            let step = stream.step_start(format!("Generating image: {}", intent.prompt));
            let width = intent.width.unwrap_or(FALLBACK_DIMENSION);
            let height = intent.height.unwrap_or(FALLBACK_DIMENSION);
            match backend.generate(&intent.prompt, width, height, intent.n).await {
                Ok(images) if !images.is_empty() => {
                    let count = images.len();
                    let encoded = images.iter().map(|bytes| encode_base64(bytes)).collect();
                    self.attach_images(ai_message_id, encoded, &intent.prompt, ImageGroupKind::Generated, None);
                    stream.step_end(&step, format!("Generated {} image(s)", count), StepStatus::Success);
                }
                Ok(_) => {
                    tracing::warn!("Image backend returned nothing for '{}'", intent.prompt);
                    stream.step_end(&step, "Image generation returned no images", StepStatus::Failure);
                }
                Err(e) => {
                    tracing::warn!("Image generation failed: {:#}", e);
                    stream.step_end(&step, format!("Image generation failed: {}", e), StepStatus::Failure);
                }
            }
        }
    }

    /// Registers slideshow tasks now; they are queued once the message is committed.
    fn schedule_slideshows(
        &mut self,
        ai_message_id: &str,
        content: &str,
        stream: &mut TurnStream,
    ) -> Vec<(String, SlidesIntent)> {
        if self.services.images.is_none() || !self.user.preferences.slide_generation_enabled {
            return Vec::new();
        }
        let mut scheduled = Vec::new();
        for intent in parse_slides_tags(content).intents {
            match self.services.tasks.create("slideshow", self.user.id) {
                Ok(task_id) => {
                    if let Some(message) = self.discussion.message_mut(ai_message_id) {
                        message.metadata.active_task_id = Some(task_id.clone());
                    }
                    stream.info(format!("Slideshow scheduled (task {})", task_id));
                    scheduled.push((task_id, intent));
                }
                Err(e) => tracing::warn!("Could not schedule slideshow: {:#}", e),
            }
        }
        scheduled
    }

    fn enqueue_slideshows(&self, ai_message_id: &str, scheduled: Vec<(String, SlidesIntent)>) {
        let Some(images) = self.services.images.clone() else {
            return;
        };
        for (task_id, intent) in scheduled {
            let job = SlideshowJob {
                db: self.services.db.clone(),
                models: self.services.models.clone(),
                images: images.clone(),
                user: self.user.clone(),
                discussion_id: self.discussion.id.clone(),
                message_id: ai_message_id.to_string(),
                intent,
            };
            if let Err(e) = self.services.tasks.enqueue(&task_id, Box::new(job)) {
                tracing::warn!("Slideshow task {} not started: {:#}", task_id, e);
            }
        }
    }

    async fn apply_edit_tags(
        &mut self,
        ai_message_id: &str,
        user_message_id: &str,
        content: &str,
        stream: &mut TurnStream,
    ) {
        let Some(backend) = self.services.images.clone() else {
            return;
        };
        if !self.user.preferences.image_editing_enabled {
            return;
        }
        let intents = parse_edit_tags(content).intents;
        if intents.is_empty() {
            return;
        }
        let mut sources = self.discussion.images_before(user_message_id);
        if let Some(current) = self.discussion.message(user_message_id) {
            sources.extend(current.images.iter().map(|image| image.image.clone()));
        }

        for intent in intents {
            let step = stream.step_start(format!("Editing image: {}", intent.prompt));
            let Some(index) = resolve_source_index(intent.source_index, sources.len()) else {
                tracing::warn!(
                    "Edit source index {} out of range ({} images)",
                    intent.source_index,
                    sources.len()
                );
                stream.step_end(
                    &step,
                    format!(
                        "Source image index {} is out of range ({} available)",
                        intent.source_index,
                        sources.len()
                    ),
                    StepStatus::Failure,
                );
                continue;
            };
            let source = &sources[index];
            let (width, height) = match (intent.width, intent.height) {
                (Some(w), Some(h)) => (w, h),
                (w, h) => {
                    let (inferred_w, inferred_h) = infer_dimensions(source);
                    (w.unwrap_or(inferred_w), h.unwrap_or(inferred_h))
                }
            };
            let result = match decode_base64_image(source) {
                Ok(bytes) => {
                    backend
                        .edit(&bytes, &intent.prompt, intent.strength, width, height)
                        .await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(image) => {
                    self.attach_images(
                        ai_message_id,
                        vec![encode_base64(&image)],
                        &intent.prompt,
                        ImageGroupKind::Edit,
                        Some(intent.source_index),
                    );
                    stream.step_end(&step, "Image edited", StepStatus::Success);
                }
                Err(e) => {
                    tracing::warn!("Image edit failed: {:#}", e);
                    stream.step_end(&step, format!("Image edit failed: {}", e), StepStatus::Failure);
                }
            }
        }
    }

    /// One `generated_image_infos` entry per appended image.
    fn attach_images(
        &mut self,
        ai_message_id: &str,
        images: Vec<String>,
        prompt: &str,
        kind: ImageGroupKind,
        source_index: Option<i64>,
    ) {
        let active = self.user.preferences.activate_generated_images;
        let Some(message) = self.discussion.message_mut(ai_message_id) else {
            return;
        };
        for image in images {
            let index = message.images.len();
            message.images.push(MessageImage { image, active });
            message.metadata.generated_image_infos.push(ImageGroup {
                id: uuid::Uuid::new_v4().to_string(),
                prompt: prompt.to_string(),
                indices: vec![index],
                kind,
                source_index,
            });
        }
    }

    // ---- wrap-up ----

    async fn auto_title(
        &mut self,
        model: &dyn LanguageModel,
        user_message_id: &str,
        reply: &str,
        stream: &mut TurnStream,
    ) -> Option<String> {
        if !self.user.preferences.auto_title || !self.discussion.has_default_title() {
            return None;
        }
        stream.emit(Frame::NewTitleStart {
            content: "Generating a title".to_string(),
        });
        let question = self
            .discussion
            .message(user_message_id)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let exchange = format!("User: {}\nAssistant: {}", question, reply);
        let title = match generate_text(
            model,
            TITLE_PROMPT,
            &exchange,
            &GenerationOptions::deterministic(TITLE_MAX_TOKENS),
        )
        .await
        {
            Ok(raw) => Some(clean_title(&raw)).filter(|t| !t.is_empty()),
            Err(e) => {
                tracing::warn!("Title generation failed: {:#}", e);
                None
            }
        };
        if let Some(title) = &title {
            self.discussion.set_title(title);
            if let Err(e) = self.discussion.commit(&self.services.db) {
                tracing::warn!("Failed to save title: {:#}", e);
            }
        }
        stream.emit(Frame::NewTitleEnd {
            content: title.clone().unwrap_or_default(),
        });
        title
    }

    fn notify_participants(&self, ai_message_id: &str) {
        let participants = match self.services.db.discussion_participants(&self.discussion.id) {
            Ok(participants) => participants,
            Err(e) => {
                tracing::warn!("Could not list participants: {:#}", e);
                return;
            }
        };
        let payload = event(
            "discussion_updated",
            json!({
                "discussion_id": self.discussion.id,
                "title": self.discussion.title(),
                "message_id": ai_message_id,
                "updated_by": self.user.username,
            }),
        );
        for participant in participants.into_iter().filter(|id| *id != self.user.id) {
            self.services
                .connections
                .send_personal(participant, payload.clone());
        }
    }
}

async fn move_upload(temp: &Path, assets: &Path) -> Result<Vec<u8>> {
    tokio::fs::create_dir_all(assets)
        .await
        .with_context(|| format!("Failed to create {:?}", assets))?;
    let original = temp
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("upload");
    let target = assets.join(random_prefixed_name(original));
    if tokio::fs::rename(temp, &target).await.is_err() {
        tokio::fs::copy(temp, &target)
            .await
            .with_context(|| format!("Failed to move upload {:?}", temp))?;
        if let Err(e) = tokio::fs::remove_file(temp).await {
            tracing::warn!("Failed to remove temporary upload {:?}: {}", temp, e);
        }
    }
    tokio::fs::read(&target)
        .await
        .with_context(|| format!("Failed to read upload {:?}", target))
}

/// First non-empty line of the model's answer, without quotes or a `Title:` label.
pub fn clean_title(raw: &str) -> String {
    let (visible, _) = split_visible_and_thinking(raw);
    let line = visible
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    let line = line
        .strip_prefix("Title:")
        .or_else(|| line.strip_prefix("title:"))
        .unwrap_or(line);
    line.trim()
        .trim_matches(|c| matches!(c, '"' | '\'' | '*' | '#' | '`'))
        .trim()
        .chars()
        .take(TITLE_MAX_CHARS)
        .collect()
}
