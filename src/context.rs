//! Builds the system prompt and per-turn runtime knobs.

use anyhow::Result;
use chrono::{DateTime, Local};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::database::{ChatDatabase, Memory, Personality, PersonalityDataSource, User};
use crate::discussion::Discussion;
use crate::rag::{DatastoreBackend, RagCallback, RagCallbacks};
use crate::tags::{DEFAULT_EDIT_STRENGTH, DEFAULT_SLIDE_HEIGHT, DEFAULT_SLIDE_WIDTH};
use crate::tools::{ToolRegistry, ToolSet};

/// Everything a turn needs besides the message history.
pub struct TurnContext {
    pub system_prompt: String,
    pub personality: Option<Personality>,
    pub rag_callbacks: RagCallbacks,
    pub tool_names: BTreeSet<String>,
    pub tools: ToolSet,
    pub image_gen_instructions_present: bool,
}

/// Inputs to [`compose_system_prompt`], already resolved from the database.
pub struct PromptInputs<'a> {
    pub user: &'a User,
    pub personality: Option<&'a Personality>,
    pub memories: &'a [Memory],
    pub discussion_data_zone: &'a str,
    pub image_tools_available: bool,
    pub now: DateTime<Local>,
}

pub struct ContextBuilder {
    db: Arc<ChatDatabase>,
    tools: Arc<ToolRegistry>,
    rag_backend: Option<Arc<dyn DatastoreBackend>>,
    image_tools_available: bool,
}

impl ContextBuilder {
    pub fn new(
        db: Arc<ChatDatabase>,
        tools: Arc<ToolRegistry>,
        rag_backend: Option<Arc<dyn DatastoreBackend>>,
        image_tools_available: bool,
    ) -> Self {
        Self {
            db,
            tools,
            rag_backend,
            image_tools_available,
        }
    }

    pub async fn build(
        &self,
        user: &User,
        discussion: &Discussion,
        now: DateTime<Local>,
    ) -> Result<TurnContext> {
        let prefs = &user.preferences;
        let personality = match prefs.active_personality_id.as_deref() {
            Some(id) => {
                let found = self.db.get_personality(id)?;
                if found.is_none() {
                    tracing::warn!("Active personality {} for {} not found", id, user.username);
                }
                found
            }
            None => None,
        };
        let memories = if prefs.memory_enabled {
            self.db.list_memories(user.id)?
        } else {
            Vec::new()
        };

        let (system_prompt, image_gen_instructions_present) =
            compose_system_prompt(&PromptInputs {
                user,
                personality: personality.as_ref(),
                memories: &memories,
                discussion_data_zone: &discussion.data_zone,
                image_tools_available: self.image_tools_available,
                now,
            });

        let rag_callbacks = self.rag_callbacks(user, discussion, personality.as_ref())?;

        let mut tool_names: BTreeSet<String> = discussion.metadata.active_tools.iter().cloned().collect();
        if let Some(p) = personality.as_ref() {
            tool_names.extend(p.active_tools.iter().cloned());
        }
        let mut tools = self.tools.select(&tool_names).await;
        for callback in rag_callbacks.values() {
            tools.insert(callback.clone());
        }

        Ok(TurnContext {
            system_prompt,
            personality,
            rag_callbacks,
            tool_names,
            tools,
            image_gen_instructions_present,
        })
    }

    /// One callback per datastore the discussion references, plus the personality's
    /// datastore source. Unknown ids are skipped; permission is enforced per query.
    fn rag_callbacks(
        &self,
        user: &User,
        discussion: &Discussion,
        personality: Option<&Personality>,
    ) -> Result<RagCallbacks> {
        let mut callbacks = RagCallbacks::new();
        let Some(backend) = self.rag_backend.as_ref() else {
            if !discussion.metadata.rag_datastore_ids.is_empty() {
                tracing::warn!(
                    "Discussion {} references datastores but no RAG service is configured",
                    discussion.id
                );
            }
            return Ok(callbacks);
        };

        let mut ids: Vec<&str> = discussion
            .metadata
            .rag_datastore_ids
            .iter()
            .map(String::as_str)
            .collect();
        if let Some(PersonalityDataSource::Datastore { datastore_id }) =
            personality.and_then(|p| p.data_source.as_ref())
        {
            ids.push(datastore_id);
        }

        let prefs = &user.preferences;
        for id in ids {
            if callbacks.contains_key(id) {
                continue;
            }
            let Some(record) = self.db.get_datastore(id)? else {
                tracing::warn!("Datastore {} referenced by {} not found", id, discussion.id);
                continue;
            };
            let callback = RagCallback::new(
                &record,
                user.id,
                prefs.rag_top_k,
                prefs.rag_min_sim_percent,
                self.db.clone(),
                backend.clone(),
            );
            callbacks.insert(id.to_string(), Arc::new(callback));
        }
        Ok(callbacks)
    }
}

/// Assembles the system prompt. Returns the text and whether image tag instructions
/// were included.
pub fn compose_system_prompt(inputs: &PromptInputs<'_>) -> (String, bool) {
    let prefs = &inputs.user.preferences;
    let user_name = inputs.user.display_name();
    let mut sections: Vec<String> = Vec::new();

    sections.push(dynamic_preamble(inputs));

    if prefs.image_annotation_enabled {
        sections.push(ANNOTATION_INSTRUCTIONS.to_string());
    }

    let mut image_gen_instructions_present = false;
    if inputs.image_tools_available {
        let mut image_parts = Vec::new();
        if prefs.image_generation_enabled {
            image_parts.push(
                "To create an image, write `<generate_image width=\"1024\" height=\"1024\" n=\"1\">detailed visual description</generate_image>`. \
                 `width`, `height` and `n` (1 to 10) are optional."
                    .to_string(),
            );
        }
        if prefs.image_editing_enabled {
            image_parts.push(format!(
                "To modify an existing image, write `<edit_image source_index=\"-1\" strength=\"{}\">what to change</edit_image>`. \
                 `source_index` counts images of this discussion in order (negative values count from the latest); \
                 `strength` goes from 0 (keep) to 1 (replace).",
                DEFAULT_EDIT_STRENGTH
            ));
        }
        if prefs.slide_generation_enabled {
            image_parts.push(format!(
                "To build a slide show, write `<generate_slides width=\"{}\" height=\"{}\"><Slide>slide description</Slide>...</generate_slides>` \
                 or put a single topic inside the tag to let the slides be planned for you.",
                DEFAULT_SLIDE_WIDTH, DEFAULT_SLIDE_HEIGHT
            ));
        }
        if !image_parts.is_empty() {
            image_gen_instructions_present = true;
            sections.push(format!("## Images\n\n{}", image_parts.join("\n")));
        }
    }

    if prefs.note_generation_enabled {
        sections.push(
            "## Notes\n\nWhen the user asks you to take a note, put it in a fenced code block with the language `note`:\n```note\n# Title\ncontent\n```"
                .to_string(),
        );
    }

    if prefs.memory_enabled {
        sections.push(memory_section(inputs.memories, prefs.auto_memory_enabled));
    }

    if let Some(personality) = inputs.personality {
        let text = personality.prompt_text.trim();
        if !text.is_empty() {
            sections.push(substitute_placeholders(text, inputs.now, user_name));
        }
    }

    let mut zones = Vec::new();
    let user_zone = prefs.data_zone.trim();
    if !user_zone.is_empty() {
        zones.push(format!(
            "## User Data Zone\n\n{}",
            substitute_placeholders(user_zone, inputs.now, user_name)
        ));
    }
    if let Some(PersonalityDataSource::Text { content }) =
        inputs.personality.and_then(|p| p.data_source.as_ref())
    {
        if !content.trim().is_empty() {
            zones.push(format!("## Personality Data Zone\n\n{}", content.trim()));
        }
    }
    let discussion_zone = inputs.discussion_data_zone.trim();
    if !discussion_zone.is_empty() {
        zones.push(format!("## Discussion Data Zone\n\n{}", discussion_zone));
    }
    sections.extend(zones);

    (sections.join("\n\n"), image_gen_instructions_present)
}

fn dynamic_preamble(inputs: &PromptInputs<'_>) -> String {
    let prefs = &inputs.user.preferences;
    let mut preamble = String::from("## Context\n\n");
    preamble.push_str(&format!(
        "Current date: {}\nCurrent time: {}\n",
        inputs.now.format("%A, %B %-d, %Y"),
        inputs.now.format("%H:%M")
    ));
    if prefs.share_os_info {
        preamble.push_str(&format!("User operating system: {}\n", std::env::consts::OS));
    }
    preamble.push_str(&format!("You are talking with {}.\n", inputs.user.display_name()));
    if prefs.share_personal_info {
        if let Some(info) = prefs
            .personal_info
            .as_deref()
            .map(str::trim)
            .filter(|info| !info.is_empty())
        {
            preamble.push_str(&format!("About the user: {}\n", info));
        }
    }
    if let Some(language) = prefs
        .language
        .as_deref()
        .map(str::trim)
        .filter(|lang| !lang.is_empty())
    {
        preamble.push_str(&format!("Always answer in {}.\n", language));
    }
    if prefs.fun_mode {
        preamble.push_str("Fun mode is on: be playful, witty and light-hearted while staying helpful.\n");
    }
    preamble.trim_end().to_string()
}

const ANNOTATION_INSTRUCTIONS: &str = "## Image Annotation\n\n\
When asked to point at things in an image, answer with `<annotate>JSON</annotate>` where JSON is a list of shapes. \
Coordinates are relative (0.0 to 1.0) to the image width and height:\n\
- `{\"type\": \"box\", \"x\": 0.1, \"y\": 0.2, \"w\": 0.3, \"h\": 0.4}`\n\
- `{\"type\": \"polygon\", \"points\": [[0.1, 0.1], [0.5, 0.2], [0.3, 0.6]]}`\n\
- `{\"type\": \"point\", \"x\": 0.5, \"y\": 0.5}`\n\
Each shape may also carry `label`, `color` and `description` for display.";

fn memory_section(memories: &[Memory], auto_save: bool) -> String {
    let mut section = String::from("## Memory Bank\n\n");
    if memories.is_empty() {
        section.push_str("No memories saved yet.\n");
    } else {
        for (index, memory) in memories.iter().enumerate() {
            section.push_str(&format!(
                "Memory #{} ({}): {}\n",
                index + 1,
                memory.title,
                memory.content.trim()
            ));
        }
    }
    section.push_str(
        "\nManage memories with tags in your answer:\n\
         - `<new_memory>fact to remember</new_memory>`\n\
         - `<update_memory:N>new content</update_memory:N>` replaces Memory #N\n\
         - `<delete_memory:N></delete_memory:N>` removes Memory #N\n",
    );
    if auto_save {
        section.push_str(
            "Save durable facts about the user (preferences, projects, personal details) as soon as they come up, without being asked.",
        );
    }
    section.trim_end().to_string()
}

/// Replaces `{{date}}`, `{{time}}`, `{{datetime}}` and `{{user_name}}`.
pub fn substitute_placeholders(text: &str, now: DateTime<Local>, user_name: &str) -> String {
    text.replace("{{datetime}}", &now.format("%Y-%m-%d %H:%M").to_string())
        .replace("{{date}}", &now.format("%Y-%m-%d").to_string())
        .replace("{{time}}", &now.format("%H:%M").to_string())
        .replace("{{user_name}}", user_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserPreferences;
    use crate::database::tests::temp_db_path;
    use crate::database::DatastoreRecord;
    use crate::rag::tests::FakeBackend;
    use chrono::{TimeZone, Utc};

    fn user(prefs: UserPreferences) -> User {
        User {
            id: 1,
            username: "alice".to_string(),
            is_admin: false,
            preferences: prefs,
            created_at: Utc::now(),
        }
    }

    fn fixed_now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 0).unwrap()
    }

    fn memory(id: i64, title: &str, content: &str) -> Memory {
        Memory {
            id,
            user_id: 1,
            title: title.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn personality(prompt: &str) -> Personality {
        Personality {
            id: "p1".to_string(),
            name: "Guide".to_string(),
            category: String::new(),
            author: String::new(),
            description: String::new(),
            prompt_text: prompt.to_string(),
            active_tools: vec!["fetch_url".to_string()],
            data_source: Some(PersonalityDataSource::Text {
                content: "Store hours: 9-17".to_string(),
            }),
            owner_user_id: None,
        }
    }

    #[test]
    fn placeholders_are_substituted() {
        let text = substitute_placeholders(
            "{{user_name}} on {{date}} at {{time}} ({{datetime}})",
            fixed_now(),
            "Al",
        );
        assert_eq!(text, "Al on 2024-03-09 at 14:05 (2024-03-09 14:05)");
    }

    #[test]
    fn sections_follow_the_documented_order() {
        let mut prefs = UserPreferences::default();
        prefs.image_annotation_enabled = true;
        prefs.image_generation_enabled = true;
        prefs.note_generation_enabled = true;
        prefs.auto_memory_enabled = true;
        prefs.language = Some("French".to_string());
        prefs.data_zone = "Hello {{user_name}}".to_string();
        prefs.preferred_name = Some("Ally".to_string());
        let user = user(prefs);
        let memories = vec![memory(1, "Units", "Prefers metric")];
        let persona = personality("You are a guide.");

        let (prompt, images) = compose_system_prompt(&PromptInputs {
            user: &user,
            personality: Some(&persona),
            memories: &memories,
            discussion_data_zone: "Project notes",
            image_tools_available: true,
            now: fixed_now(),
        });
        assert!(images);

        let order = [
            "Current date: Saturday, March 9, 2024",
            "## Image Annotation",
            "<generate_image",
            "```note",
            "Memory #1 (Units): Prefers metric",
            "as soon as they come up",
            "You are a guide.",
            "Hello Ally",
            "Store hours: 9-17",
            "Project notes",
        ];
        let mut last = 0;
        for needle in order {
            let pos = prompt.find(needle).unwrap_or_else(|| panic!("missing {}", needle));
            assert!(pos >= last, "{} out of order", needle);
            last = pos;
        }
        assert!(prompt.contains("Always answer in French."));
    }

    #[test]
    fn disabled_toggles_leave_sections_out() {
        let mut prefs = UserPreferences::default();
        prefs.memory_enabled = false;
        prefs.image_generation_enabled = true;
        let user = user(prefs);
        let (prompt, images) = compose_system_prompt(&PromptInputs {
            user: &user,
            personality: None,
            memories: &[],
            discussion_data_zone: "",
            image_tools_available: false,
            now: fixed_now(),
        });
        assert!(!images);
        assert!(!prompt.contains("<generate_image"));
        assert!(!prompt.contains("Memory Bank"));
        assert!(!prompt.contains("User operating system"));
    }

    #[tokio::test]
    async fn build_unions_tools_and_creates_rag_callbacks() {
        let path = temp_db_path("context");
        let db = Arc::new(ChatDatabase::new(&path).unwrap());
        let mut prefs = UserPreferences::default();
        prefs.active_personality_id = Some("p1".to_string());
        let alice = db.create_user("alice", "tok", false, &prefs).unwrap();
        db.save_personality(&personality("Be brief.")).unwrap();
        db.add_memory(alice.id, "Pets", "Has a cat").unwrap();
        db.save_datastore(&DatastoreRecord {
            id: "ds1".to_string(),
            owner_user_id: alice.id,
            name: "Docs".to_string(),
            description: String::new(),
        })
        .unwrap();

        let registry = Arc::new(ToolRegistry::with_builtins(reqwest::Client::new()).await);
        let backend: Arc<dyn DatastoreBackend> = Arc::new(FakeBackend::default());
        let builder = ContextBuilder::new(db.clone(), registry, Some(backend), false);

        let mut discussion = Discussion::new(alice.id, None);
        discussion.metadata.rag_datastore_ids = vec!["ds1".to_string(), "missing".to_string()];
        discussion.metadata.active_tools = vec!["unknown_tool".to_string()];

        let ctx = builder.build(&alice, &discussion, fixed_now()).await.unwrap();
        assert_eq!(ctx.personality.as_ref().map(|p| p.id.as_str()), Some("p1"));
        assert!(ctx.system_prompt.contains("Memory #1 (Pets): Has a cat"));
        assert!(ctx.system_prompt.contains("Be brief."));
        assert_eq!(ctx.rag_callbacks.len(), 1);
        assert!(ctx.tool_names.contains("fetch_url"));
        assert!(ctx.tool_names.contains("unknown_tool"));
        let mut names = ctx.tools.names();
        names.sort();
        assert_eq!(names, vec!["fetch_url".to_string(), "search_docs".to_string()]);

        let _ = std::fs::remove_file(path);
    }
}
