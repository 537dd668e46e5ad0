//! Branching discussion tree with versioned artefacts.
//!
//! A discussion is loaded whole, mutated in memory, and written back with
//! [`Discussion::commit`]. Nothing touches the database until then.

mod store;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::database::ChatDatabase;

pub const DEFAULT_TITLE: &str = "New Discussion";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    User,
    Assistant,
    System,
}

impl SenderType {
    pub(crate) fn as_db_str(self) -> &'static str {
        match self {
            SenderType::User => "user",
            SenderType::Assistant => "assistant",
            SenderType::System => "system",
        }
    }

    pub(crate) fn from_db(raw: &str) -> Self {
        match raw {
            "assistant" => SenderType::Assistant,
            "system" => SenderType::System,
            _ => SenderType::User,
        }
    }
}

/// A base64 image attached to a message, plus whether it is fed back to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageImage {
    pub image: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageGroupKind {
    Generated,
    Edit,
    Slideshow,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageGroup {
    pub id: String,
    pub prompt: String,
    /// Positions in the owning message's `images` list.
    pub indices: Vec<usize>,
    #[serde(rename = "type")]
    pub kind: ImageGroupKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_index: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generated_image_infos: Vec<ImageGroup>,
    /// Milliseconds to the first streamed chunk.
    #[serde(default, rename = "ttft", skip_serializing_if = "Option::is_none")]
    pub ttft_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub discussion_id: String,
    pub parent_id: Option<String>,
    pub sender: String,
    pub sender_type: SenderType,
    pub content: String,
    #[serde(default)]
    pub images: Vec<MessageImage>,
    #[serde(default)]
    pub binding_name: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub tokens: Option<u32>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl Message {
    pub fn active_images(&self) -> impl Iterator<Item = &str> {
        self.images
            .iter()
            .filter(|image| image.active)
            .map(|image| image.image.as_str())
    }
}

/// Fields a caller supplies when appending a message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub parent_id: Option<String>,
    pub sender: String,
    pub sender_type: SenderType,
    pub content: String,
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscussionImage {
    pub data: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscussionMetadata {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default)]
    pub rag_datastore_ids: Vec<String>,
    #[serde(default)]
    pub active_tools: Vec<String>,
    #[serde(default)]
    pub discussion_images: Vec<DiscussionImage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_title() -> String {
    DEFAULT_TITLE.to_string()
}

impl Default for DiscussionMetadata {
    fn default() -> Self {
        Self {
            title: default_title(),
            rag_datastore_ids: Vec::new(),
            active_tools: Vec::new(),
            discussion_images: Vec::new(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artefact {
    pub title: String,
    pub version: u32,
    pub content: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadedArtefact {
    pub title: String,
    pub version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Markdown,
}

impl ExportFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Some(ExportFormat::Json),
            "markdown" | "md" => Some(ExportFormat::Markdown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscussionSummary {
    pub id: String,
    pub owner_user_id: i64,
    pub title: String,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Discussion {
    pub id: String,
    pub owner_user_id: i64,
    pub metadata: DiscussionMetadata,
    pub data_zone: String,
    pub loaded_artefacts: Vec<LoadedArtefact>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    active_branch_id: Option<String>,
    messages: HashMap<String, Message>,
    children: HashMap<Option<String>, Vec<String>>,
    artefacts: Vec<Artefact>,
    dirty_messages: HashSet<String>,
    deleted_messages: HashSet<String>,
    artefacts_dirty: bool,
}

impl Discussion {
    pub fn new(owner_user_id: i64, title: Option<&str>) -> Self {
        let now = Utc::now();
        let mut metadata = DiscussionMetadata::default();
        if let Some(title) = title.map(str::trim).filter(|t| !t.is_empty()) {
            metadata.title = title.to_string();
        }
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_user_id,
            metadata,
            data_zone: String::new(),
            loaded_artefacts: Vec::new(),
            created_at: now,
            updated_at: now,
            active_branch_id: None,
            messages: HashMap::new(),
            children: HashMap::new(),
            artefacts: Vec::new(),
            dirty_messages: HashSet::new(),
            deleted_messages: HashSet::new(),
            artefacts_dirty: false,
        }
    }

    pub fn title(&self) -> &str {
        &self.metadata.title
    }

    pub fn set_title(&mut self, title: &str) {
        self.metadata.title = title.trim().to_string();
        self.touch();
    }

    pub fn has_default_title(&self) -> bool {
        self.metadata.title.starts_with(DEFAULT_TITLE)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    // ---- tree ----

    pub fn active_branch_id(&self) -> Option<&str> {
        self.active_branch_id.as_deref()
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.get(id)
    }

    /// Mutable access marks the message dirty for the next commit.
    pub fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        let message = self.messages.get_mut(id)?;
        self.dirty_messages.insert(id.to_string());
        self.updated_at = Utc::now();
        Some(message)
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn children_of(&self, parent_id: Option<&str>) -> Vec<&Message> {
        self.children
            .get(&parent_id.map(str::to_string))
            .map(|ids| ids.iter().filter_map(|id| self.messages.get(id)).collect())
            .unwrap_or_default()
    }

    /// Appends a message and makes it the active branch tip.
    pub fn add_message(&mut self, new: NewMessage) -> Result<String> {
        if let Some(parent) = new.parent_id.as_deref() {
            if !self.messages.contains_key(parent) {
                bail!("Parent message {} not found in discussion {}", parent, self.id);
            }
        }
        let now = self.next_timestamp();
        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            discussion_id: self.id.clone(),
            parent_id: new.parent_id,
            sender: new.sender,
            sender_type: new.sender_type,
            content: new.content,
            images: new
                .images
                .into_iter()
                .map(|image| MessageImage {
                    image,
                    active: true,
                })
                .collect(),
            binding_name: None,
            model_name: None,
            tokens: None,
            created_at: now,
            metadata: MessageMetadata::default(),
        };
        let id = message.id.clone();
        self.insert_loaded(message);
        self.dirty_messages.insert(id.clone());
        self.active_branch_id = Some(id.clone());
        self.updated_at = now;
        Ok(id)
    }

    /// Children are ordered by creation time, so timestamps stay strictly increasing.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let latest = self.messages.values().map(|m| m.created_at).max();
        match latest {
            Some(latest) if latest >= now => latest + chrono::Duration::microseconds(1),
            _ => now,
        }
    }

    fn insert_loaded(&mut self, message: Message) {
        self.children
            .entry(message.parent_id.clone())
            .or_default()
            .push(message.id.clone());
        self.messages.insert(message.id.clone(), message);
    }

    fn sort_children(&mut self) {
        let messages = &self.messages;
        for ids in self.children.values_mut() {
            ids.sort_by(|a, b| {
                let (ma, mb) = (&messages[a], &messages[b]);
                ma.created_at.cmp(&mb.created_at).then_with(|| a.cmp(b))
            });
        }
    }

    /// Root-to-tip path ending at `tip_id`. Empty when the tip is unknown.
    pub fn get_branch(&self, tip_id: &str) -> Vec<&Message> {
        let mut path = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = self.messages.get(tip_id);
        while let Some(message) = cursor {
            if !seen.insert(message.id.as_str()) {
                tracing::warn!("Cycle detected in discussion {} at {}", self.id, message.id);
                break;
            }
            path.push(message);
            cursor = message
                .parent_id
                .as_deref()
                .and_then(|parent| self.messages.get(parent));
        }
        path.reverse();
        path
    }

    pub fn active_branch(&self) -> Vec<&Message> {
        self.active_branch_id
            .as_deref()
            .map(|tip| self.get_branch(tip))
            .unwrap_or_default()
    }

    pub fn switch_to_branch(&mut self, tip_id: &str) -> Result<()> {
        if !self.messages.contains_key(tip_id) {
            bail!("Message {} not found in discussion {}", tip_id, self.id);
        }
        self.active_branch_id = Some(tip_id.to_string());
        self.touch();
        Ok(())
    }

    /// Removes `message_id` and its whole subtree, then points the active branch at its
    /// parent. Returns the number of removed messages.
    pub fn delete_branch(&mut self, message_id: &str) -> Result<usize> {
        let Some(root) = self.messages.get(message_id) else {
            bail!("Message {} not found in discussion {}", message_id, self.id);
        };
        let parent_id = root.parent_id.clone();

        let mut doomed = Vec::new();
        let mut stack = vec![message_id.to_string()];
        while let Some(id) = stack.pop() {
            if let Some(kids) = self.children.remove(&Some(id.clone())) {
                stack.extend(kids);
            }
            doomed.push(id);
        }

        if let Some(siblings) = self.children.get_mut(&parent_id) {
            siblings.retain(|id| id != message_id);
            if siblings.is_empty() {
                self.children.remove(&parent_id);
            }
        }

        for id in &doomed {
            self.messages.remove(id);
            self.dirty_messages.remove(id);
            self.deleted_messages.insert(id.clone());
        }

        self.active_branch_id = parent_id;
        self.touch();
        Ok(doomed.len())
    }

    /// Every message in the tree, oldest first.
    pub fn messages_in_order(&self) -> Vec<&Message> {
        let mut all: Vec<&Message> = self.messages.values().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Images of every message created before `before_id`, on any branch, oldest first.
    pub fn images_before(&self, before_id: &str) -> Vec<String> {
        let Some(anchor) = self.messages.get(before_id) else {
            return Vec::new();
        };
        let cutoff = (anchor.created_at, anchor.id.as_str());
        self.messages_in_order()
            .into_iter()
            .filter(|m| (m.created_at, m.id.as_str()) < cutoff)
            .flat_map(|m| m.images.iter().map(|image| image.image.clone()))
            .collect()
    }

    pub fn is_prunable(&self) -> bool {
        self.messages.len() <= 1
    }

    // ---- discussion images ----

    pub fn add_discussion_image(&mut self, data: String, source: &str) -> usize {
        self.metadata.discussion_images.push(DiscussionImage {
            data,
            active: true,
            source: source.to_string(),
        });
        self.touch();
        self.metadata.discussion_images.len() - 1
    }

    pub fn toggle_discussion_image(&mut self, index: usize) -> Result<bool> {
        let Some(image) = self.metadata.discussion_images.get_mut(index) else {
            bail!("Discussion image {} out of range", index);
        };
        image.active = !image.active;
        let active = image.active;
        self.touch();
        Ok(active)
    }

    pub fn remove_discussion_image(&mut self, index: usize) -> Result<()> {
        if index >= self.metadata.discussion_images.len() {
            bail!("Discussion image {} out of range", index);
        }
        self.metadata.discussion_images.remove(index);
        self.touch();
        Ok(())
    }

    pub fn active_discussion_images(&self) -> Vec<String> {
        self.metadata
            .discussion_images
            .iter()
            .filter(|image| image.active)
            .map(|image| image.data.clone())
            .collect()
    }

    // ---- artefacts ----

    fn latest_version(&self, title: &str) -> Option<u32> {
        self.artefacts
            .iter()
            .filter(|a| a.title == title)
            .map(|a| a.version)
            .max()
    }

    /// Creates version 1, or the next version when the title already exists.
    pub fn add_artefact(
        &mut self,
        title: &str,
        content: &str,
        images: Vec<String>,
        author: &str,
    ) -> Result<&Artefact> {
        let title = title.trim();
        if title.is_empty() {
            bail!("Artefact title must not be empty");
        }
        let version = self.latest_version(title).map_or(1, |v| v + 1);
        let now = Utc::now();
        self.artefacts.push(Artefact {
            title: title.to_string(),
            version,
            content: content.to_string(),
            images,
            author: author.to_string(),
            created_at: now,
            updated_at: now,
        });
        self.artefacts_dirty = true;
        self.touch();
        Ok(&self.artefacts[self.artefacts.len() - 1])
    }

    /// Latest version when `version` is `None`.
    pub fn get_artefact(&self, title: &str, version: Option<u32>) -> Option<&Artefact> {
        let version = match version {
            Some(v) => v,
            None => self.latest_version(title)?,
        };
        self.artefacts
            .iter()
            .find(|a| a.title == title && a.version == version)
    }

    /// Writes a new version. `images: None` carries the previous version's images over.
    pub fn update_artefact(
        &mut self,
        title: &str,
        content: &str,
        images: Option<Vec<String>>,
        author: &str,
    ) -> Result<&Artefact> {
        let Some(previous) = self.get_artefact(title, None) else {
            bail!("Artefact '{}' not found", title);
        };
        let images = images.unwrap_or_else(|| previous.images.clone());
        self.add_artefact(title, content, images, author)
    }

    /// Removes every version. Returns how many were removed.
    pub fn remove_artefact(&mut self, title: &str) -> usize {
        let before = self.artefacts.len();
        self.artefacts.retain(|a| a.title != title);
        let removed = before - self.artefacts.len();
        if removed > 0 {
            self.artefacts_dirty = true;
            let _ = self.unload_artefact_from_data_zone(title);
            self.touch();
        }
        removed
    }

    pub fn list_artefacts(&self) -> Vec<&Artefact> {
        let mut latest: BTreeMap<&str, &Artefact> = BTreeMap::new();
        for artefact in &self.artefacts {
            let slot = latest.entry(artefact.title.as_str()).or_insert(artefact);
            if artefact.version > slot.version {
                *slot = artefact;
            }
        }
        latest.into_values().collect()
    }

    pub fn artefact_versions(&self, title: &str) -> Vec<&Artefact> {
        let mut versions: Vec<&Artefact> =
            self.artefacts.iter().filter(|a| a.title == title).collect();
        versions.sort_by_key(|a| a.version);
        versions
    }

    pub fn load_artefact_into_data_zone(&mut self, title: &str, version: Option<u32>) -> Result<()> {
        let Some(artefact) = self.get_artefact(title, version) else {
            bail!("Artefact '{}' not found", title);
        };
        let block = artefact_block(&artefact.title, artefact.version, &artefact.content);
        let loaded = LoadedArtefact {
            title: artefact.title.clone(),
            version: artefact.version,
        };
        // Loading a different version replaces the earlier block.
        let _ = self.unload_artefact_from_data_zone(title);
        if !self.data_zone.is_empty() && !self.data_zone.ends_with('\n') {
            self.data_zone.push('\n');
        }
        self.data_zone.push_str(&block);
        self.data_zone.push('\n');
        self.loaded_artefacts.push(loaded);
        self.touch();
        Ok(())
    }

    pub fn unload_artefact_from_data_zone(&mut self, title: &str) -> Result<()> {
        let Some(position) = self.loaded_artefacts.iter().position(|l| l.title == title) else {
            bail!("Artefact '{}' is not loaded", title);
        };
        let loaded = self.loaded_artefacts.remove(position);

        let header = format!("--- Document: {} v{} ---\n", loaded.title, loaded.version);
        let footer = format!("\n--- End Document: {} ---", loaded.title);
        if let Some(start) = find_line(&self.data_zone, &header) {
            if let Some(end_rel) = self.data_zone[start + header.len() - 1..].find(&footer) {
                let mut end = start + header.len() - 1 + end_rel + footer.len();
                if self.data_zone[end..].starts_with('\n') {
                    end += 1;
                }
                self.data_zone.replace_range(start..end, "");
            }
        }
        self.touch();
        Ok(())
    }

    pub fn mark_data_zone_processed(&mut self) {
        self.loaded_artefacts.clear();
        self.touch();
    }

    // ---- export ----

    /// JSON carries the whole tree; Markdown reads like a transcript of the active branch.
    pub fn export(&self, format: ExportFormat) -> Result<String> {
        match format {
            ExportFormat::Json => {
                let value = serde_json::json!({
                    "id": self.id,
                    "title": self.metadata.title,
                    "owner_user_id": self.owner_user_id,
                    "created_at": self.created_at,
                    "updated_at": self.updated_at,
                    "active_branch_id": self.active_branch_id,
                    "messages": self.messages_in_order(),
                    "artefacts": self.list_artefacts(),
                });
                Ok(serde_json::to_string_pretty(&value)?)
            }
            ExportFormat::Markdown => {
                let mut out = format!("# {}\n\n", self.metadata.title);
                for message in self.active_branch() {
                    out.push_str(&format!(
                        "## {} ({})\n\n{}\n\n",
                        message.sender,
                        message.created_at.format("%Y-%m-%d %H:%M"),
                        message.content.trim()
                    ));
                    if !message.images.is_empty() {
                        out.push_str(&format!("_{} image(s) attached_\n\n", message.images.len()));
                    }
                }
                Ok(out)
            }
        }
    }

    pub fn summary(&self) -> DiscussionSummary {
        DiscussionSummary {
            id: self.id.clone(),
            owner_user_id: self.owner_user_id,
            title: self.metadata.title.clone(),
            message_count: self.messages.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Persist pending changes in one transaction, then clear the dirty sets.
    pub fn commit(&mut self, db: &ChatDatabase) -> Result<()> {
        db.write_discussion(self)?;
        self.dirty_messages.clear();
        self.deleted_messages.clear();
        self.artefacts_dirty = false;
        Ok(())
    }
}

/// Byte offset of `needle` where it starts a line of `haystack`.
fn find_line(haystack: &str, needle: &str) -> Option<usize> {
    haystack
        .match_indices(needle)
        .map(|(at, _)| at)
        .find(|&at| at == 0 || haystack.as_bytes()[at - 1] == b'\n')
}

pub fn artefact_block(title: &str, version: u32, content: &str) -> String {
    format!(
        "--- Document: {} v{} ---\n{}\n--- End Document: {} ---",
        title, version, content, title
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_message(parent: Option<&str>, text: &str) -> NewMessage {
        NewMessage {
            parent_id: parent.map(str::to_string),
            sender: "alice".into(),
            sender_type: SenderType::User,
            content: text.into(),
            images: Vec::new(),
        }
    }

    fn assistant_message(parent: &str, text: &str) -> NewMessage {
        NewMessage {
            parent_id: Some(parent.to_string()),
            sender: "assistant".into(),
            sender_type: SenderType::Assistant,
            content: text.into(),
            images: Vec::new(),
        }
    }

    #[test]
    fn branches_walk_root_to_tip() {
        let mut d = Discussion::new(1, None);
        let u1 = d.add_message(user_message(None, "hi")).unwrap();
        let a1 = d.add_message(assistant_message(&u1, "hello")).unwrap();
        let u2 = d.add_message(user_message(Some(&a1), "again")).unwrap();

        let branch: Vec<&str> = d.get_branch(&u2).iter().map(|m| m.id.as_str()).collect();
        assert_eq!(branch, vec![u1.as_str(), a1.as_str(), u2.as_str()]);
        assert_eq!(d.active_branch_id(), Some(u2.as_str()));
        assert!(d.get_branch("unknown").is_empty());
    }

    #[test]
    fn add_message_rejects_unknown_parent() {
        let mut d = Discussion::new(1, None);
        assert!(d.add_message(user_message(Some("ghost"), "x")).is_err());
        assert_eq!(d.message_count(), 0);
    }

    #[test]
    fn siblings_keep_creation_order_and_switching_moves_tip() {
        let mut d = Discussion::new(1, None);
        let u1 = d.add_message(user_message(None, "q")).unwrap();
        let first = d.add_message(assistant_message(&u1, "a")).unwrap();
        let second = d.add_message(assistant_message(&u1, "b")).unwrap();

        let kids: Vec<&str> = d.children_of(Some(&u1)).iter().map(|m| m.id.as_str()).collect();
        assert_eq!(kids, vec![first.as_str(), second.as_str()]);

        d.switch_to_branch(&first).unwrap();
        assert_eq!(d.active_branch().last().unwrap().content, "a");
        assert!(d.switch_to_branch("missing").is_err());
    }

    #[test]
    fn delete_branch_removes_subtree_and_repoints_active() {
        let mut d = Discussion::new(1, None);
        let u1 = d.add_message(user_message(None, "q")).unwrap();
        let a1 = d.add_message(assistant_message(&u1, "a")).unwrap();
        let u2 = d.add_message(user_message(Some(&a1), "q2")).unwrap();
        let _a2 = d.add_message(assistant_message(&u2, "a2")).unwrap();

        let removed = d.delete_branch(&a1).unwrap();
        assert_eq!(removed, 3);
        assert_eq!(d.message_count(), 1);
        assert_eq!(d.active_branch_id(), Some(u1.as_str()));
        assert!(d.children_of(Some(&u1)).is_empty());

        d.delete_branch(&u1).unwrap();
        assert_eq!(d.active_branch_id(), None);
        assert!(d.is_prunable());
    }

    #[test]
    fn delete_off_branch_moves_active_to_parent() {
        let mut d = Discussion::new(1, None);
        let u1 = d.add_message(user_message(None, "q")).unwrap();
        let left = d.add_message(assistant_message(&u1, "left")).unwrap();
        let right = d.add_message(assistant_message(&u1, "right")).unwrap();
        assert_eq!(d.active_branch_id(), Some(right.as_str()));

        d.delete_branch(&left).unwrap();
        assert_eq!(d.active_branch_id(), Some(u1.as_str()));
        let kids: Vec<&str> = d.children_of(Some(&u1)).iter().map(|m| m.id.as_str()).collect();
        assert_eq!(kids, vec![right.as_str()]);
    }

    #[test]
    fn artefact_versions_increase_and_update_keeps_images() {
        let mut d = Discussion::new(1, None);
        let v1 = d
            .add_artefact("Plan", "draft", vec!["img".into()], "alice")
            .unwrap()
            .version;
        assert_eq!(v1, 1);
        let v2 = d.update_artefact("Plan", "final", None, "alice").unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.images, vec!["img".to_string()]);

        assert_eq!(d.get_artefact("Plan", None).unwrap().content, "final");
        assert_eq!(d.get_artefact("Plan", Some(1)).unwrap().content, "draft");
        assert_eq!(d.list_artefacts().len(), 1);
        assert!(d.update_artefact("Nope", "x", None, "alice").is_err());

        assert_eq!(d.remove_artefact("Plan"), 2);
        assert!(d.get_artefact("Plan", None).is_none());
    }

    #[test]
    fn loading_artefacts_writes_and_removes_data_zone_blocks() {
        let mut d = Discussion::new(1, None);
        d.data_zone = "notes".into();
        d.add_artefact("Spec", "body text", Vec::new(), "alice").unwrap();
        d.load_artefact_into_data_zone("Spec", None).unwrap();

        assert!(d
            .data_zone
            .contains("--- Document: Spec v1 ---\nbody text\n--- End Document: Spec ---"));
        assert_eq!(d.loaded_artefacts.len(), 1);

        d.unload_artefact_from_data_zone("Spec").unwrap();
        assert_eq!(d.data_zone.trim(), "notes");
        assert!(d.loaded_artefacts.is_empty());
        assert!(d.unload_artefact_from_data_zone("Spec").is_err());

        d.load_artefact_into_data_zone("Spec", Some(1)).unwrap();
        d.mark_data_zone_processed();
        assert!(d.loaded_artefacts.is_empty());
    }

    #[test]
    fn discussion_images_toggle_and_remove() {
        let mut d = Discussion::new(1, None);
        let idx = d.add_discussion_image("aaa".into(), "upload");
        d.add_discussion_image("bbb".into(), "upload");
        assert!(!d.toggle_discussion_image(idx).unwrap());
        assert_eq!(d.active_discussion_images(), vec!["bbb".to_string()]);
        d.remove_discussion_image(0).unwrap();
        assert_eq!(d.metadata.discussion_images.len(), 1);
        assert!(d.toggle_discussion_image(5).is_err());
    }

    #[test]
    fn images_before_spans_sibling_branches() {
        let mut d = Discussion::new(1, None);
        let mut first = user_message(None, "look");
        first.images = vec!["one".into()];
        let u1 = d.add_message(first).unwrap();
        let mut left = assistant_message(&u1, "left");
        left.images = vec!["left-img".into()];
        d.add_message(left).unwrap();
        let right = d.add_message(assistant_message(&u1, "right")).unwrap();
        let mut second = user_message(Some(&right), "and this");
        second.images = vec!["two".into()];
        let u2 = d.add_message(second).unwrap();

        assert_eq!(
            d.images_before(&u2),
            vec!["one".to_string(), "left-img".to_string()]
        );
        assert!(d.images_before(&u1).is_empty());
        assert!(d.images_before("missing").is_empty());
    }

    #[test]
    fn unloading_matches_the_whole_header() {
        let mut d = Discussion::new(1, None);
        d.add_artefact("Plan v2 notes", "notes body", Vec::new(), "alice").unwrap();
        d.add_artefact("Plan", "plan body", Vec::new(), "alice").unwrap();
        d.load_artefact_into_data_zone("Plan v2 notes", None).unwrap();
        d.load_artefact_into_data_zone("Plan", None).unwrap();

        d.unload_artefact_from_data_zone("Plan").unwrap();
        assert!(d.data_zone.contains("--- Document: Plan v2 notes v1 ---\nnotes body"));
        assert!(!d.data_zone.contains("plan body"));
        assert_eq!(d.loaded_artefacts.len(), 1);
        assert_eq!(d.loaded_artefacts[0].title, "Plan v2 notes");
    }

    #[test]
    fn export_json_carries_every_branch() {
        let mut d = Discussion::new(1, Some("Fork"));
        let u1 = d.add_message(user_message(None, "pick one")).unwrap();
        let left = d.add_message(assistant_message(&u1, "left-answer")).unwrap();
        d.add_message(assistant_message(&u1, "right-answer")).unwrap();
        d.add_artefact("Notes", "text", Vec::new(), "alice").unwrap();

        let json: Value = serde_json::from_str(&d.export(ExportFormat::Json).unwrap()).unwrap();
        let messages = json["messages"].as_array().unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m["content"].as_str().unwrap()).collect();
        assert_eq!(contents, vec!["pick one", "left-answer", "right-answer"]);
        assert_eq!(messages[1]["id"], left.as_str());
        assert_eq!(messages[1]["parent_id"], u1.as_str());
        assert!(messages[0]["parent_id"].is_null());
        assert_eq!(json["artefacts"][0]["title"], "Notes");
        assert!(json["active_branch_id"].is_string());

        let md = d.export(ExportFormat::Markdown).unwrap();
        assert!(md.contains("right-answer"));
        assert!(!md.contains("left-answer"));
    }

    #[test]
    fn export_markdown_follows_active_branch() {
        let mut d = Discussion::new(1, Some("Trip"));
        let u1 = d.add_message(user_message(None, "where?")).unwrap();
        d.add_message(assistant_message(&u1, "Lisbon")).unwrap();
        let md = d.export(ExportFormat::Markdown).unwrap();
        assert!(md.starts_with("# Trip"));
        assert!(md.contains("where?"));
        assert!(md.contains("Lisbon"));

        let json: Value = serde_json::from_str(&d.export(ExportFormat::Json).unwrap()).unwrap();
        assert_eq!(json["messages"].as_array().unwrap().len(), 2);
        assert_eq!(ExportFormat::parse("MD"), Some(ExportFormat::Markdown));
        assert_eq!(ExportFormat::parse("pdf"), None);
    }

    #[test]
    fn image_group_serializes_type_field() {
        let group = ImageGroup {
            id: "g".into(),
            prompt: "p".into(),
            indices: vec![0],
            kind: ImageGroupKind::Edit,
            source_index: Some(-1),
        };
        let value = serde_json::to_value(&group).unwrap();
        assert_eq!(value["type"], "edit");
        assert_eq!(value["source_index"], -1);
    }
}
