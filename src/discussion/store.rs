use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use std::collections::HashSet;

use super::{Artefact, Discussion, DiscussionSummary, Message, SenderType};
use crate::database::{db_timestamp, parse_db_timestamp, parse_json_column, ChatDatabase};

impl ChatDatabase {
    pub(super) fn write_discussion(&self, discussion: &Discussion) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO discussions
             (id, owner_user_id, metadata, data_zone, loaded_artefacts, active_branch_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                metadata = excluded.metadata,
                data_zone = excluded.data_zone,
                loaded_artefacts = excluded.loaded_artefacts,
                active_branch_id = excluded.active_branch_id,
                updated_at = excluded.updated_at",
            params![
                discussion.id,
                discussion.owner_user_id,
                serde_json::to_string(&discussion.metadata)?,
                discussion.data_zone,
                serde_json::to_string(&discussion.loaded_artefacts)?,
                discussion.active_branch_id,
                db_timestamp(discussion.created_at),
                db_timestamp(discussion.updated_at),
            ],
        )
        .with_context(|| format!("Failed to write discussion {}", discussion.id))?;

        for id in &discussion.deleted_messages {
            tx.execute(
                "DELETE FROM messages WHERE id = ?1 AND discussion_id = ?2",
                params![id, discussion.id],
            )?;
        }

        for id in &discussion.dirty_messages {
            let Some(message) = discussion.messages.get(id) else {
                continue;
            };
            tx.execute(
                "INSERT OR REPLACE INTO messages
                 (id, discussion_id, parent_id, sender, sender_type, content, images,
                  binding_name, model_name, tokens, created_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    message.id,
                    message.discussion_id,
                    message.parent_id,
                    message.sender,
                    message.sender_type.as_db_str(),
                    message.content,
                    serde_json::to_string(&message.images)?,
                    message.binding_name,
                    message.model_name,
                    message.tokens,
                    db_timestamp(message.created_at),
                    serde_json::to_string(&message.metadata)?,
                ],
            )?;
        }

        if discussion.artefacts_dirty {
            tx.execute(
                "DELETE FROM artefacts WHERE discussion_id = ?1",
                [&discussion.id],
            )?;
            for artefact in &discussion.artefacts {
                tx.execute(
                    "INSERT INTO artefacts
                     (discussion_id, title, version, content, images, author, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        discussion.id,
                        artefact.title,
                        artefact.version,
                        artefact.content,
                        serde_json::to_string(&artefact.images)?,
                        artefact.author,
                        db_timestamp(artefact.created_at),
                        db_timestamp(artefact.updated_at),
                    ],
                )?;
            }
        }

        tx.commit()?;
        tracing::debug!(
            "Committed discussion {} ({} dirty, {} deleted)",
            discussion.id,
            discussion.dirty_messages.len(),
            discussion.deleted_messages.len()
        );
        Ok(())
    }

    pub fn load_discussion(&self, discussion_id: &str) -> Result<Option<Discussion>> {
        let conn = self.lock_conn()?;
        let header = conn
            .query_row(
                "SELECT id, owner_user_id, metadata, data_zone, loaded_artefacts, active_branch_id, created_at, updated_at
                 FROM discussions WHERE id = ?1",
                [discussion_id],
                |row| {
                    let metadata_raw: String = row.get(2)?;
                    let loaded_raw: String = row.get(4)?;
                    let created_raw: String = row.get(6)?;
                    let updated_raw: String = row.get(7)?;
                    let mut discussion = Discussion::new(row.get(1)?, None);
                    discussion.id = row.get(0)?;
                    discussion.metadata = parse_json_column(&metadata_raw, 2)?;
                    discussion.data_zone = row.get(3)?;
                    discussion.loaded_artefacts = parse_json_column(&loaded_raw, 4)?;
                    discussion.active_branch_id = row.get(5)?;
                    discussion.created_at = parse_db_timestamp(&created_raw, 6)?;
                    discussion.updated_at = parse_db_timestamp(&updated_raw, 7)?;
                    Ok(discussion)
                },
            )
            .optional()?;
        let Some(mut discussion) = header else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT id, discussion_id, parent_id, sender, sender_type, content, images,
                    binding_name, model_name, tokens, created_at, metadata
             FROM messages WHERE discussion_id = ?1
             ORDER BY created_at ASC, id ASC",
        )?;
        let messages = stmt
            .query_map([discussion_id], |row| {
                let sender_type: String = row.get(4)?;
                let images_raw: String = row.get(6)?;
                let created_raw: String = row.get(10)?;
                let metadata_raw: String = row.get(11)?;
                Ok(Message {
                    id: row.get(0)?,
                    discussion_id: row.get(1)?,
                    parent_id: row.get(2)?,
                    sender: row.get(3)?,
                    sender_type: SenderType::from_db(&sender_type),
                    content: row.get(5)?,
                    images: parse_json_column(&images_raw, 6)?,
                    binding_name: row.get(7)?,
                    model_name: row.get(8)?,
                    tokens: row.get(9)?,
                    created_at: parse_db_timestamp(&created_raw, 10)?,
                    metadata: parse_json_column(&metadata_raw, 11)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let known: HashSet<String> = messages.iter().map(|m| m.id.clone()).collect();
        for mut message in messages {
            // Orphans re-attach at the root instead of vanishing.
            if let Some(parent) = message.parent_id.as_deref() {
                if !known.contains(parent) {
                    tracing::warn!(
                        "Message {} references missing parent {}",
                        message.id,
                        parent
                    );
                    message.parent_id = None;
                }
            }
            discussion.insert_loaded(message);
        }
        discussion.sort_children();

        let mut stmt = conn.prepare(
            "SELECT title, version, content, images, author, created_at, updated_at
             FROM artefacts WHERE discussion_id = ?1
             ORDER BY title ASC, version ASC",
        )?;
        discussion.artefacts = stmt
            .query_map([discussion_id], |row| {
                let images_raw: String = row.get(3)?;
                let created_raw: String = row.get(5)?;
                let updated_raw: String = row.get(6)?;
                Ok(Artefact {
                    title: row.get(0)?,
                    version: row.get(1)?,
                    content: row.get(2)?,
                    images: parse_json_column(&images_raw, 3)?,
                    author: row.get(4)?,
                    created_at: parse_db_timestamp(&created_raw, 5)?,
                    updated_at: parse_db_timestamp(&updated_raw, 6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if let Some(active) = discussion.active_branch_id.clone() {
            if !discussion.messages.contains_key(&active) {
                discussion.active_branch_id = None;
            }
        }
        Ok(Some(discussion))
    }

    pub fn delete_discussion(&self, discussion_id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let removed = conn.execute("DELETE FROM discussions WHERE id = ?1", [discussion_id])?;
        Ok(removed > 0)
    }

    pub fn list_discussions_for_user(&self, user_id: i64) -> Result<Vec<DiscussionSummary>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT d.id, d.owner_user_id, d.metadata, d.created_at, d.updated_at,
                    (SELECT COUNT(*) FROM messages m WHERE m.discussion_id = d.id)
             FROM discussions d
             WHERE d.owner_user_id = ?1
             ORDER BY d.updated_at DESC",
        )?;
        let summaries = stmt
            .query_map([user_id], |row| {
                let metadata_raw: String = row.get(2)?;
                let metadata: super::DiscussionMetadata = parse_json_column(&metadata_raw, 2)?;
                let created_raw: String = row.get(3)?;
                let updated_raw: String = row.get(4)?;
                Ok(DiscussionSummary {
                    id: row.get(0)?,
                    owner_user_id: row.get(1)?,
                    title: metadata.title,
                    created_at: parse_db_timestamp(&created_raw, 3)?,
                    updated_at: parse_db_timestamp(&updated_raw, 4)?,
                    message_count: row.get::<_, i64>(5)? as usize,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(summaries)
    }

    /// Owned discussions with at most one message and no star from the owner.
    pub fn list_prunable_discussions(&self, user_id: i64) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT d.id FROM discussions d
             WHERE d.owner_user_id = ?1
               AND (SELECT COUNT(*) FROM messages m WHERE m.discussion_id = d.id) <= 1
               AND NOT EXISTS (
                   SELECT 1 FROM starred_discussions s
                   WHERE s.discussion_id = d.id AND s.user_id = ?1
               )",
        )?;
        let ids = stmt
            .query_map([user_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::super::NewMessage;
    use super::*;
    use crate::database::tests::temp_db_path;
    use crate::database::{DiscussionAccess, SharePermission};

    fn message(parent: Option<&str>, sender_type: SenderType, text: &str) -> NewMessage {
        NewMessage {
            parent_id: parent.map(str::to_string),
            sender: "alice".into(),
            sender_type,
            content: text.into(),
            images: vec!["aW1n".into()],
        }
    }

    #[test]
    fn commit_then_load_restores_tree_and_artefacts() {
        let path = temp_db_path("discussion_roundtrip");
        let db = ChatDatabase::new(&path).expect("db init");

        let mut d = Discussion::new(7, Some("Recipes"));
        let u1 = d.add_message(message(None, SenderType::User, "soup?")).unwrap();
        let a1 = d
            .add_message(message(Some(&u1), SenderType::Assistant, "miso"))
            .unwrap();
        let a2 = d
            .add_message(message(Some(&u1), SenderType::Assistant, "ramen"))
            .unwrap();
        d.switch_to_branch(&a1).unwrap();
        d.add_artefact("Shopping", "tofu", Vec::new(), "alice").unwrap();
        d.commit(&db).unwrap();

        let loaded = db.load_discussion(&d.id).unwrap().expect("discussion");
        assert_eq!(loaded.title(), "Recipes");
        assert_eq!(loaded.message_count(), 3);
        assert_eq!(loaded.active_branch_id(), Some(a1.as_str()));
        let kids: Vec<&str> = loaded
            .children_of(Some(&u1))
            .iter()
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(kids, vec![a1.as_str(), a2.as_str()]);
        assert_eq!(loaded.message(&a2).unwrap().images[0].image, "aW1n");
        assert_eq!(loaded.get_artefact("Shopping", None).unwrap().version, 1);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn commit_applies_deletions_and_edits() {
        let path = temp_db_path("discussion_delete");
        let db = ChatDatabase::new(&path).expect("db init");

        let mut d = Discussion::new(7, None);
        let u1 = d.add_message(message(None, SenderType::User, "a")).unwrap();
        let a1 = d
            .add_message(message(Some(&u1), SenderType::Assistant, "b"))
            .unwrap();
        d.commit(&db).unwrap();

        d.message_mut(&u1).unwrap().content = "edited".into();
        d.delete_branch(&a1).unwrap();
        d.commit(&db).unwrap();

        let loaded = db.load_discussion(&d.id).unwrap().unwrap();
        assert_eq!(loaded.message_count(), 1);
        assert_eq!(loaded.message(&u1).unwrap().content, "edited");
        assert_eq!(loaded.active_branch_id(), Some(u1.as_str()));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn access_and_participants_follow_shares() {
        let path = temp_db_path("discussion_access");
        let db = ChatDatabase::new(&path).expect("db init");

        let mut d = Discussion::new(1, None);
        d.commit(&db).unwrap();

        assert_eq!(
            db.discussion_access(1, &d.id).unwrap(),
            Some(DiscussionAccess::Owner)
        );
        assert_eq!(db.discussion_access(2, &d.id).unwrap(), None);
        assert_eq!(db.discussion_access(1, "missing").unwrap(), None);

        db.share_discussion(&d.id, 1, 2, SharePermission::View).unwrap();
        assert_eq!(
            db.discussion_access(2, &d.id).unwrap(),
            Some(DiscussionAccess::View)
        );
        db.share_discussion(&d.id, 1, 2, SharePermission::Interact)
            .unwrap();
        assert_eq!(
            db.discussion_access(2, &d.id).unwrap(),
            Some(DiscussionAccess::Interact)
        );
        db.share_discussion(&d.id, 1, 3, SharePermission::View).unwrap();
        assert_eq!(db.discussion_participants(&d.id).unwrap(), vec![1, 2, 3]);

        db.unshare_discussion(&d.id, 3).unwrap();
        assert_eq!(db.discussion_participants(&d.id).unwrap(), vec![1, 2]);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn prunable_listing_skips_starred_and_busy_discussions() {
        let path = temp_db_path("discussion_prune");
        let db = ChatDatabase::new(&path).expect("db init");

        let mut empty = Discussion::new(1, None);
        empty.commit(&db).unwrap();
        let mut starred = Discussion::new(1, None);
        starred.commit(&db).unwrap();
        db.star_discussion(1, &starred.id).unwrap();
        let mut busy = Discussion::new(1, None);
        let u = busy.add_message(message(None, SenderType::User, "x")).unwrap();
        busy.add_message(message(Some(&u), SenderType::Assistant, "y"))
            .unwrap();
        busy.commit(&db).unwrap();

        assert_eq!(db.list_prunable_discussions(1).unwrap(), vec![empty.id.clone()]);
        assert!(db.delete_discussion(&empty.id).unwrap());
        assert!(db.load_discussion(&empty.id).unwrap().is_none());
        let summaries = db.list_discussions_for_user(1).unwrap();
        let busy_summary = summaries.iter().find(|s| s.id == busy.id).unwrap();
        assert_eq!(busy_summary.message_count, 2);

        let _ = std::fs::remove_file(path);
    }
}
