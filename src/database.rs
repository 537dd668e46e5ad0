use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

use crate::config::UserPreferences;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub is_admin: bool,
    pub preferences: UserPreferences,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn display_name(&self) -> &str {
        self.preferences
            .preferred_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.username)
    }
}

/// Inline text or a datastore reference attached to a personality.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PersonalityDataSource {
    Text { content: String },
    Datastore { datastore_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Personality {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    pub prompt_text: String,
    /// Tool names the personality requires.
    #[serde(default)]
    pub active_tools: Vec<String>,
    #[serde(default)]
    pub data_source: Option<PersonalityDataSource>,
    #[serde(default)]
    pub owner_user_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Memory {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SharePermission {
    View,
    Interact,
}

impl SharePermission {
    fn as_db_str(self) -> &'static str {
        match self {
            SharePermission::View => "view",
            SharePermission::Interact => "interact",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "interact" => SharePermission::Interact,
            _ => SharePermission::View,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiscussionAccess {
    Owner,
    Interact,
    View,
}

impl DiscussionAccess {
    pub fn can_view(self) -> bool {
        true
    }

    pub fn can_interact(self) -> bool {
        matches!(self, DiscussionAccess::Owner | DiscussionAccess::Interact)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DatastorePermission {
    ReadQuery,
    ReadWrite,
    Revectorize,
}

impl DatastorePermission {
    fn as_db_str(self) -> &'static str {
        match self {
            DatastorePermission::ReadQuery => "read_query",
            DatastorePermission::ReadWrite => "read_write",
            DatastorePermission::Revectorize => "revectorize",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatastoreRecord {
    pub id: String,
    pub owner_user_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

pub(crate) fn db_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_db_timestamp(raw: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

pub(crate) fn parse_json_column<T: serde::de::DeserializeOwned>(
    raw: &str,
    column: usize,
) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub struct ChatDatabase {
    conn: Mutex<Connection>,
}

impl ChatDatabase {
    /// Helper to lock the connection
    pub(crate) fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                access_token TEXT NOT NULL UNIQUE,
                is_admin INTEGER NOT NULL DEFAULT 0,
                preferences TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS personalities (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT '',
                author TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                prompt_text TEXT NOT NULL,
                active_tools TEXT NOT NULL DEFAULT '[]',
                data_source TEXT,
                owner_user_id INTEGER
            );

            CREATE TABLE IF NOT EXISTS memories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_memories_user ON memories(user_id, created_at);

            CREATE TABLE IF NOT EXISTS datastores (
                id TEXT PRIMARY KEY,
                owner_user_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS datastore_shares (
                datastore_id TEXT NOT NULL,
                owner_user_id INTEGER NOT NULL,
                shared_with_user_id INTEGER NOT NULL,
                permission TEXT NOT NULL,
                PRIMARY KEY (datastore_id, shared_with_user_id)
            );

            CREATE TABLE IF NOT EXISTS discussions (
                id TEXT PRIMARY KEY,
                owner_user_id INTEGER NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                data_zone TEXT NOT NULL DEFAULT '',
                loaded_artefacts TEXT NOT NULL DEFAULT '[]',
                active_branch_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_discussions_owner ON discussions(owner_user_id);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                discussion_id TEXT NOT NULL REFERENCES discussions(id) ON DELETE CASCADE,
                parent_id TEXT,
                sender TEXT NOT NULL,
                sender_type TEXT NOT NULL,
                content TEXT NOT NULL,
                images TEXT NOT NULL DEFAULT '[]',
                binding_name TEXT,
                model_name TEXT,
                tokens INTEGER,
                created_at TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_messages_discussion ON messages(discussion_id, created_at);

            CREATE TABLE IF NOT EXISTS artefacts (
                discussion_id TEXT NOT NULL REFERENCES discussions(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                version INTEGER NOT NULL,
                content TEXT NOT NULL,
                images TEXT NOT NULL DEFAULT '[]',
                author TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (discussion_id, title, version)
            );

            CREATE TABLE IF NOT EXISTS shared_discussions (
                discussion_id TEXT NOT NULL REFERENCES discussions(id) ON DELETE CASCADE,
                owner_user_id INTEGER NOT NULL,
                shared_with_user_id INTEGER NOT NULL,
                permission TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (discussion_id, owner_user_id, shared_with_user_id)
            );

            CREATE TABLE IF NOT EXISTS starred_discussions (
                user_id INTEGER NOT NULL,
                discussion_id TEXT NOT NULL REFERENCES discussions(id) ON DELETE CASCADE,
                starred_at TEXT NOT NULL,
                PRIMARY KEY (user_id, discussion_id)
            );

            CREATE TABLE IF NOT EXISTS friendships (
                user_id INTEGER NOT NULL,
                friend_id INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (user_id, friend_id)
            );

            CREATE TABLE IF NOT EXISTS broadcast_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to initialize schema")?;
        Ok(())
    }

    // ---- users ----

    pub fn create_user(
        &self,
        username: &str,
        access_token: &str,
        is_admin: bool,
        preferences: &UserPreferences,
    ) -> Result<User> {
        let now = Utc::now();
        let prefs_json = serde_json::to_string(preferences)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO users (username, access_token, is_admin, preferences, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                username,
                access_token,
                is_admin as i64,
                prefs_json,
                db_timestamp(now)
            ],
        )
        .with_context(|| format!("Failed to create user '{}'", username))?;
        Ok(User {
            id: conn.last_insert_rowid(),
            username: username.to_string(),
            is_admin,
            preferences: preferences.clone(),
            created_at: now,
        })
    }

    fn query_user(&self, clause: &str, value: &dyn rusqlite::ToSql) -> Result<Option<User>> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT id, username, is_admin, preferences, created_at FROM users WHERE {} LIMIT 1",
            clause
        );
        let user = conn
            .query_row(&sql, [value], |row| {
                let prefs_raw: String = row.get(3)?;
                let created_raw: String = row.get(4)?;
                Ok(User {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    is_admin: row.get::<_, i64>(2)? != 0,
                    preferences: parse_json_column(&prefs_raw, 3)?,
                    created_at: parse_db_timestamp(&created_raw, 4)?,
                })
            })
            .optional()?;
        Ok(user)
    }

    pub fn get_user(&self, user_id: i64) -> Result<Option<User>> {
        self.query_user("id = ?1", &user_id)
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.query_user("username = ?1", &username)
    }

    pub fn get_user_by_token(&self, access_token: &str) -> Result<Option<User>> {
        if access_token.trim().is_empty() {
            return Ok(None);
        }
        self.query_user("access_token = ?1", &access_token)
    }

    pub fn update_user_preferences(&self, user_id: i64, preferences: &UserPreferences) -> Result<()> {
        let prefs_json = serde_json::to_string(preferences)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE users SET preferences = ?2 WHERE id = ?1",
            params![user_id, prefs_json],
        )?;
        Ok(())
    }

    pub fn list_admin_ids(&self) -> Result<Vec<i64>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT id FROM users WHERE is_admin = 1 ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    // ---- personalities ----

    pub fn save_personality(&self, personality: &Personality) -> Result<()> {
        let tools_json = serde_json::to_string(&personality.active_tools)?;
        let source_json = personality
            .data_source
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO personalities
             (id, name, category, author, description, prompt_text, active_tools, data_source, owner_user_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                personality.id,
                personality.name,
                personality.category,
                personality.author,
                personality.description,
                personality.prompt_text,
                tools_json,
                source_json,
                personality.owner_user_id,
            ],
        )?;
        Ok(())
    }

    pub fn get_personality(&self, id: &str) -> Result<Option<Personality>> {
        let conn = self.lock_conn()?;
        let personality = conn
            .query_row(
                "SELECT id, name, category, author, description, prompt_text, active_tools, data_source, owner_user_id
                 FROM personalities WHERE id = ?1",
                [id],
                |row| {
                    let tools_raw: String = row.get(6)?;
                    let source_raw: Option<String> = row.get(7)?;
                    Ok(Personality {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        category: row.get(2)?,
                        author: row.get(3)?,
                        description: row.get(4)?,
                        prompt_text: row.get(5)?,
                        active_tools: parse_json_column(&tools_raw, 6)?,
                        data_source: match source_raw {
                            Some(raw) => Some(parse_json_column(&raw, 7)?),
                            None => None,
                        },
                        owner_user_id: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(personality)
    }

    // ---- memories ----

    pub fn add_memory(&self, user_id: i64, title: &str, content: &str) -> Result<Memory> {
        let now = Utc::now();
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO memories (user_id, title, content, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![user_id, title, content, db_timestamp(now)],
        )?;
        Ok(Memory {
            id: conn.last_insert_rowid(),
            user_id,
            title: title.to_string(),
            content: content.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    /// All memories of a user, oldest first. Tag indices are 1-based positions in this list.
    pub fn list_memories(&self, user_id: i64) -> Result<Vec<Memory>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, title, content, created_at, updated_at
             FROM memories WHERE user_id = ?1
             ORDER BY created_at ASC, id ASC",
        )?;
        let memories = stmt
            .query_map([user_id], |row| {
                let created_raw: String = row.get(4)?;
                let updated_raw: String = row.get(5)?;
                Ok(Memory {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    title: row.get(2)?,
                    content: row.get(3)?,
                    created_at: parse_db_timestamp(&created_raw, 4)?,
                    updated_at: parse_db_timestamp(&updated_raw, 5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(memories)
    }

    pub fn update_memory_content(&self, memory_id: i64, content: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE memories SET content = ?2, updated_at = ?3 WHERE id = ?1",
            params![memory_id, content, db_timestamp(Utc::now())],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_memory(&self, memory_id: i64) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute("DELETE FROM memories WHERE id = ?1", [memory_id])?;
        Ok(changed > 0)
    }

    // ---- datastores ----

    pub fn save_datastore(&self, datastore: &DatastoreRecord) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO datastores (id, owner_user_id, name, description)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                datastore.id,
                datastore.owner_user_id,
                datastore.name,
                datastore.description
            ],
        )?;
        Ok(())
    }

    pub fn get_datastore(&self, id: &str) -> Result<Option<DatastoreRecord>> {
        let conn = self.lock_conn()?;
        let record = conn
            .query_row(
                "SELECT id, owner_user_id, name, description FROM datastores WHERE id = ?1",
                [id],
                |row| {
                    Ok(DatastoreRecord {
                        id: row.get(0)?,
                        owner_user_id: row.get(1)?,
                        name: row.get(2)?,
                        description: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn share_datastore(
        &self,
        datastore_id: &str,
        owner_user_id: i64,
        shared_with_user_id: i64,
        permission: DatastorePermission,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO datastore_shares (datastore_id, owner_user_id, shared_with_user_id, permission)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                datastore_id,
                owner_user_id,
                shared_with_user_id,
                permission.as_db_str()
            ],
        )?;
        Ok(())
    }

    /// Owners always may query; anyone holding any share permission may too.
    pub fn can_query_datastore(&self, user_id: i64, datastore_id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let owner: Option<i64> = conn
            .query_row(
                "SELECT owner_user_id FROM datastores WHERE id = ?1",
                [datastore_id],
                |row| row.get(0),
            )
            .optional()?;
        match owner {
            None => Ok(false),
            Some(owner) if owner == user_id => Ok(true),
            Some(_) => {
                let shared: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM datastore_shares
                     WHERE datastore_id = ?1 AND shared_with_user_id = ?2",
                    params![datastore_id, user_id],
                    |row| row.get(0),
                )?;
                Ok(shared > 0)
            }
        }
    }

    // ---- discussion sharing ----

    pub fn share_discussion(
        &self,
        discussion_id: &str,
        owner_user_id: i64,
        shared_with_user_id: i64,
        permission: SharePermission,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO shared_discussions (discussion_id, owner_user_id, shared_with_user_id, permission, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(discussion_id, owner_user_id, shared_with_user_id)
             DO UPDATE SET permission = excluded.permission",
            params![
                discussion_id,
                owner_user_id,
                shared_with_user_id,
                permission.as_db_str(),
                db_timestamp(Utc::now())
            ],
        )?;
        Ok(())
    }

    pub fn unshare_discussion(&self, discussion_id: &str, shared_with_user_id: i64) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "DELETE FROM shared_discussions WHERE discussion_id = ?1 AND shared_with_user_id = ?2",
            params![discussion_id, shared_with_user_id],
        )?;
        Ok(())
    }

    /// `None` when the discussion does not exist or the user has no access to it.
    pub fn discussion_access(
        &self,
        user_id: i64,
        discussion_id: &str,
    ) -> Result<Option<DiscussionAccess>> {
        let conn = self.lock_conn()?;
        let owner: Option<i64> = conn
            .query_row(
                "SELECT owner_user_id FROM discussions WHERE id = ?1",
                [discussion_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(owner) = owner else {
            return Ok(None);
        };
        if owner == user_id {
            return Ok(Some(DiscussionAccess::Owner));
        }
        let permission: Option<String> = conn
            .query_row(
                "SELECT permission FROM shared_discussions
                 WHERE discussion_id = ?1 AND shared_with_user_id = ?2",
                params![discussion_id, user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(permission.map(|raw| match SharePermission::from_db(&raw) {
            SharePermission::Interact => DiscussionAccess::Interact,
            SharePermission::View => DiscussionAccess::View,
        }))
    }

    pub fn discussion_exists(&self, discussion_id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM discussions WHERE id = ?1",
            [discussion_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Owner plus every user the discussion is shared with.
    pub fn discussion_participants(&self, discussion_id: &str) -> Result<Vec<i64>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT owner_user_id FROM discussions WHERE id = ?1
             UNION
             SELECT shared_with_user_id FROM shared_discussions WHERE discussion_id = ?1",
        )?;
        let mut ids = stmt
            .query_map([discussion_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    // ---- stars ----

    pub fn star_discussion(&self, user_id: i64, discussion_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO starred_discussions (user_id, discussion_id, starred_at)
             VALUES (?1, ?2, ?3)",
            params![user_id, discussion_id, db_timestamp(Utc::now())],
        )?;
        Ok(())
    }

    pub fn unstar_discussion(&self, user_id: i64, discussion_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "DELETE FROM starred_discussions WHERE user_id = ?1 AND discussion_id = ?2",
            params![user_id, discussion_id],
        )?;
        Ok(())
    }

    pub fn is_starred(&self, user_id: i64, discussion_id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM starred_discussions WHERE user_id = ?1 AND discussion_id = ?2",
            params![user_id, discussion_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ---- friendships ----

    pub fn add_friendship(&self, user_id: i64, friend_id: i64) -> Result<()> {
        let now = db_timestamp(Utc::now());
        let conn = self.lock_conn()?;
        for (a, b) in [(user_id, friend_id), (friend_id, user_id)] {
            conn.execute(
                "INSERT OR IGNORE INTO friendships (user_id, friend_id, created_at) VALUES (?1, ?2, ?3)",
                params![a, b, now],
            )?;
        }
        Ok(())
    }

    pub fn list_friend_ids(&self, user_id: i64) -> Result<Vec<i64>> {
        let conn = self.lock_conn()?;
        let mut stmt =
            conn.prepare("SELECT friend_id FROM friendships WHERE user_id = ?1 ORDER BY friend_id")?;
        let ids = stmt
            .query_map([user_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    // ---- broadcast log ----

    /// Append a fan-out payload and drop entries older than `retention`.
    pub fn append_broadcast_log(
        &self,
        payload: &serde_json::Value,
        retention: chrono::Duration,
    ) -> Result<()> {
        let now = Utc::now();
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO broadcast_log (payload, created_at) VALUES (?1, ?2)",
            params![payload.to_string(), db_timestamp(now)],
        )?;
        conn.execute(
            "DELETE FROM broadcast_log WHERE created_at < ?1",
            [db_timestamp(now - retention)],
        )?;
        Ok(())
    }

    pub fn count_broadcast_log(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM broadcast_log", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;

    pub(crate) fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("colloquy_{}_{}.db", name, uuid::Uuid::new_v4()));
        path
    }

    #[test]
    fn users_resolve_by_token_and_keep_preferences() {
        let path = temp_db_path("users");
        let db = ChatDatabase::new(&path).expect("db init");
        let mut prefs = UserPreferences::default();
        prefs.fun_mode = true;
        let alice = db.create_user("alice", "tok-a", false, &prefs).unwrap();

        let found = db.get_user_by_token("tok-a").unwrap().expect("user");
        assert_eq!(found.id, alice.id);
        assert!(found.preferences.fun_mode);
        assert!(db.get_user_by_token("nope").unwrap().is_none());
        assert!(db.get_user_by_token("").unwrap().is_none());

        prefs.fun_mode = false;
        db.update_user_preferences(alice.id, &prefs).unwrap();
        assert!(!db.get_user(alice.id).unwrap().unwrap().preferences.fun_mode);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn memories_list_in_creation_order() {
        let path = temp_db_path("memories");
        let db = ChatDatabase::new(&path).expect("db init");
        let first = db.add_memory(1, "First", "one").unwrap();
        let second = db.add_memory(1, "Second", "two").unwrap();
        db.add_memory(2, "Other user", "x").unwrap();

        let list = db.list_memories(1).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, first.id);
        assert_eq!(list[1].id, second.id);

        assert!(db.update_memory_content(first.id, "uno").unwrap());
        let list = db.list_memories(1).unwrap();
        assert_eq!(list[0].content, "uno");
        assert!(list[0].updated_at >= list[0].created_at);

        assert!(db.delete_memory(second.id).unwrap());
        assert!(!db.delete_memory(second.id).unwrap());
        assert_eq!(db.list_memories(1).unwrap().len(), 1);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn datastore_query_requires_owner_or_share() {
        let path = temp_db_path("datastores");
        let db = ChatDatabase::new(&path).expect("db init");
        db.save_datastore(&DatastoreRecord {
            id: "ds1".into(),
            owner_user_id: 1,
            name: "notes".into(),
            description: String::new(),
        })
        .unwrap();

        assert!(db.can_query_datastore(1, "ds1").unwrap());
        assert!(!db.can_query_datastore(2, "ds1").unwrap());
        db.share_datastore("ds1", 1, 2, DatastorePermission::ReadQuery)
            .unwrap();
        assert!(db.can_query_datastore(2, "ds1").unwrap());
        assert!(!db.can_query_datastore(2, "missing").unwrap());

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn personality_round_trips_data_source() {
        let path = temp_db_path("personalities");
        let db = ChatDatabase::new(&path).expect("db init");
        let personality = Personality {
            id: "p1".into(),
            name: "Librarian".into(),
            category: "helpers".into(),
            author: "staff".into(),
            description: String::new(),
            prompt_text: "You catalog things.".into(),
            active_tools: vec!["fetch_url".into()],
            data_source: Some(PersonalityDataSource::Datastore {
                datastore_id: "ds9".into(),
            }),
            owner_user_id: None,
        };
        db.save_personality(&personality).unwrap();
        let loaded = db.get_personality("p1").unwrap().expect("personality");
        assert_eq!(loaded.active_tools, vec!["fetch_url".to_string()]);
        assert_eq!(loaded.data_source, personality.data_source);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn friendships_are_symmetric() {
        let path = temp_db_path("friends");
        let db = ChatDatabase::new(&path).expect("db init");
        db.add_friendship(1, 2).unwrap();
        db.add_friendship(2, 1).unwrap();
        assert_eq!(db.list_friend_ids(1).unwrap(), vec![2]);
        assert_eq!(db.list_friend_ids(2).unwrap(), vec![1]);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn broadcast_log_prunes_old_entries() {
        let path = temp_db_path("broadcast_log");
        let db = ChatDatabase::new(&path).expect("db init");
        db.append_broadcast_log(&serde_json::json!({"type": "a"}), chrono::Duration::minutes(5))
            .unwrap();
        assert_eq!(db.count_broadcast_log().unwrap(), 1);
        // A zero retention window drops everything written before this append.
        std::thread::sleep(std::time::Duration::from_millis(5));
        db.append_broadcast_log(&serde_json::json!({"type": "b"}), chrono::Duration::zero())
            .unwrap();
        assert_eq!(db.count_broadcast_log().unwrap(), 1);

        let _ = std::fs::remove_file(path);
    }
}
