//! Websocket fan-out for this worker, bridged to the other workers through the hub.

pub mod hub;

use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::database::{ChatDatabase, User};
use crate::sessions::SessionCache;

/// Broadcast log entries are kept this long in multi-worker mode.
const BROADCAST_LOG_RETENTION_MINUTES: i64 = 5;

/// Builds a websocket payload `{"type": kind, "data": data}`.
pub fn event(kind: &str, data: Value) -> Value {
    json!({ "type": kind, "data": data })
}

type Sessions = HashMap<i64, HashMap<String, flume::Sender<Value>>>;

pub struct ConnectionManager {
    pid: u32,
    db: Arc<ChatDatabase>,
    sessions_cache: Arc<SessionCache>,
    sessions: RwLock<Sessions>,
    admins: RwLock<HashSet<i64>>,
    hub_outbound: Option<flume::Sender<Value>>,
    hub_connected: AtomicBool,
}

impl ConnectionManager {
    /// `hub_outbound` is `None` in single-worker mode.
    pub fn new(
        pid: u32,
        db: Arc<ChatDatabase>,
        sessions_cache: Arc<SessionCache>,
        hub_outbound: Option<flume::Sender<Value>>,
    ) -> Self {
        Self {
            pid,
            db,
            sessions_cache,
            sessions: RwLock::new(HashMap::new()),
            admins: RwLock::new(HashSet::new()),
            hub_outbound,
            hub_connected: AtomicBool::new(false),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_multi_worker(&self) -> bool {
        self.hub_outbound.is_some()
    }

    pub(crate) fn set_hub_connected(&self, connected: bool) {
        self.hub_connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_online(&self, user_id: i64) -> bool {
        self.sessions
            .read()
            .map(|sessions| sessions.contains_key(&user_id))
            .unwrap_or(false)
    }

    // ---- lifecycle ----

    /// Registers a websocket session. Returns the receiver the socket writer drains.
    pub fn connect(&self, user: &User, session_id: &str) -> flume::Receiver<Value> {
        let (tx, rx) = flume::unbounded();
        let first_session = match self.sessions.write() {
            Ok(mut sessions) => {
                let user_sessions = sessions.entry(user.id).or_default();
                let first = user_sessions.is_empty();
                user_sessions.insert(session_id.to_string(), tx);
                first
            }
            Err(_) => {
                tracing::error!("Session registry lock poisoned");
                return rx;
            }
        };
        if user.is_admin {
            if let Ok(mut admins) = self.admins.write() {
                admins.insert(user.id);
            }
        }
        tracing::info!("{} connected (session {})", user.username, session_id);

        self.sessions_cache.cancel_teardown(&user.username);
        if first_session {
            self.sessions_cache.warm_up(user.clone());
            self.notify_friends_online(user);
        }
        rx
    }

    /// Drops one session; the last one schedules the session-cache teardown.
    pub fn disconnect(&self, user: &User, session_id: &str) {
        let last_session = match self.sessions.write() {
            Ok(mut sessions) => {
                let Some(user_sessions) = sessions.get_mut(&user.id) else {
                    return;
                };
                user_sessions.remove(session_id);
                if user_sessions.is_empty() {
                    sessions.remove(&user.id);
                    true
                } else {
                    false
                }
            }
            Err(_) => return,
        };
        tracing::info!("{} disconnected (session {})", user.username, session_id);
        if last_session {
            if let Ok(mut admins) = self.admins.write() {
                admins.remove(&user.id);
            }
            self.sessions_cache.schedule_teardown(&user.username);
        }
    }

    fn notify_friends_online(&self, user: &User) {
        let friends = match self.db.list_friend_ids(user.id) {
            Ok(friends) => friends,
            Err(e) => {
                tracing::warn!("Could not load friends of {}: {:#}", user.username, e);
                return;
            }
        };
        let payload = event(
            "friend_online",
            json!({ "user_id": user.id, "username": user.username }),
        );
        for friend in friends {
            self.send_personal(friend, payload.clone());
        }
    }

    // ---- fan-out ----

    /// Every local socket, plus every other worker through the hub.
    pub fn broadcast(&self, payload: Value) {
        self.deliver_all(&payload);
        let mut frame = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("type".to_string(), json!("broadcast"));
                map.insert("data".to_string(), other);
                map
            }
        };
        frame.remove("_pid");
        self.publish(Value::Object(frame));
    }

    pub fn broadcast_to_admins(&self, payload: Value) {
        self.deliver_admins(&payload);
        self.publish(json!({ "type": "admins", "data": payload }));
    }

    /// Every session of `user_id` across the cluster.
    pub fn send_personal(&self, user_id: i64, payload: Value) {
        self.deliver_user(user_id, &payload);
        self.publish(json!({ "type": "personal", "user_id": user_id, "data": payload }));
    }

    /// Drops the user's cached session on every worker.
    pub fn invalidate_user_cache(&self, username: &str) {
        self.sessions_cache.invalidate(username);
        self.publish(json!({
            "type": "internal_event",
            "event": "invalidate_user_cache",
            "username": username,
        }));
    }

    /// Applies a frame received from the hub.
    pub fn handle_hub_message(&self, mut message: Value) {
        let Some(map) = message.as_object_mut() else {
            tracing::warn!("Ignoring non-object hub frame");
            return;
        };
        let sender = map.remove("_pid").and_then(|pid| pid.as_u64());
        if sender == Some(u64::from(self.pid)) {
            return;
        }
        let kind = map
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match kind.as_str() {
            "personal" => {
                let Some(user_id) = map.get("user_id").and_then(Value::as_i64) else {
                    tracing::warn!("Personal hub frame without user_id");
                    return;
                };
                let data = map.remove("data").unwrap_or(Value::Null);
                self.deliver_user(user_id, &data);
            }
            "admins" => {
                let data = map.remove("data").unwrap_or(Value::Null);
                self.deliver_admins(&data);
            }
            "internal_event" => self.handle_internal_event(map),
            _ => self.deliver_all(&message),
        }
    }

    fn handle_internal_event(&self, map: &Map<String, Value>) {
        match map.get("event").and_then(Value::as_str) {
            Some("invalidate_user_cache") => {
                if let Some(username) = map.get("username").and_then(Value::as_str) {
                    self.sessions_cache.invalidate(username);
                }
            }
            other => tracing::debug!("Unhandled internal event {:?}", other),
        }
    }

    /// Sends to the hub when connected. While disconnected, delivery stays local.
    fn publish(&self, mut frame: Value) {
        let Some(outbound) = &self.hub_outbound else {
            return;
        };
        if let Err(e) = self.db.append_broadcast_log(
            &frame,
            chrono::Duration::minutes(BROADCAST_LOG_RETENTION_MINUTES),
        ) {
            tracing::warn!("Failed to append broadcast log: {:#}", e);
        }
        if !self.hub_connected.load(Ordering::SeqCst) {
            tracing::debug!("Hub offline; delivered locally only");
            return;
        }
        if let Some(map) = frame.as_object_mut() {
            map.insert("_pid".to_string(), json!(self.pid));
        }
        if outbound.send(frame).is_err() {
            tracing::warn!("Hub client is gone; delivered locally only");
        }
    }

    // ---- local delivery ----

    fn deliver_user(&self, user_id: i64, payload: &Value) {
        let Ok(sessions) = self.sessions.read() else {
            return;
        };
        if let Some(user_sessions) = sessions.get(&user_id) {
            for tx in user_sessions.values() {
                let _ = tx.send(payload.clone());
            }
        }
    }

    fn deliver_admins(&self, payload: &Value) {
        let admins: Vec<i64> = match self.admins.read() {
            Ok(admins) => admins.iter().copied().collect(),
            Err(_) => return,
        };
        for admin in admins {
            self.deliver_user(admin, payload);
        }
    }

    fn deliver_all(&self, payload: &Value) {
        let Ok(sessions) = self.sessions.read() else {
            return;
        };
        for tx in sessions.values().flat_map(|user_sessions| user_sessions.values()) {
            let _ = tx.send(payload.clone());
        }
    }
}
