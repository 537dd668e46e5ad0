//! Per-user soft state: the warmed LLM client for each connected user.
//!
//! Entries are keyed by username. A teardown is scheduled when a user's last
//! websocket closes and is skipped if they reconnect before it fires.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::database::User;
use crate::llm_client::{LanguageModel, ModelProvider};

struct CachedSession {
    model: Arc<dyn LanguageModel>,
    warmed_at: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CachedSession>,
    /// Bumped on every schedule/cancel; a pending teardown only fires if unchanged.
    teardown_tokens: HashMap<String, u64>,
}

pub struct SessionCache {
    provider: Arc<dyn ModelProvider>,
    teardown_delay: Duration,
    state: Mutex<CacheState>,
}

impl SessionCache {
    pub fn new(provider: Arc<dyn ModelProvider>, teardown_delay: Duration) -> Self {
        Self {
            provider,
            teardown_delay,
            state: Mutex::new(CacheState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn contains(&self, username: &str) -> bool {
        self.lock().entries.contains_key(username)
    }

    /// Builds the user's client in the background.
    pub fn warm_up(self: &Arc<Self>, user: User) {
        let cache = self.clone();
        tokio::spawn(async move {
            match cache.model_for(&user) {
                Ok(model) => tracing::debug!(
                    "Warmed {}/{} for {}",
                    model.binding_name(),
                    model.model_name(),
                    user.username
                ),
                Err(e) => tracing::warn!("Warm-up failed for {}: {:#}", user.username, e),
            }
        });
    }

    pub fn schedule_teardown(self: &Arc<Self>, username: &str) {
        let token = {
            let mut state = self.lock();
            let token = state.teardown_tokens.entry(username.to_string()).or_insert(0);
            *token += 1;
            *token
        };
        let cache = self.clone();
        let username = username.to_string();
        let delay = self.teardown_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = cache.lock();
            if state.teardown_tokens.get(&username) == Some(&token) {
                state.teardown_tokens.remove(&username);
                if let Some(session) = state.entries.remove(&username) {
                    tracing::info!(
                        "Tore down session for {} (alive {:?})",
                        username,
                        session.warmed_at.elapsed()
                    );
                }
            }
        });
    }

    pub fn cancel_teardown(&self, username: &str) {
        let mut state = self.lock();
        if let Some(token) = state.teardown_tokens.get_mut(username) {
            *token += 1;
        }
    }

    /// Drops the cached client, e.g. after the user changed model settings.
    pub fn invalidate(&self, username: &str) {
        if self.lock().entries.remove(username).is_some() {
            tracing::debug!("Invalidated session cache for {}", username);
        }
    }
}

impl ModelProvider for SessionCache {
    fn model_for(&self, user: &User) -> Result<Arc<dyn LanguageModel>> {
        if let Some(session) = self.lock().entries.get(&user.username) {
            return Ok(session.model.clone());
        }
        let model = self.provider.model_for(user)?;
        self.lock().entries.insert(
            user.username.clone(),
            CachedSession {
                model: model.clone(),
                warmed_at: Instant::now(),
            },
        );
        Ok(model)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::UserPreferences;
    use crate::streaming::tests::ScriptedModel;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hands out one shared model and counts how often it was asked.
    pub(crate) struct FixedProvider {
        pub model: Arc<dyn LanguageModel>,
        pub builds: AtomicUsize,
    }

    impl FixedProvider {
        pub(crate) fn new(model: Arc<dyn LanguageModel>) -> Self {
            Self {
                model,
                builds: AtomicUsize::new(0),
            }
        }
    }

    impl ModelProvider for FixedProvider {
        fn model_for(&self, _user: &User) -> Result<Arc<dyn LanguageModel>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(self.model.clone())
        }
    }

    pub(crate) fn user(id: i64, username: &str) -> User {
        User {
            id,
            username: username.to_string(),
            is_admin: false,
            preferences: UserPreferences::default(),
            created_at: chrono::Utc::now(),
        }
    }

    fn cache(delay_ms: u64) -> (Arc<SessionCache>, Arc<FixedProvider>) {
        let provider = Arc::new(FixedProvider::new(Arc::new(ScriptedModel::default())));
        let cache = Arc::new(SessionCache::new(
            provider.clone(),
            Duration::from_millis(delay_ms),
        ));
        (cache, provider)
    }

    #[test]
    fn clients_are_built_once_per_user() {
        let (cache, provider) = cache(10);
        let alice = user(1, "alice");
        cache.model_for(&alice).unwrap();
        cache.model_for(&alice).unwrap();
        assert_eq!(provider.builds.load(Ordering::SeqCst), 1);

        cache.invalidate("alice");
        assert!(!cache.contains("alice"));
        cache.model_for(&alice).unwrap();
        assert_eq!(provider.builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn teardown_fires_after_the_delay() {
        let (cache, _) = cache(30);
        cache.model_for(&user(1, "alice")).unwrap();
        cache.schedule_teardown("alice");
        assert!(cache.contains("alice"));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!cache.contains("alice"));
    }

    #[tokio::test]
    async fn reconnecting_cancels_a_pending_teardown() {
        let (cache, _) = cache(30);
        cache.model_for(&user(1, "alice")).unwrap();
        cache.schedule_teardown("alice");
        cache.cancel_teardown("alice");
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.contains("alice"));
    }

    #[tokio::test]
    async fn warm_up_populates_the_cache() {
        let (cache, provider) = cache(30);
        cache.warm_up(user(2, "bob"));
        for _ in 0..50 {
            if cache.contains("bob") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(cache.contains("bob"));
        assert_eq!(provider.builds.load(Ordering::SeqCst), 1);
    }
}
