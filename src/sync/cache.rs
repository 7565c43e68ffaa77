//! Local Cache Store
//!
//! 同意状態のキャッシュと未確定の変更キュー

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::compliance::types::{
    ConsentRecord, DataRightsRequest, ParentalConsentRequest, PrivacyPreferences,
};
use crate::error::CacheError;

/// 未確定の変更内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "entity", rename_all = "snake_case")]
pub enum Mutation {
    Consent(ConsentRecord),
    RightsRequest(DataRightsRequest),
    ParentalConsent(ParentalConsentRequest),
}

impl Mutation {
    pub fn entity_id(&self) -> Uuid {
        match self {
            Mutation::Consent(record) => record.id,
            Mutation::RightsRequest(request) => request.id,
            Mutation::ParentalConsent(request) => request.id,
        }
    }
}

/// A write that was queued but not yet acknowledged by the remote authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: Uuid,
    pub user_id: String,
    pub mutation: Mutation,
    pub queued_at: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheStore: Send + Sync + std::fmt::Debug {
    async fn load_preferences(
        &self,
        user_id: &str,
    ) -> Result<Option<PrivacyPreferences>, CacheError>;

    async fn store_preferences(&self, preferences: &PrivacyPreferences) -> Result<(), CacheError>;

    async fn invalidate_preferences(&self, user_id: &str) -> Result<(), CacheError>;

    /// Inserts or replaces a pending mutation keyed by its id.
    async fn put_pending(&self, mutation: &PendingMutation) -> Result<(), CacheError>;

    /// 確定または破棄した変更を削除。存在した場合 `true`
    async fn remove_pending(&self, user_id: &str, mutation_id: Uuid) -> Result<bool, CacheError>;

    /// キュー順の未確定変更
    async fn pending(&self, user_id: &str) -> Result<Vec<PendingMutation>, CacheError>;
}

/// In-process cache holding serialized entries, like an external KV store would.
#[derive(Debug, Default, Clone)]
pub struct MemoryCacheStore {
    preferences: Arc<RwLock<HashMap<String, String>>>,
    pending: Arc<RwLock<HashMap<String, Vec<(Uuid, String)>>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn load_preferences(
        &self,
        user_id: &str,
    ) -> Result<Option<PrivacyPreferences>, CacheError> {
        let preferences = self.preferences.read().await;
        preferences
            .get(user_id)
            .map(|raw| serde_json::from_str(raw).map_err(CacheError::from))
            .transpose()
    }

    async fn store_preferences(&self, preferences: &PrivacyPreferences) -> Result<(), CacheError> {
        let raw = serde_json::to_string(preferences)?;
        self.preferences
            .write()
            .await
            .insert(preferences.user_id.clone(), raw);
        Ok(())
    }

    async fn invalidate_preferences(&self, user_id: &str) -> Result<(), CacheError> {
        self.preferences.write().await.remove(user_id);
        Ok(())
    }

    async fn put_pending(&self, mutation: &PendingMutation) -> Result<(), CacheError> {
        let raw = serde_json::to_string(mutation)?;
        let mut pending = self.pending.write().await;
        let queue = pending.entry(mutation.user_id.clone()).or_default();
        match queue.iter_mut().find(|(id, _)| *id == mutation.id) {
            Some(entry) => entry.1 = raw,
            None => queue.push((mutation.id, raw)),
        }
        Ok(())
    }

    async fn remove_pending(&self, user_id: &str, mutation_id: Uuid) -> Result<bool, CacheError> {
        let mut pending = self.pending.write().await;
        let Some(queue) = pending.get_mut(user_id) else {
            return Ok(false);
        };
        let before = queue.len();
        queue.retain(|(id, _)| *id != mutation_id);
        let removed = queue.len() != before;
        if queue.is_empty() {
            pending.remove(user_id);
        }
        Ok(removed)
    }

    async fn pending(&self, user_id: &str) -> Result<Vec<PendingMutation>, CacheError> {
        let pending = self.pending.read().await;
        pending
            .get(user_id)
            .map(|queue| {
                queue
                    .iter()
                    .map(|(_, raw)| serde_json::from_str(raw).map_err(CacheError::from))
                    .collect()
            })
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}
