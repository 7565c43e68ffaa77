//! Remote Compliance Authority
//!
//! 外部の同意・権利行使管理サービスとの境界

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::compliance::types::{ConsentRecord, DataRightsRequest, ParentalConsentRequest};
use crate::error::RemoteError;

/// リモートからの受領確認
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    /// 受領したエンティティのID
    pub id: Uuid,
    pub received_at: DateTime<Utc>,
    /// 同一内容を既に受領済みだった場合 `true`
    pub duplicate: bool,
}

/// Authoritative store for consent records and rights requests.
///
/// Pushes carry the entity id as the idempotency key: re-sending an entity
/// the authority already holds must be acknowledged, not duplicated.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteAuthority: Send + Sync + std::fmt::Debug {
    async fn push_consent(&self, record: &ConsentRecord) -> Result<Acknowledgement, RemoteError>;

    async fn push_rights_request(
        &self,
        request: &DataRightsRequest,
    ) -> Result<Acknowledgement, RemoteError>;

    async fn push_parental_consent(
        &self,
        request: &ParentalConsentRequest,
    ) -> Result<Acknowledgement, RemoteError>;

    async fn fetch_consents(&self, user_id: &str) -> Result<Vec<ConsentRecord>, RemoteError>;

    async fn fetch_rights_requests(
        &self,
        user_id: &str,
    ) -> Result<Vec<DataRightsRequest>, RemoteError>;
}

#[derive(Debug, Default)]
struct AuthorityState {
    consents: HashMap<Uuid, ConsentRecord>,
    rights_requests: HashMap<Uuid, DataRightsRequest>,
    parental_requests: HashMap<Uuid, ParentalConsentRequest>,
    pending_failures: Vec<RemoteError>,
    pushes: usize,
}

/// インメモリのリモート実装（ローカル実行・テスト用）
///
/// Failures queued with [`fail_next`](Self::fail_next) are returned by the
/// next calls in FIFO order, before any state is touched.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRemoteAuthority {
    state: Arc<RwLock<AuthorityState>>,
    latency: Option<Duration>,
}

impl InMemoryRemoteAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// 各呼び出しに遅延を加える
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// 次の呼び出しを指定エラーで失敗させる
    pub async fn fail_next(&self, error: RemoteError) {
        self.state.write().await.pending_failures.push(error);
    }

    /// 受領済みのpush回数（重複含む）
    pub async fn push_count(&self) -> usize {
        self.state.read().await.pushes
    }

    pub async fn consent_count(&self) -> usize {
        self.state.read().await.consents.len()
    }

    pub async fn rights_request(&self, request_id: Uuid) -> Option<DataRightsRequest> {
        self.state
            .read()
            .await
            .rights_requests
            .get(&request_id)
            .cloned()
    }

    pub async fn parental_request(&self, request_id: Uuid) -> Option<ParentalConsentRequest> {
        self.state
            .read()
            .await
            .parental_requests
            .get(&request_id)
            .cloned()
    }

    /// Stores a record as if another node had pushed it.
    pub async fn seed_consent(&self, record: ConsentRecord) {
        self.state.write().await.consents.insert(record.id, record);
    }

    pub async fn seed_rights_request(&self, request: DataRightsRequest) {
        self.state
            .write()
            .await
            .rights_requests
            .insert(request.id, request);
    }

    async fn begin_call(&self) -> Result<(), RemoteError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.write().await;
        if state.pending_failures.is_empty() {
            Ok(())
        } else {
            Err(state.pending_failures.remove(0))
        }
    }

    fn upsert<T: Clone + PartialEq>(
        map: &mut HashMap<Uuid, T>,
        id: Uuid,
        entity: &T,
    ) -> Acknowledgement {
        let duplicate = map.get(&id) == Some(entity);
        if !duplicate {
            map.insert(id, entity.clone());
        }
        Acknowledgement {
            id,
            received_at: Utc::now(),
            duplicate,
        }
    }
}

#[async_trait]
impl RemoteAuthority for InMemoryRemoteAuthority {
    async fn push_consent(&self, record: &ConsentRecord) -> Result<Acknowledgement, RemoteError> {
        self.begin_call().await?;
        let mut state = self.state.write().await;
        state.pushes += 1;
        // consent records are immutable once accepted
        if let Some(existing) = state.consents.get(&record.id) {
            if existing != record {
                return Err(RemoteError::Rejected(format!(
                    "consent record {} already exists with different content",
                    record.id
                )));
            }
        }
        let ack = Self::upsert(&mut state.consents, record.id, record);
        debug!("Remote accepted consent {} (duplicate: {})", ack.id, ack.duplicate);
        Ok(ack)
    }

    async fn push_rights_request(
        &self,
        request: &DataRightsRequest,
    ) -> Result<Acknowledgement, RemoteError> {
        self.begin_call().await?;
        let mut state = self.state.write().await;
        state.pushes += 1;
        let ack = Self::upsert(&mut state.rights_requests, request.id, request);
        debug!(
            "Remote accepted rights request {} (duplicate: {})",
            ack.id, ack.duplicate
        );
        Ok(ack)
    }

    async fn push_parental_consent(
        &self,
        request: &ParentalConsentRequest,
    ) -> Result<Acknowledgement, RemoteError> {
        self.begin_call().await?;
        let mut state = self.state.write().await;
        state.pushes += 1;
        Ok(Self::upsert(&mut state.parental_requests, request.id, request))
    }

    async fn fetch_consents(&self, user_id: &str) -> Result<Vec<ConsentRecord>, RemoteError> {
        self.begin_call().await?;
        let state = self.state.read().await;
        let mut records: Vec<_> = state
            .consents
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }

    async fn fetch_rights_requests(
        &self,
        user_id: &str,
    ) -> Result<Vec<DataRightsRequest>, RemoteError> {
        self.begin_call().await?;
        let state = self.state.read().await;
        let mut requests: Vec<_> = state
            .rights_requests
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.submitted_at);
        Ok(requests)
    }
}
