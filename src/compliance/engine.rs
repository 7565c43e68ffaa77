//! Privacy Compliance Engine
//!
//! 書き込みスルー型のコンプライアンスエンジン
//!
//! Every mutation runs under the user's lock and follows the same path:
//! validate against local state, queue a pending mutation in the cache
//! store, push to the remote authority, then apply locally. Local state is
//! never touched before the remote acknowledges.
//!
//! On cancellation or a remote rejection the pending entry is dropped. On a
//! transient failure it stays queued so the caller can retry with the same
//! idempotency key.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::age_gate::{AgeGate, ParentalTransition};
use super::clock::{Clock, SystemClock};
use super::consent_ledger::ConsentLedger;
use super::evaluator::ComplianceEvaluator;
use super::region_policy::RegionPolicyResolver;
use super::rights_requests::RightsRequestTracker;
use super::types::*;
use crate::config::{ComplianceConfig, EngineSettings};
use crate::error::{Error, RemoteError, Result};
use crate::sync::{
    Acknowledgement, CacheStore, InMemoryRemoteAuthority, MemoryCacheStore, Mutation,
    PendingMutation, RemoteAuthority, RetryPolicy, UserLocks,
};

/// 書き込みオプション
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Reused as the record/request id; a repeated key returns the committed value.
    pub idempotency_key: Option<Uuid>,
    /// Cancels the remote call before acknowledgement.
    pub cancel: CancellationToken,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idempotency_key(mut self, key: Uuid) -> Self {
        self.idempotency_key = Some(key);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    fn mutation_id(&self) -> Uuid {
        self.idempotency_key.unwrap_or_else(Uuid::new_v4)
    }

    /// Per-item options for batch updates. Keys are derived deterministically
    /// so a retried batch reuses the same ids.
    fn for_item(&self, index: usize, purpose: DataProcessingPurpose) -> Self {
        Self {
            idempotency_key: self
                .idempotency_key
                .map(|key| Uuid::new_v5(&key, format!("{}:{}", index, purpose).as_bytes())),
            cancel: self.cancel.clone(),
        }
    }
}

/// 権利行使リクエストの提出内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRightsRequest {
    pub region: RegionCode,
    pub request_type: RequestType,
    pub description: String,
    pub priority: RequestPriority,
}

impl NewRightsRequest {
    pub fn new(region: RegionCode, request_type: RequestType) -> Self {
        Self {
            region,
            request_type,
            description: String::new(),
            priority: RequestPriority::Normal,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Read result annotated with the user's sync freshness.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Synced<T> {
    pub value: T,
    /// Never synced, or last sync older than the staleness window
    pub stale: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// 同期結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub user_id: String,
    pub consents_merged: usize,
    pub requests_merged: usize,
    pub synced_at: DateTime<Utc>,
}

/// エンジンビルダー
pub struct EngineBuilder {
    policy: Arc<RegionPolicyResolver>,
    settings: EngineSettings,
    clock: Option<Arc<dyn Clock>>,
    remote: Option<Arc<dyn RemoteAuthority>>,
    cache: Option<Arc<dyn CacheStore>>,
}

impl EngineBuilder {
    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Defaults to an [`InMemoryRemoteAuthority`] when unset.
    pub fn remote(mut self, remote: Arc<dyn RemoteAuthority>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Defaults to a [`MemoryCacheStore`] when unset.
    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> PrivacyComplianceEngine {
        let settings = self.settings;
        let policy = self.policy;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let age_gate = Arc::new(
            AgeGate::new(policy.clone(), clock.clone()).with_response_window(ChronoDuration::days(
                i64::from(settings.parental_consent_timeout_days),
            )),
        );
        let ledger = Arc::new(ConsentLedger::new(
            policy.clone(),
            age_gate.clone(),
            clock.clone(),
        ));
        let rights = Arc::new(RightsRequestTracker::new(policy.clone(), clock.clone()));
        let evaluator = ComplianceEvaluator::new(
            ledger.clone(),
            rights.clone(),
            age_gate.clone(),
            clock.clone(),
        )
        .with_threshold(settings.compliance_threshold);

        info!(
            "Compliance engine ready: {} regions, remote timeout {}ms, staleness window {}s",
            policy.regions().count(),
            settings.remote_timeout_ms,
            settings.staleness_window_secs
        );

        PrivacyComplianceEngine {
            policy,
            clock,
            age_gate,
            ledger,
            rights,
            evaluator,
            remote: self
                .remote
                .unwrap_or_else(|| Arc::new(InMemoryRemoteAuthority::new())),
            cache: self.cache.unwrap_or_else(|| Arc::new(MemoryCacheStore::new())),
            locks: UserLocks::new(),
            last_sync: RwLock::new(HashMap::new()),
            retry: RetryPolicy::from_settings(&settings.retry),
            remote_timeout: Duration::from_millis(settings.remote_timeout_ms),
            staleness_window: ChronoDuration::seconds(
                i64::try_from(settings.staleness_window_secs).unwrap_or(i64::MAX / 1000),
            ),
        }
    }
}

/// プライバシー・同意コンプライアンスエンジン
#[derive(Debug)]
pub struct PrivacyComplianceEngine {
    policy: Arc<RegionPolicyResolver>,
    clock: Arc<dyn Clock>,
    age_gate: Arc<AgeGate>,
    ledger: Arc<ConsentLedger>,
    rights: Arc<RightsRequestTracker>,
    evaluator: ComplianceEvaluator,
    remote: Arc<dyn RemoteAuthority>,
    cache: Arc<dyn CacheStore>,
    locks: UserLocks,
    /// 利用者ごとの最終同期時刻
    last_sync: RwLock<HashMap<String, DateTime<Utc>>>,
    retry: RetryPolicy,
    remote_timeout: Duration,
    staleness_window: ChronoDuration,
}

impl PrivacyComplianceEngine {
    pub fn builder(policy: Arc<RegionPolicyResolver>) -> EngineBuilder {
        EngineBuilder {
            policy,
            settings: EngineSettings::default(),
            clock: None,
            remote: None,
            cache: None,
        }
    }

    /// Loads the region table named by the configuration (or the built-in
    /// one) and returns a builder carrying the engine settings.
    pub fn from_config(config: &ComplianceConfig) -> Result<EngineBuilder> {
        let policy = RegionPolicyResolver::load(config.policy.region_table.as_deref())?;
        Ok(Self::builder(Arc::new(policy)).settings(config.engine.clone()))
    }

    pub fn policy(&self) -> &Arc<RegionPolicyResolver> {
        &self.policy
    }

    pub fn ledger(&self) -> &Arc<ConsentLedger> {
        &self.ledger
    }

    pub fn rights(&self) -> &Arc<RightsRequestTracker> {
        &self.rights
    }

    pub fn age_gate(&self) -> &Arc<AgeGate> {
        &self.age_gate
    }

    pub fn evaluator(&self) -> &ComplianceEvaluator {
        &self.evaluator
    }

    // ----- consent -----

    /// 同意を記録
    pub async fn record_consent(
        &self,
        user_id: &str,
        grant: &ConsentGrant,
        opts: &WriteOptions,
    ) -> Result<ConsentRecord> {
        let _guard = self.locks.acquire(user_id).await;
        if let Some(existing) = self
            .replayed_consent(user_id, opts, grant.purpose, true)
            .await?
        {
            return Ok(existing);
        }

        let id = opts.mutation_id();
        let record = self.ledger.prepare_grant(user_id, grant, Some(id)).await?;
        self.write_through(
            opts,
            self.pending(user_id, id, Mutation::Consent(record.clone())),
            || self.remote.push_consent(&record),
        )
        .await?;

        self.ledger.append(record.clone()).await;
        self.refresh_preferences(user_id).await;
        Ok(record)
    }

    /// 同意を撤回
    pub async fn withdraw_consent(
        &self,
        user_id: &str,
        purpose: DataProcessingPurpose,
        opts: &WriteOptions,
    ) -> Result<ConsentRecord> {
        let _guard = self.locks.acquire(user_id).await;
        if let Some(existing) = self
            .replayed_consent(user_id, opts, purpose, false)
            .await?
        {
            return Ok(existing);
        }

        let id = opts.mutation_id();
        let record = self
            .ledger
            .prepare_withdrawal(user_id, purpose, Some(id))
            .await?;
        self.write_through(
            opts,
            self.pending(user_id, id, Mutation::Consent(record.clone())),
            || self.remote.push_consent(&record),
        )
        .await?;

        self.ledger.append(record.clone()).await;
        self.refresh_preferences(user_id).await;
        Ok(record)
    }

    /// 一括更新（非トランザクション）
    pub async fn batch_update_consent(
        &self,
        user_id: &str,
        updates: &[ConsentUpdate],
        opts: &WriteOptions,
    ) -> BatchUpdateResult {
        let mut result = BatchUpdateResult::default();

        for (index, update) in updates.iter().enumerate() {
            let item_opts = opts.for_item(index, update.purpose());
            let outcome = match update {
                ConsentUpdate::Grant(grant) => {
                    self.record_consent(user_id, grant, &item_opts).await
                }
                ConsentUpdate::Withdraw(purpose) => {
                    self.withdraw_consent(user_id, *purpose, &item_opts).await
                }
            };
            match outcome {
                Ok(_) => result.updated += 1,
                Err(e) => result.failed.push(BatchFailure {
                    purpose: update.purpose(),
                    code: e.code().to_string(),
                    reason: e.to_string(),
                }),
            }
        }

        if !result.failed.is_empty() {
            warn!(
                "Batch consent update for user {}: {} updated, {} failed",
                user_id,
                result.updated,
                result.failed.len()
            );
        }
        result
    }

    // ----- age gate -----

    /// 年齢を確認（ローカルのみ）
    pub async fn verify_age(
        &self,
        user_id: &str,
        region: RegionCode,
        birth_date: NaiveDate,
        method: AgeVerificationMethod,
    ) -> Result<AgeVerificationResult> {
        let _guard = self.locks.acquire(user_id).await;
        self.age_gate
            .verify_age(user_id, region, birth_date, method)
            .await
    }

    /// 保護者同意を依頼（ローカルのみ）
    pub async fn request_parental_consent(
        &self,
        user_id: &str,
        parent_email: &str,
    ) -> Result<ParentalConsentRequest> {
        let _guard = self.locks.acquire(user_id).await;
        self.age_gate
            .request_parental_consent(user_id, parent_email)
            .await
    }

    pub async fn mark_parental_consent_sent(
        &self,
        request_id: Uuid,
    ) -> Result<ParentalConsentRequest> {
        let user_id = self.age_gate.parental_request(request_id).await?.user_id;
        let _guard = self.locks.acquire(&user_id).await;

        match self
            .age_gate
            .prepare_transition(request_id, ParentalConsentStatus::Sent)
            .await?
        {
            ParentalTransition::Apply(updated) => {
                info!(
                    "Parental consent request {} for user {} is now {}",
                    request_id, user_id, updated.status
                );
                self.age_gate.store_parental_request(updated.clone()).await;
                Ok(updated)
            }
            ParentalTransition::Expire(expired) => {
                self.reject_expired(expired, &WriteOptions::new()).await?;
                Err(Error::ParentalConsentExpired(request_id))
            }
        }
    }

    /// 保護者同意を確認
    pub async fn confirm_parental_consent(
        &self,
        request_id: Uuid,
        opts: &WriteOptions,
    ) -> Result<ParentalConsentRequest> {
        self.decide_parental_consent(request_id, ParentalConsentStatus::Verified, opts)
            .await
    }

    /// 保護者が拒否
    pub async fn reject_parental_consent(
        &self,
        request_id: Uuid,
        opts: &WriteOptions,
    ) -> Result<ParentalConsentRequest> {
        self.decide_parental_consent(request_id, ParentalConsentStatus::Rejected, opts)
            .await
    }

    async fn decide_parental_consent(
        &self,
        request_id: Uuid,
        decision: ParentalConsentStatus,
        opts: &WriteOptions,
    ) -> Result<ParentalConsentRequest> {
        let user_id = self.age_gate.parental_request(request_id).await?.user_id;
        let _guard = self.locks.acquire(&user_id).await;

        let updated = match self.age_gate.prepare_transition(request_id, decision).await? {
            ParentalTransition::Apply(updated) => updated,
            ParentalTransition::Expire(expired) => {
                self.reject_expired(expired, opts).await?;
                return Err(Error::ParentalConsentExpired(request_id));
            }
        };
        self.write_through(
            opts,
            self.pending(
                &user_id,
                opts.mutation_id(),
                Mutation::ParentalConsent(updated.clone()),
            ),
            || self.remote.push_parental_consent(&updated),
        )
        .await?;

        info!(
            "Parental consent request {} for user {} is now {}",
            request_id, user_id, decision
        );
        self.age_gate.store_parental_request(updated.clone()).await;
        Ok(updated)
    }

    /// 回答期限切れの保護者同意リクエストを拒否に移す
    ///
    /// Each rejection is written through on its own. A request whose write
    /// fails stays open and is picked up by the next sweep; cancellation
    /// stops the sweep.
    pub async fn expire_parental_requests(
        &self,
        cancel: &CancellationToken,
    ) -> Vec<ParentalConsentRequest> {
        let mut expired = Vec::new();

        for candidate in self.age_gate.stale_requests().await {
            let _guard = self.locks.acquire(&candidate.user_id).await;
            // re-check under the lock, a decision may have landed meanwhile
            let Some(rejected) = self
                .age_gate
                .parental_request(candidate.id)
                .await
                .ok()
                .and_then(|current| self.age_gate.expire_if_stale(&current))
            else {
                continue;
            };

            let opts = WriteOptions::new().with_cancellation(cancel.clone());
            match self.reject_expired(rejected, &opts).await {
                Ok(request) => expired.push(request),
                Err(Error::Cancelled) => break,
                Err(e) => warn!(
                    "Could not expire parental consent request {}: {}",
                    candidate.id, e
                ),
            }
        }

        if !expired.is_empty() {
            info!("Expired {} stale parental consent requests", expired.len());
        }
        expired
    }

    /// Writes the rejection of an expired parental request through, then
    /// stores it. Caller holds the user's lock.
    async fn reject_expired(
        &self,
        expired: ParentalConsentRequest,
        opts: &WriteOptions,
    ) -> Result<ParentalConsentRequest> {
        self.write_through(
            opts,
            self.pending(
                &expired.user_id,
                opts.mutation_id(),
                Mutation::ParentalConsent(expired.clone()),
            ),
            || self.remote.push_parental_consent(&expired),
        )
        .await?;

        warn!(
            "Parental consent request {} for user {} rejected after the response window",
            expired.id, expired.user_id
        );
        self.age_gate.store_parental_request(expired.clone()).await;
        Ok(expired)
    }

    // ----- rights requests -----

    /// 権利行使リクエストを提出
    pub async fn submit_rights_request(
        &self,
        user_id: &str,
        request: &NewRightsRequest,
        opts: &WriteOptions,
    ) -> Result<DataRightsRequest> {
        let _guard = self.locks.acquire(user_id).await;
        if let Some(key) = opts.idempotency_key {
            if let Ok(existing) = self.rights.get_request(key).await {
                if existing.user_id == user_id {
                    debug!("Replaying rights request {} for user {}", key, user_id);
                    return Ok(existing);
                }
            }
        }

        let id = opts.mutation_id();
        let prepared = self.rights.prepare_submission(
            user_id,
            request.region,
            request.request_type,
            &request.description,
            request.priority,
            Some(id),
        )?;
        self.write_through(
            opts,
            self.pending(user_id, id, Mutation::RightsRequest(prepared.clone())),
            || self.remote.push_rights_request(&prepared),
        )
        .await?;

        self.rights.insert(prepared.clone()).await;
        Ok(prepared)
    }

    /// 期限を延長（1回のみ）
    pub async fn extend_rights_request(
        &self,
        request_id: Uuid,
        reason: &str,
        opts: &WriteOptions,
    ) -> Result<DataRightsRequest> {
        let user_id = self.rights.get_request(request_id).await?.user_id;
        let _guard = self.locks.acquire(&user_id).await;

        let updated = self.rights.prepare_extension(request_id, reason).await?;
        self.write_through(
            opts,
            self.pending(
                &user_id,
                opts.mutation_id(),
                Mutation::RightsRequest(updated.clone()),
            ),
            || self.remote.push_rights_request(&updated),
        )
        .await?;

        info!(
            "Rights request {} extended to {:?}",
            request_id, updated.extended_deadline
        );
        self.rights
            .commit(updated.clone(), "deadline_extended", reason.to_string())
            .await;
        Ok(updated)
    }

    /// ステータスを遷移
    pub async fn transition_rights_request(
        &self,
        request_id: Uuid,
        next: RequestStatus,
        opts: &WriteOptions,
    ) -> Result<DataRightsRequest> {
        let user_id = self.rights.get_request(request_id).await?.user_id;
        let _guard = self.locks.acquire(&user_id).await;

        let previous = self.rights.get_request(request_id).await?.status;
        let updated = self.rights.prepare_transition(request_id, next).await?;
        self.write_through(
            opts,
            self.pending(
                &user_id,
                opts.mutation_id(),
                Mutation::RightsRequest(updated.clone()),
            ),
            || self.remote.push_rights_request(&updated),
        )
        .await?;

        info!("Rights request {} moved {} -> {}", request_id, previous, next);
        self.rights
            .commit(
                updated.clone(),
                "status_updated",
                format!("From {} to {}", previous, next),
            )
            .await;
        Ok(updated)
    }

    /// 期限超過リクエスト（全利用者）
    pub async fn overdue_requests(&self, now: DateTime<Utc>) -> Vec<DataRightsRequest> {
        self.rights.overdue(now).await
    }

    pub async fn rights_requests(&self, user_id: &str) -> Synced<Vec<DataRightsRequest>> {
        let requests = self.rights.requests_for_user(user_id).await;
        self.synced(user_id, requests).await
    }

    // ----- reads -----

    /// 現在の同意状態（キャッシュ優先）
    pub async fn current_state(&self, user_id: &str) -> Synced<PrivacyPreferences> {
        let preferences = match self.cache.load_preferences(user_id).await {
            Ok(Some(cached)) => cached,
            Ok(None) => self.refresh_preferences(user_id).await,
            Err(e) => {
                warn!(
                    "Preference cache read failed for user {}, rebuilding from ledger: {}",
                    user_id, e
                );
                self.ledger.current_state(user_id).await
            }
        };
        self.synced(user_id, preferences).await
    }

    pub async fn needs_renewal(&self, user_id: &str) -> Synced<RenewalStatus> {
        let status = self.ledger.needs_renewal(user_id).await;
        self.synced(user_id, status).await
    }

    pub async fn evaluate(&self, user_id: &str) -> Synced<ComplianceReport> {
        let report = self.evaluator.evaluate(user_id).await;
        self.synced(user_id, report).await
    }

    /// 未確定の変更一覧
    pub async fn pending_mutations(&self, user_id: &str) -> Result<Vec<PendingMutation>> {
        Ok(self.cache.pending(user_id).await?)
    }

    pub async fn last_synced_at(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.last_sync.read().await.get(user_id).copied()
    }

    pub async fn is_stale(&self, user_id: &str) -> bool {
        self.synced(user_id, ()).await.stale
    }

    // ----- sync -----

    /// リモートから利用者の状態を取り込む
    pub async fn sync_user(
        &self,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary> {
        let _guard = self.locks.acquire(user_id).await;

        let fetch = async {
            futures::try_join!(
                self.call_remote(|| self.remote.fetch_consents(user_id)),
                self.call_remote(|| self.remote.fetch_rights_requests(user_id)),
            )
        };
        let (consents, requests) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Sync for user {} cancelled", user_id);
                return Err(Error::Cancelled);
            }
            fetched = fetch => fetched?,
        };

        let consents_merged = self.ledger.merge(consents).await;
        let requests_merged = self.rights.merge(requests).await;
        self.refresh_preferences(user_id).await;
        let synced_at = self.mark_synced(user_id).await;

        info!(
            "Synced user {}: {} consent records, {} rights requests merged",
            user_id, consents_merged, requests_merged
        );
        Ok(SyncSummary {
            user_id: user_id.to_string(),
            consents_merged,
            requests_merged,
            synced_at,
        })
    }

    // ----- internals -----

    /// The committed record for a repeated key. A key already used for a
    /// different purpose or direction is rejected.
    async fn replayed_consent(
        &self,
        user_id: &str,
        opts: &WriteOptions,
        purpose: DataProcessingPurpose,
        granted: bool,
    ) -> Result<Option<ConsentRecord>> {
        let Some(key) = opts.idempotency_key else {
            return Ok(None);
        };
        let Some(existing) = self.ledger.find_record(user_id, key).await else {
            return Ok(None);
        };
        if existing.purpose != purpose || existing.granted != granted {
            warn!(
                "Idempotency key {} for user {} already used for another consent change",
                key, user_id
            );
            return Err(Error::InvalidInput(format!(
                "idempotency key {} already used for {} {}",
                key,
                if existing.granted { "grant of" } else { "withdrawal of" },
                existing.purpose
            )));
        }
        debug!("Replaying consent record {} for user {}", key, user_id);
        Ok(Some(existing))
    }

    fn pending(&self, user_id: &str, id: Uuid, mutation: Mutation) -> PendingMutation {
        PendingMutation {
            id,
            user_id: user_id.to_string(),
            mutation,
            queued_at: self.clock.now(),
        }
    }

    /// Single remote call bounded by the timeout and retried per policy.
    async fn call_remote<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, RemoteError>> + Send,
        T: Send,
    {
        let limit = self.remote_timeout;
        self.retry
            .execute(|| {
                let call = operation();
                async move {
                    match tokio::time::timeout(limit, call).await {
                        Ok(result) => result,
                        Err(_) => Err(RemoteError::Timeout(
                            u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                        )),
                    }
                }
            })
            .await
            .map_err(Error::from)
    }

    async fn write_through<F, Fut>(
        &self,
        opts: &WriteOptions,
        pending: PendingMutation,
        push: F,
    ) -> Result<Acknowledgement>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = std::result::Result<Acknowledgement, RemoteError>> + Send,
    {
        if opts.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let user_id = pending.user_id.clone();
        let mutation_id = pending.id;
        let entity_id = pending.mutation.entity_id();
        self.cache.put_pending(&pending).await?;

        let outcome = tokio::select! {
            biased;
            _ = opts.cancel.cancelled() => Err(Error::Cancelled),
            acked = self.call_remote(push) => acked,
        };

        match &outcome {
            Ok(ack) => {
                debug!(
                    "Remote acknowledged {} for user {} (duplicate: {})",
                    entity_id, user_id, ack.duplicate
                );
                self.drop_pending(&user_id, mutation_id).await;
                self.mark_synced(&user_id).await;
            }
            Err(Error::Cancelled) => {
                warn!(
                    "Write of {} for user {} cancelled before acknowledgement",
                    entity_id, user_id
                );
                self.drop_pending(&user_id, mutation_id).await;
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    "Write of {} for user {} failed, kept pending as {}: {}",
                    entity_id, user_id, mutation_id, e
                );
            }
            Err(e) => {
                warn!("Remote rejected {} for user {}: {}", entity_id, user_id, e);
                self.drop_pending(&user_id, mutation_id).await;
            }
        }
        outcome
    }

    async fn drop_pending(&self, user_id: &str, mutation_id: Uuid) {
        if let Err(e) = self.cache.remove_pending(user_id, mutation_id).await {
            warn!(
                "Failed to drop pending mutation {} for user {}: {}",
                mutation_id, user_id, e
            );
        }
    }

    /// Rebuilds the cached snapshot from the ledger.
    async fn refresh_preferences(&self, user_id: &str) -> PrivacyPreferences {
        let preferences = self.ledger.current_state(user_id).await;
        if let Err(e) = self.cache.store_preferences(&preferences).await {
            warn!("Failed to cache preferences for user {}: {}", user_id, e);
            if let Err(e) = self.cache.invalidate_preferences(user_id).await {
                warn!("Failed to invalidate preferences for user {}: {}", user_id, e);
            }
        }
        preferences
    }

    async fn mark_synced(&self, user_id: &str) -> DateTime<Utc> {
        let now = self.clock.now();
        self.last_sync
            .write()
            .await
            .insert(user_id.to_string(), now);
        now
    }

    async fn synced<T>(&self, user_id: &str, value: T) -> Synced<T> {
        let last_synced_at = self.last_synced_at(user_id).await;
        let stale = match last_synced_at {
            Some(at) => self.clock.now() - at > self.staleness_window,
            None => true,
        };
        if stale {
            debug!("Serving stale data for user {}", user_id);
        }
        Synced {
            value,
            stale,
            last_synced_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::clock::ManualClock;
    use crate::compliance::region_policy::fixtures::eu_us_policy;
    use crate::error::CacheError;
    use crate::sync::{MockCacheStore, MockRemoteAuthority};
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn engine_with(
        remote: Arc<dyn RemoteAuthority>,
        settings: EngineSettings,
    ) -> (PrivacyComplianceEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let engine = PrivacyComplianceEngine::builder(eu_us_policy())
            .settings(settings)
            .clock(clock.clone())
            .remote(remote)
            .build();
        (engine, clock)
    }

    fn analytics() -> ConsentGrant {
        ConsentGrant {
            purpose: DataProcessingPurpose::Analytics,
            legal_basis: LegalBasis::Consent,
            region: RegionCode::Eu,
            method: ConsentMethod::Banner,
            version: 1,
        }
    }

    #[tokio::test]
    async fn test_write_through_applies_after_ack() {
        let remote = Arc::new(InMemoryRemoteAuthority::new());
        let (engine, _) = engine_with(remote.clone(), EngineSettings::default());

        let record = engine
            .record_consent("u1", &analytics(), &WriteOptions::new())
            .await
            .unwrap();

        assert_eq!(remote.consent_count().await, 1);
        let state = engine.current_state("u1").await;
        assert!(state.value.is_granted(DataProcessingPurpose::Analytics));
        assert!(!state.stale);
        assert_eq!(state.last_synced_at, Some(start()));
        assert_eq!(
            engine.ledger().find_record("u1", record.id).await,
            Some(record)
        );
        assert!(engine.pending_mutations("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_leaves_local_state_unchanged() {
        let mut remote = MockRemoteAuthority::new();
        remote
            .expect_push_consent()
            .times(1)
            .returning(|_| Err(RemoteError::Unavailable("connection reset".into())));
        let (engine, _) = engine_with(Arc::new(remote), EngineSettings::default());

        let err = engine
            .record_consent("u1", &analytics(), &WriteOptions::new())
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert!(engine.ledger().records_for_user("u1").await.is_empty());
        assert!(!engine
            .current_state("u1")
            .await
            .value
            .is_granted(DataProcessingPurpose::Analytics));
        let pending = engine.pending_mutations("u1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(matches!(pending[0].mutation, Mutation::Consent(_)));
    }

    #[tokio::test]
    async fn test_rejection_drops_pending_entry() {
        let mut remote = MockRemoteAuthority::new();
        remote
            .expect_push_rights_request()
            .times(1)
            .returning(|_| Err(RemoteError::Rejected("unknown user".into())));
        let (engine, _) = engine_with(Arc::new(remote), EngineSettings::default());

        let err = engine
            .submit_rights_request(
                "u1",
                &NewRightsRequest::new(RegionCode::Eu, RequestType::Access),
                &WriteOptions::new(),
            )
            .await
            .unwrap_err();

        assert!(!err.is_retryable());
        assert_eq!(err.code(), "remote_rejected");
        assert!(engine.rights().requests_for_user("u1").await.is_empty());
        assert!(engine.pending_mutations("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_with_same_key_does_not_duplicate() {
        let remote = Arc::new(InMemoryRemoteAuthority::new());
        remote.fail_next(RemoteError::Timeout(10)).await;
        let (engine, _) = engine_with(remote.clone(), EngineSettings::default());
        let key = Uuid::new_v4();
        let opts = WriteOptions::new().with_idempotency_key(key);

        assert!(engine
            .record_consent("u1", &analytics(), &opts)
            .await
            .is_err());
        assert_eq!(engine.pending_mutations("u1").await.unwrap().len(), 1);

        let record = engine
            .record_consent("u1", &analytics(), &opts)
            .await
            .unwrap();
        let replay = engine
            .record_consent("u1", &analytics(), &opts)
            .await
            .unwrap();

        assert_eq!(record.id, key);
        assert_eq!(replay, record);
        assert_eq!(engine.ledger().records_for_user("u1").await.len(), 1);
        assert_eq!(remote.consent_count().await, 1);
        assert_eq!(remote.push_count().await, 1);
        assert!(engine.pending_mutations("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_key_reused_for_other_consent_change_is_rejected() {
        let remote = Arc::new(InMemoryRemoteAuthority::new());
        let (engine, _) = engine_with(remote.clone(), EngineSettings::default());
        let opts = WriteOptions::new().with_idempotency_key(Uuid::new_v4());

        let grant = engine
            .record_consent("u1", &analytics(), &opts)
            .await
            .unwrap();
        let err = engine
            .withdraw_consent("u1", DataProcessingPurpose::Analytics, &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = engine
            .record_consent(
                "u1",
                &ConsentGrant {
                    purpose: DataProcessingPurpose::Marketing,
                    ..analytics()
                },
                &opts,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        assert_eq!(engine.ledger().records_for_user("u1").await, vec![grant]);
        assert!(engine
            .current_state("u1")
            .await
            .value
            .is_granted(DataProcessingPurpose::Analytics));
        assert_eq!(remote.push_count().await, 1);
    }

    #[tokio::test]
    async fn test_expired_parental_request_is_rejected_through_remote() {
        let mut remote = MockRemoteAuthority::new();
        remote
            .expect_push_parental_consent()
            .withf(|request| request.status == ParentalConsentStatus::Rejected)
            .times(1)
            .returning(|request| {
                Ok(Acknowledgement {
                    id: request.id,
                    received_at: Utc::now(),
                    duplicate: false,
                })
            });
        let (engine, clock) = engine_with(Arc::new(remote), EngineSettings::default());

        let request = engine
            .request_parental_consent("kid", "parent@example.com")
            .await
            .unwrap();
        clock.advance(ChronoDuration::days(15));

        let err = engine
            .mark_parental_consent_sent(request.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ParentalConsentExpired(id) if id == request.id));
        assert_eq!(
            engine.age_gate().parental_request(request.id).await.unwrap().status,
            ParentalConsentStatus::Rejected
        );
        // already rejected, nothing left to sweep or push
        assert!(engine
            .expire_parental_requests(&CancellationToken::new())
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_automatic_retry_for_transient_errors() {
        let remote = Arc::new(InMemoryRemoteAuthority::new());
        remote
            .fail_next(RemoteError::Unavailable("503".into()))
            .await;
        let settings = EngineSettings {
            retry: crate::config::RetrySettings {
                max_attempts: 2,
                initial_delay_ms: 1,
                max_delay_ms: 1,
                multiplier: 1.0,
            },
            ..EngineSettings::default()
        };
        let (engine, _) = engine_with(remote.clone(), settings);

        engine
            .record_consent("u1", &analytics(), &WriteOptions::new())
            .await
            .unwrap();
        assert_eq!(remote.consent_count().await, 1);
    }

    #[tokio::test]
    async fn test_cancel_before_ack_applies_nothing() {
        let remote =
            Arc::new(InMemoryRemoteAuthority::new().with_latency(Duration::from_millis(500)));
        let (engine, _) = engine_with(remote, EngineSettings::default());
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = engine
            .record_consent(
                "u1",
                &analytics(),
                &WriteOptions::new().with_cancellation(token),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert!(engine.ledger().records_for_user("u1").await.is_empty());
        assert!(engine.pending_mutations("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_already_cancelled_token_skips_remote() {
        // no expectations: any remote call panics
        let remote = MockRemoteAuthority::new();
        let (engine, _) = engine_with(Arc::new(remote), EngineSettings::default());
        let token = CancellationToken::new();
        token.cancel();

        let err = engine
            .record_consent(
                "u1",
                &analytics(),
                &WriteOptions::new().with_cancellation(token),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_remote_timeout_is_transient() {
        let remote =
            Arc::new(InMemoryRemoteAuthority::new().with_latency(Duration::from_millis(300)));
        let settings = EngineSettings {
            remote_timeout_ms: 20,
            ..EngineSettings::default()
        };
        let (engine, _) = engine_with(remote, settings);

        let err = engine
            .record_consent("u1", &analytics(), &WriteOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Remote(RemoteError::Timeout(20))));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_staleness_window() {
        let remote = Arc::new(InMemoryRemoteAuthority::new());
        let (engine, clock) = engine_with(remote, EngineSettings::default());

        assert!(engine.current_state("u1").await.stale);

        engine
            .record_consent("u1", &analytics(), &WriteOptions::new())
            .await
            .unwrap();
        assert!(!engine.current_state("u1").await.stale);

        clock.advance(ChronoDuration::seconds(301));
        let state = engine.current_state("u1").await;
        assert!(state.stale);
        assert!(state.value.is_granted(DataProcessingPurpose::Analytics));

        engine
            .sync_user("u1", &CancellationToken::new())
            .await
            .unwrap();
        assert!(!engine.evaluate("u1").await.stale);
    }

    #[tokio::test]
    async fn test_sync_user_merges_remote_state() {
        let remote = Arc::new(InMemoryRemoteAuthority::new());
        let (engine, _) = engine_with(remote.clone(), EngineSettings::default());

        remote
            .seed_consent(ConsentRecord {
                id: Uuid::new_v4(),
                user_id: "u1".to_string(),
                purpose: DataProcessingPurpose::Marketing,
                legal_basis: LegalBasis::Consent,
                region: RegionCode::Us,
                granted: true,
                consent_method: ConsentMethod::Settings,
                consent_version: 1,
                timestamp: start() - ChronoDuration::days(1),
                withdrawn_at: None,
            })
            .await;
        let request = engine
            .rights()
            .prepare_submission(
                "u1",
                RegionCode::Us,
                RequestType::Erasure,
                "",
                RequestPriority::High,
                None,
            )
            .unwrap();
        remote.seed_rights_request(request.clone()).await;

        let summary = engine
            .sync_user("u1", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.consents_merged, 1);
        assert_eq!(summary.requests_merged, 1);
        assert!(engine
            .current_state("u1")
            .await
            .value
            .is_granted(DataProcessingPurpose::Marketing));
        assert_eq!(engine.rights().get_request(request.id).await.unwrap(), request);

        // second sync is a no-op
        let again = engine
            .sync_user("u1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.consents_merged, 0);
        assert_eq!(again.requests_merged, 0);
    }

    #[tokio::test]
    async fn test_failed_sync_keeps_state_stale() {
        let remote = Arc::new(InMemoryRemoteAuthority::new());
        remote
            .fail_next(RemoteError::Unavailable("down".into()))
            .await;
        let (engine, _) = engine_with(remote, EngineSettings::default());

        let err = engine
            .sync_user("u1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(engine.last_synced_at("u1").await, None);
        assert!(engine.is_stale("u1").await);
    }

    #[tokio::test]
    async fn test_cache_read_failure_falls_back_to_ledger() {
        let mut cache = MockCacheStore::new();
        cache
            .expect_load_preferences()
            .returning(|_| Err(CacheError::Storage("disk full".into())));
        cache.expect_put_pending().returning(|_| Ok(()));
        cache.expect_remove_pending().returning(|_, _| Ok(true));
        cache.expect_store_preferences().returning(|_| Ok(()));

        let clock = Arc::new(ManualClock::new(start()));
        let engine = PrivacyComplianceEngine::builder(eu_us_policy())
            .clock(clock)
            .cache(Arc::new(cache))
            .build();

        engine
            .record_consent("u1", &analytics(), &WriteOptions::new())
            .await
            .unwrap();
        let state = engine.current_state("u1").await;
        assert!(state.value.is_granted(DataProcessingPurpose::Analytics));
    }

    #[tokio::test]
    async fn test_pending_queue_failure_aborts_write() {
        let mut cache = MockCacheStore::new();
        cache
            .expect_put_pending()
            .returning(|_| Err(CacheError::Storage("unavailable".into())));
        let remote = MockRemoteAuthority::new();

        let engine = PrivacyComplianceEngine::builder(eu_us_policy())
            .remote(Arc::new(remote))
            .cache(Arc::new(cache))
            .build();

        let err = engine
            .record_consent("u1", &analytics(), &WriteOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cache(_)));
        assert!(engine.ledger().records_for_user("u1").await.is_empty());
    }

    #[tokio::test]
    async fn test_batch_update_reports_failures_and_continues() {
        let remote = Arc::new(InMemoryRemoteAuthority::new());
        let (engine, _) = engine_with(remote, EngineSettings::default());

        let result = engine
            .batch_update_consent(
                "u1",
                &[
                    ConsentUpdate::Grant(analytics()),
                    ConsentUpdate::Withdraw(DataProcessingPurpose::Marketing),
                    ConsentUpdate::Grant(ConsentGrant {
                        purpose: DataProcessingPurpose::Personalization,
                        ..analytics()
                    }),
                ],
                &WriteOptions::new().with_idempotency_key(Uuid::new_v4()),
            )
            .await;

        assert_eq!(result.updated, 2);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].purpose, DataProcessingPurpose::Marketing);
        assert_eq!(result.failed[0].code, "no_active_consent");
    }

    #[tokio::test]
    async fn test_batch_with_same_purpose_twice() {
        let remote = Arc::new(InMemoryRemoteAuthority::new());
        let (engine, clock) = engine_with(remote, EngineSettings::default());
        let opts = WriteOptions::new().with_idempotency_key(Uuid::new_v4());

        engine
            .record_consent("u1", &analytics(), &WriteOptions::new())
            .await
            .unwrap();
        clock.advance(ChronoDuration::seconds(1));

        let result = engine
            .batch_update_consent(
                "u1",
                &[
                    ConsentUpdate::Withdraw(DataProcessingPurpose::Analytics),
                    ConsentUpdate::Grant(analytics()),
                ],
                &opts,
            )
            .await;

        assert_eq!(result.updated, 2);
        assert_eq!(
            engine
                .ledger()
                .history("u1", DataProcessingPurpose::Analytics)
                .await
                .len(),
            3
        );
    }

    #[tokio::test]
    async fn test_rights_request_lifecycle_is_pushed() {
        let remote = Arc::new(InMemoryRemoteAuthority::new());
        let (engine, _) = engine_with(remote.clone(), EngineSettings::default());
        let opts = WriteOptions::new();

        let request = engine
            .submit_rights_request(
                "u1",
                &NewRightsRequest::new(RegionCode::Eu, RequestType::Portability)
                    .with_description("export")
                    .with_priority(RequestPriority::High),
                &opts,
            )
            .await
            .unwrap();
        engine
            .transition_rights_request(
                request.id,
                RequestStatus::IdentityVerificationPending,
                &opts,
            )
            .await
            .unwrap();
        engine
            .transition_rights_request(request.id, RequestStatus::InProgress, &opts)
            .await
            .unwrap();
        let extended = engine
            .extend_rights_request(request.id, "complex export", &opts)
            .await
            .unwrap();

        assert_eq!(extended.status, RequestStatus::Extended);
        assert_eq!(
            extended.extended_deadline,
            Some(request.deadline + ChronoDuration::days(60))
        );
        assert_eq!(remote.rights_request(request.id).await, Some(extended.clone()));
        assert_eq!(
            engine.rights().get_request(request.id).await.unwrap(),
            extended
        );

        let err = engine
            .extend_rights_request(request.id, "again", &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExtended(_)));
    }

    #[tokio::test]
    async fn test_failed_transition_keeps_local_status() {
        let remote = Arc::new(InMemoryRemoteAuthority::new());
        let (engine, _) = engine_with(remote.clone(), EngineSettings::default());

        let request = engine
            .submit_rights_request(
                "u1",
                &NewRightsRequest::new(RegionCode::Us, RequestType::Access),
                &WriteOptions::new(),
            )
            .await
            .unwrap();
        remote
            .fail_next(RemoteError::Unavailable("down".into()))
            .await;

        assert!(engine
            .transition_rights_request(request.id, RequestStatus::Withdrawn, &WriteOptions::new())
            .await
            .is_err());
        assert_eq!(
            engine.rights().get_request(request.id).await.unwrap().status,
            RequestStatus::Submitted
        );
    }

    #[tokio::test]
    async fn test_parental_confirmation_is_pushed() {
        let remote = Arc::new(InMemoryRemoteAuthority::new());
        let (engine, _) = engine_with(remote.clone(), EngineSettings::default());

        engine
            .verify_age(
                "kid",
                RegionCode::Us,
                NaiveDate::from_ymd_opt(2015, 1, 1).unwrap(),
                AgeVerificationMethod::Document,
            )
            .await
            .unwrap();
        let blocked = engine
            .record_consent("kid", &analytics(), &WriteOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(blocked, Error::ParentalConsentRequired { .. }));

        let request = engine
            .request_parental_consent("kid", "parent@example.com")
            .await
            .unwrap();
        engine.mark_parental_consent_sent(request.id).await.unwrap();
        let verified = engine
            .confirm_parental_consent(request.id, &WriteOptions::new())
            .await
            .unwrap();

        assert_eq!(verified.status, ParentalConsentStatus::Verified);
        assert_eq!(remote.parental_request(request.id).await, Some(verified));
        engine
            .record_consent("kid", &analytics(), &WriteOptions::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_from_config_uses_builtin_table() {
        let builder = PrivacyComplianceEngine::from_config(&ComplianceConfig::default()).unwrap();
        let engine = builder.build();
        assert_eq!(engine.evaluator().threshold(), 80);
        assert!(engine.policy().requirements_for(RegionCode::Jp).is_ok());
    }
}
