//! Rights Request Tracker
//!
//! データ主体の権利行使リクエストの状態管理と期限追跡
//!
//! `deadline` is fixed at submission from the region's deadline table. The
//! only later change to a request's timing is a single extension, which sets
//! `extended_deadline = deadline + extension_days(region, type)`.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::clock::Clock;
use super::region_policy::RegionPolicyResolver;
use super::types::*;
use crate::error::{Error, Result};

/// リクエスト処理履歴
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RequestHistory {
    /// リクエストID
    pub request_id: Uuid,
    /// アクション
    pub action: String,
    /// タイムスタンプ
    pub timestamp: DateTime<Utc>,
    /// 詳細
    pub details: String,
}

/// 権利行使リクエスト追跡システム
#[derive(Debug)]
pub struct RightsRequestTracker {
    policy: Arc<RegionPolicyResolver>,
    clock: Arc<dyn Clock>,
    /// リクエストストレージ
    requests: Arc<RwLock<HashMap<Uuid, DataRightsRequest>>>,
    /// 処理履歴
    history: Arc<RwLock<Vec<RequestHistory>>>,
}

impl RightsRequestTracker {
    pub fn new(policy: Arc<RegionPolicyResolver>, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            requests: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// リクエストを作成（保存はしない）
    pub fn prepare_submission(
        &self,
        user_id: &str,
        region: RegionCode,
        request_type: RequestType,
        description: &str,
        priority: RequestPriority,
        request_id: Option<Uuid>,
    ) -> Result<DataRightsRequest> {
        let days = self.policy.deadline_days(region, request_type)?;
        let submitted_at = self.clock.now();

        Ok(DataRightsRequest {
            id: request_id.unwrap_or_else(Uuid::new_v4),
            user_id: user_id.to_string(),
            region,
            request_type,
            description: description.to_string(),
            priority,
            status: RequestStatus::Submitted,
            submitted_at,
            deadline: submitted_at + Duration::days(i64::from(days)),
            extended_deadline: None,
            extension_reason: None,
            resolved_at: None,
        })
    }

    /// 新規リクエストを保存する。同じIDが既にあれば保存せず `false` を返す
    pub(crate) async fn insert(&self, request: DataRightsRequest) -> bool {
        {
            let mut requests = self.requests.write().await;
            if requests.contains_key(&request.id) {
                debug!("Rights request {} already tracked", request.id);
                return false;
            }
            requests.insert(request.id, request.clone());
        }

        info!(
            "Rights request {} ({}) submitted for user {}, due {}",
            request.id, request.request_type, request.user_id, request.deadline
        );
        self.add_history(
            request.id,
            "submitted",
            format!(
                "Request type: {}, priority: {}, deadline: {}",
                request.request_type,
                request.priority,
                request.deadline.to_rfc3339()
            ),
        )
        .await;
        true
    }

    /// リクエストを提出（リモートを経由しない）
    #[cfg(test)]
    pub(crate) async fn submit(
        &self,
        user_id: &str,
        region: RegionCode,
        request_type: RequestType,
        description: &str,
        priority: RequestPriority,
    ) -> Result<DataRightsRequest> {
        let request =
            self.prepare_submission(user_id, region, request_type, description, priority, None)?;
        self.insert(request.clone()).await;
        Ok(request)
    }

    /// リクエストを取得
    pub async fn get_request(&self, request_id: Uuid) -> Result<DataRightsRequest> {
        let requests = self.requests.read().await;
        requests
            .get(&request_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Request not found: {}", request_id)))
    }

    fn apply_extension(&self, request: &mut DataRightsRequest, reason: &str) -> Result<()> {
        let days = self
            .policy
            .extension_days(request.region, request.request_type)?;
        request.extended_deadline = Some(request.deadline + Duration::days(i64::from(days)));
        request.extension_reason = Some(reason.to_string());
        Ok(())
    }

    /// 延長後のリクエストを計算（保存はしない）
    pub async fn prepare_extension(
        &self,
        request_id: Uuid,
        reason: &str,
    ) -> Result<DataRightsRequest> {
        let mut request = self.get_request(request_id).await?;

        if request.extended_deadline.is_some() {
            warn!("Rights request {} already extended", request_id);
            return Err(Error::AlreadyExtended(request_id));
        }
        if request.status.is_terminal() {
            return Err(Error::invalid_transition(
                "rights request",
                request.status,
                RequestStatus::Extended,
            ));
        }

        self.apply_extension(&mut request, reason)?;
        if request.status == RequestStatus::InProgress {
            request.status = RequestStatus::Extended;
        }
        Ok(request)
    }

    /// 状態遷移後のリクエストを計算（保存はしない）
    pub async fn prepare_transition(
        &self,
        request_id: Uuid,
        next: RequestStatus,
    ) -> Result<DataRightsRequest> {
        let mut request = self.get_request(request_id).await?;

        if !request.status.can_transition_to(next) {
            warn!(
                "Rejected transition of rights request {}: {} -> {}",
                request_id, request.status, next
            );
            return Err(Error::invalid_transition(
                "rights request",
                request.status,
                next,
            ));
        }

        // only `extend` sets the extended deadline
        if next == RequestStatus::Extended && request.extended_deadline.is_none() {
            warn!(
                "Rejected transition of rights request {} to extended without an extension",
                request_id
            );
            return Err(Error::invalid_transition(
                "rights request",
                request.status,
                next,
            ));
        }
        if next.is_terminal() {
            request.resolved_at = Some(self.clock.now());
        }
        request.status = next;
        Ok(request)
    }

    /// Replaces a tracked request with its updated version and records history.
    pub(crate) async fn commit(&self, updated: DataRightsRequest, action: &str, details: String) {
        let request_id = updated.id;
        {
            let mut requests = self.requests.write().await;
            requests.insert(request_id, updated);
        }
        self.add_history(request_id, action, details).await;
    }

    /// 期限を延長（1回のみ）
    #[cfg(test)]
    pub(crate) async fn extend(&self, request_id: Uuid, reason: &str) -> Result<DataRightsRequest> {
        let updated = self.prepare_extension(request_id, reason).await?;
        info!(
            "Rights request {} extended to {:?}",
            request_id, updated.extended_deadline
        );
        self.commit(updated.clone(), "deadline_extended", reason.to_string())
            .await;
        Ok(updated)
    }

    /// ステータスを遷移
    #[cfg(test)]
    pub(crate) async fn transition(
        &self,
        request_id: Uuid,
        next: RequestStatus,
    ) -> Result<DataRightsRequest> {
        let previous = self.get_request(request_id).await?.status;
        let updated = self.prepare_transition(request_id, next).await?;
        info!("Rights request {} moved {} -> {}", request_id, previous, next);
        self.commit(
            updated.clone(),
            "status_updated",
            format!("From {} to {}", previous, next),
        )
        .await;
        Ok(updated)
    }

    /// Applies requests pulled from the remote authority. Unknown ids are
    /// inserted and known ids are replaced when the remote copy differs.
    pub(crate) async fn merge(&self, incoming: Vec<DataRightsRequest>) -> usize {
        let mut changed = Vec::new();
        {
            let mut requests = self.requests.write().await;
            for request in incoming {
                if requests.get(&request.id) == Some(&request) {
                    continue;
                }
                changed.push((request.id, request.status));
                requests.insert(request.id, request);
            }
        }

        for (request_id, status) in &changed {
            self.add_history(*request_id, "synced", format!("Remote status: {}", status))
                .await;
        }
        changed.len()
    }

    /// データ主体の全リクエストを取得
    pub async fn requests_for_user(&self, user_id: &str) -> Vec<DataRightsRequest> {
        let requests = self.requests.read().await;
        let mut list: Vec<_> = requests
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by_key(|r| r.submitted_at);
        list
    }

    /// 期限切れリクエストを取得
    pub async fn overdue(&self, now: DateTime<Utc>) -> Vec<DataRightsRequest> {
        let requests = self.requests.read().await;
        let mut list: Vec<_> = requests
            .values()
            .filter(|r| r.is_overdue(now))
            .cloned()
            .collect();
        list.sort_by_key(|r| r.effective_deadline());
        list
    }

    /// 利用者の期限切れリクエスト
    pub async fn overdue_for_user(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Vec<DataRightsRequest> {
        self.overdue(now)
            .await
            .into_iter()
            .filter(|r| r.user_id == user_id)
            .collect()
    }

    /// リクエスト統計を取得
    pub async fn statistics(&self, now: DateTime<Utc>) -> RequestStatistics {
        let requests = self.requests.read().await;
        let mut stats = RequestStatistics {
            total_requests: requests.len(),
            ..RequestStatistics::default()
        };

        for request in requests.values() {
            *stats.requests_by_status.entry(request.status).or_insert(0) += 1;
            *stats
                .requests_by_type
                .entry(request.request_type)
                .or_insert(0) += 1;
            if request.is_overdue(now) {
                stats.overdue_requests += 1;
            }
        }

        stats
    }

    /// 履歴に追加
    async fn add_history(&self, request_id: Uuid, action: &str, details: String) {
        let entry = RequestHistory {
            request_id,
            action: action.to_string(),
            timestamp: self.clock.now(),
            details,
        };

        let mut history = self.history.write().await;
        history.push(entry);
    }

    /// リクエスト履歴を取得
    pub async fn request_history(&self, request_id: Uuid) -> Vec<RequestHistory> {
        let history = self.history.read().await;
        history
            .iter()
            .filter(|h| h.request_id == request_id)
            .cloned()
            .collect()
    }
}

/// リクエスト統計
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RequestStatistics {
    /// 総リクエスト数
    pub total_requests: usize,
    /// ステータス別リクエスト数
    pub requests_by_status: BTreeMap<RequestStatus, usize>,
    /// タイプ別リクエスト数
    pub requests_by_type: BTreeMap<RequestType, usize>,
    /// 期限切れリクエスト数
    pub overdue_requests: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::clock::ManualClock;
    use crate::compliance::region_policy::fixtures::eu_us_policy;
    use chrono::TimeZone;

    fn tracker() -> (RightsRequestTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 10, 8, 0, 0).unwrap(),
        ));
        (RightsRequestTracker::new(eu_us_policy(), clock.clone()), clock)
    }

    async fn in_progress(tracker: &RightsRequestTracker, region: RegionCode) -> DataRightsRequest {
        let request = tracker
            .submit("u", region, RequestType::Erasure, "delete my account", RequestPriority::Normal)
            .await
            .unwrap();
        tracker
            .transition(request.id, RequestStatus::IdentityVerificationPending)
            .await
            .unwrap();
        tracker
            .transition(request.id, RequestStatus::InProgress)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_us_erasure_deadline_and_overdue() {
        let (tracker, clock) = tracker();
        let t = clock.now();
        let request = tracker
            .submit("u", RegionCode::Us, RequestType::Erasure, "erase", RequestPriority::High)
            .await
            .unwrap();
        assert_eq!(request.status, RequestStatus::Submitted);
        assert_eq!(request.deadline, t + Duration::days(45));

        assert!(tracker.overdue(t + Duration::days(45)).await.is_empty());
        let overdue = tracker.overdue(t + Duration::days(46)).await;
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].id, request.id);
    }

    #[tokio::test]
    async fn test_extend_only_once() {
        let (tracker, _) = tracker();
        let request = in_progress(&tracker, RegionCode::Eu).await;
        let original_deadline = request.deadline;

        let extended = tracker.extend(request.id, "complex request").await.unwrap();
        assert_eq!(extended.status, RequestStatus::Extended);
        assert_eq!(extended.deadline, original_deadline);
        assert_eq!(
            extended.extended_deadline,
            Some(original_deadline + Duration::days(60))
        );

        let err = tracker.extend(request.id, "again").await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExtended(id) if id == request.id));

        let stored = tracker.get_request(request.id).await.unwrap();
        assert_eq!(stored.extended_deadline, extended.extended_deadline);
        assert_eq!(stored.extension_reason.as_deref(), Some("complex request"));
    }

    #[tokio::test]
    async fn test_extend_before_processing_keeps_status() {
        let (tracker, _) = tracker();
        let request = tracker
            .submit("u", RegionCode::Us, RequestType::Access, "", RequestPriority::Low)
            .await
            .unwrap();
        let extended = tracker.extend(request.id, "identity checks").await.unwrap();
        assert_eq!(extended.status, RequestStatus::Submitted);
        assert!(extended.extended_deadline.is_some());

        // an already extended request may later be marked extended
        tracker
            .transition(request.id, RequestStatus::IdentityVerificationPending)
            .await
            .unwrap();
        tracker
            .transition(request.id, RequestStatus::InProgress)
            .await
            .unwrap();
        let marked = tracker
            .transition(request.id, RequestStatus::Extended)
            .await
            .unwrap();
        assert_eq!(marked.extended_deadline, extended.extended_deadline);
    }

    #[tokio::test]
    async fn test_transition_to_extended_needs_prior_extension() {
        let (tracker, _) = tracker();
        let request = in_progress(&tracker, RegionCode::Us).await;
        let err = tracker
            .transition(request.id, RequestStatus::Extended)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        let stored = tracker.get_request(request.id).await.unwrap();
        assert_eq!(stored.status, RequestStatus::InProgress);
        assert_eq!(stored.extended_deadline, None);

        // the one real extension is still available
        let extended = tracker.extend(request.id, "backlog").await.unwrap();
        assert_eq!(
            extended.extended_deadline,
            Some(request.deadline + Duration::days(45))
        );
        let done = tracker
            .transition(request.id, RequestStatus::Fulfilled)
            .await
            .unwrap();
        assert!(done.resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let (tracker, _) = tracker();
        let request = tracker
            .submit("u", RegionCode::Eu, RequestType::Portability, "", RequestPriority::Normal)
            .await
            .unwrap();

        let err = tracker
            .transition(request.id, RequestStatus::Fulfilled)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        tracker
            .transition(request.id, RequestStatus::Withdrawn)
            .await
            .unwrap();
        let err = tracker
            .transition(request.id, RequestStatus::IdentityVerificationPending)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert!(matches!(
            tracker.extend(request.id, "late").await,
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_terminal_requests_are_never_overdue() {
        let (tracker, clock) = tracker();
        let request = in_progress(&tracker, RegionCode::Eu).await;
        tracker
            .transition(request.id, RequestStatus::Rejected)
            .await
            .unwrap();
        assert!(tracker
            .overdue(clock.now() + Duration::days(365))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_unknown_region_submission() {
        let (tracker, _) = tracker();
        let err = tracker
            .submit("u", RegionCode::Br, RequestType::Access, "", RequestPriority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownRegion(RegionCode::Br)));
    }

    #[tokio::test]
    async fn test_history_and_statistics() {
        let (tracker, clock) = tracker();
        let request = in_progress(&tracker, RegionCode::Eu).await;
        tracker.extend(request.id, "backlog").await.unwrap();

        let history = tracker.request_history(request.id).await;
        let actions: Vec<_> = history.iter().map(|h| h.action.as_str()).collect();
        assert_eq!(
            actions,
            vec!["submitted", "status_updated", "status_updated", "deadline_extended"]
        );

        let stats = tracker.statistics(clock.now()).await;
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.requests_by_status[&RequestStatus::Extended], 1);
        assert_eq!(stats.requests_by_type[&RequestType::Erasure], 1);
        assert_eq!(stats.overdue_requests, 0);
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let (tracker, _) = tracker();
        let id = Uuid::new_v4();
        let request = tracker
            .prepare_submission("u", RegionCode::Us, RequestType::Access, "", RequestPriority::Normal, Some(id))
            .unwrap();
        assert!(tracker.insert(request.clone()).await);
        assert!(!tracker.insert(request).await);
        assert_eq!(tracker.requests_for_user("u").await.len(), 1);
    }
}
