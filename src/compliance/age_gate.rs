//! Age Gate
//!
//! 未成年者の判定と保護者同意ワークフロー
//!
//! While a user's latest age verification says parental consent is required
//! and no parental consent request has been verified, only `essential`
//! processing may be consented to. [`AgeGate::check_processing_allowed`] is the
//! single place that rule is enforced; the consent ledger calls it before
//! every grant.

use chrono::{Datelike, Duration, NaiveDate};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;
use validator::ValidateEmail;

use super::clock::Clock;
use super::region_policy::RegionPolicyResolver;
use super::types::*;
use crate::error::{Error, Result};

/// 保護者同意の既定の回答期限（日数）
pub const DEFAULT_PARENTAL_RESPONSE_DAYS: i64 = 14;

/// 指定日時点の満年齢を計算
pub fn age_on(birth_date: NaiveDate, today: NaiveDate) -> Result<u32> {
    if birth_date > today {
        return Err(Error::FutureBirthDate(birth_date));
    }
    let mut age = today.year() - birth_date.year();
    if (today.month(), today.day()) < (birth_date.month(), birth_date.day()) {
        age -= 1;
    }
    Ok(u32::try_from(age).unwrap_or(0))
}

#[derive(Debug, Default)]
struct AgeGateState {
    /// 利用者ごとの最新の年齢確認結果
    verifications: HashMap<String, AgeVerificationResult>,
    /// 保護者同意リクエスト
    parental_requests: HashMap<Uuid, ParentalConsentRequest>,
}

impl AgeGateState {
    fn has_verified_parental_consent(&self, user_id: &str) -> bool {
        self.parental_requests
            .values()
            .any(|r| r.user_id == user_id && r.status == ParentalConsentStatus::Verified)
    }

    fn requires_parental_consent(&self, user_id: &str) -> bool {
        self.verifications
            .get(user_id)
            .is_some_and(|v| v.requires_parental_consent)
            && !self.has_verified_parental_consent(user_id)
    }
}

/// 保護者同意リクエストの遷移結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentalTransition {
    /// The move is allowed; carries the updated request.
    Apply(ParentalConsentRequest),
    /// The request outlived the response window; carries its rejected copy.
    Expire(ParentalConsentRequest),
}

/// 年齢ゲート
#[derive(Debug)]
pub struct AgeGate {
    policy: Arc<RegionPolicyResolver>,
    clock: Arc<dyn Clock>,
    response_window: Duration,
    state: Arc<RwLock<AgeGateState>>,
}

impl AgeGate {
    pub fn new(policy: Arc<RegionPolicyResolver>, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            response_window: Duration::days(DEFAULT_PARENTAL_RESPONSE_DAYS),
            state: Arc::new(RwLock::new(AgeGateState::default())),
        }
    }

    /// Pending/sent requests older than `window` are rejected.
    pub fn with_response_window(mut self, window: Duration) -> Self {
        self.response_window = window;
        self
    }

    /// 年齢確認結果を計算（状態は変更しない）
    pub fn assess_age(
        &self,
        user_id: &str,
        region: RegionCode,
        birth_date: NaiveDate,
        method: AgeVerificationMethod,
    ) -> Result<AgeVerificationResult> {
        let requirement = self.policy.requirements_for(region)?;
        let now = self.clock.now();
        let age = age_on(birth_date, now.date_naive())?;

        Ok(AgeVerificationResult {
            user_id: user_id.to_string(),
            region,
            birth_date,
            age,
            method,
            verified: method.is_verifying(),
            requires_parental_consent: requirement.parental_consent_required
                && age < requirement.minimum_age,
            verified_at: now,
        })
    }

    /// 年齢確認結果を保存
    pub(crate) async fn store_verification(&self, result: AgeVerificationResult) {
        if result.requires_parental_consent {
            info!(
                "User {} (age {}) requires parental consent in {}",
                result.user_id, result.age, result.region
            );
        }
        let mut state = self.state.write().await;
        state.verifications.insert(result.user_id.clone(), result);
    }

    /// 年齢を確認
    pub(crate) async fn verify_age(
        &self,
        user_id: &str,
        region: RegionCode,
        birth_date: NaiveDate,
        method: AgeVerificationMethod,
    ) -> Result<AgeVerificationResult> {
        let result = self.assess_age(user_id, region, birth_date, method)?;
        self.store_verification(result.clone()).await;
        Ok(result)
    }

    /// 最新の年齢確認結果
    pub async fn verification(&self, user_id: &str) -> Option<AgeVerificationResult> {
        self.state.read().await.verifications.get(user_id).cloned()
    }

    /// 保護者同意リクエストを作成（状態は変更しない）
    pub async fn prepare_parental_request(
        &self,
        user_id: &str,
        parent_email: &str,
    ) -> Result<ParentalConsentRequest> {
        let email = parent_email.trim().to_string();
        if !email.validate_email() {
            return Err(Error::InvalidInput(format!(
                "invalid parent email: {}",
                parent_email
            )));
        }

        if self.state.read().await.has_verified_parental_consent(user_id) {
            return Err(Error::ParentalConsentAlreadyVerified(user_id.to_string()));
        }

        let now = self.clock.now();
        Ok(ParentalConsentRequest {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            parent_email: email,
            status: ParentalConsentStatus::Pending,
            requested_at: now,
            updated_at: now,
        })
    }

    /// 保護者同意リクエストを保存（新規・更新の両方）
    pub(crate) async fn store_parental_request(&self, request: ParentalConsentRequest) {
        let mut state = self.state.write().await;
        state.parental_requests.insert(request.id, request);
    }

    /// 保護者同意を依頼
    pub(crate) async fn request_parental_consent(
        &self,
        user_id: &str,
        parent_email: &str,
    ) -> Result<ParentalConsentRequest> {
        let request = self.prepare_parental_request(user_id, parent_email).await?;
        info!("Parental consent requested for user {}", user_id);
        self.store_parental_request(request.clone()).await;
        Ok(request)
    }

    /// 保護者同意リクエストを取得
    pub async fn parental_request(&self, request_id: Uuid) -> Result<ParentalConsentRequest> {
        self.state
            .read()
            .await
            .parental_requests
            .get(&request_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Parental consent request not found: {}", request_id)))
    }

    /// Returns the rejected copy of `request` if it outlived the response
    /// window while still open. Nothing is stored.
    pub fn expire_if_stale(
        &self,
        request: &ParentalConsentRequest,
    ) -> Option<ParentalConsentRequest> {
        let now = self.clock.now();
        if request.status.is_terminal() || now - request.requested_at <= self.response_window {
            return None;
        }
        let mut expired = request.clone();
        expired.status = ParentalConsentStatus::Rejected;
        expired.updated_at = now;
        Some(expired)
    }

    /// Computes the outcome of moving a request to `next` without storing it.
    pub async fn prepare_transition(
        &self,
        request_id: Uuid,
        next: ParentalConsentStatus,
    ) -> Result<ParentalTransition> {
        let request = self.parental_request(request_id).await?;

        if !request.status.can_transition_to(next) {
            return Err(Error::invalid_transition(
                "parental consent",
                request.status,
                next,
            ));
        }

        if next != ParentalConsentStatus::Rejected {
            if let Some(expired) = self.expire_if_stale(&request) {
                warn!(
                    "Parental consent request {} expired after {} days",
                    request_id,
                    self.response_window.num_days()
                );
                return Ok(ParentalTransition::Expire(expired));
            }
        }

        let mut updated = request;
        updated.status = next;
        updated.updated_at = self.clock.now();
        Ok(ParentalTransition::Apply(updated))
    }

    /// 回答期限を過ぎたリクエスト（拒否後の内容、保存はしない）
    pub async fn stale_requests(&self) -> Vec<ParentalConsentRequest> {
        let state = self.state.read().await;
        let mut stale: Vec<_> = state
            .parental_requests
            .values()
            .filter_map(|request| self.expire_if_stale(request))
            .collect();
        stale.sort_by_key(|r| r.requested_at);
        stale
    }

    #[cfg(test)]
    async fn transition(
        &self,
        request_id: Uuid,
        next: ParentalConsentStatus,
    ) -> Result<ParentalConsentRequest> {
        match self.prepare_transition(request_id, next).await? {
            ParentalTransition::Apply(updated) => {
                self.store_parental_request(updated.clone()).await;
                Ok(updated)
            }
            ParentalTransition::Expire(expired) => {
                self.store_parental_request(expired).await;
                Err(Error::ParentalConsentExpired(request_id))
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn mark_sent(&self, request_id: Uuid) -> Result<ParentalConsentRequest> {
        self.transition(request_id, ParentalConsentStatus::Sent).await
    }

    #[cfg(test)]
    pub(crate) async fn confirm_parental_consent(
        &self,
        request_id: Uuid,
    ) -> Result<ParentalConsentRequest> {
        self.transition(request_id, ParentalConsentStatus::Verified)
            .await
    }

    #[cfg(test)]
    pub(crate) async fn reject_parental_consent(
        &self,
        request_id: Uuid,
    ) -> Result<ParentalConsentRequest> {
        self.transition(request_id, ParentalConsentStatus::Rejected)
            .await
    }

    /// 利用者の保護者同意リクエスト一覧
    pub async fn requests_for_user(&self, user_id: &str) -> Vec<ParentalConsentRequest> {
        let state = self.state.read().await;
        let mut requests: Vec<_> = state
            .parental_requests
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.requested_at);
        requests
    }

    pub async fn has_verified_parental_consent(&self, user_id: &str) -> bool {
        self.state
            .read()
            .await
            .has_verified_parental_consent(user_id)
    }

    /// 保護者同意が必要かつ未取得か
    pub async fn requires_parental_consent(&self, user_id: &str) -> bool {
        self.state.read().await.requires_parental_consent(user_id)
    }

    /// 目的に対する処理が許可されているか確認
    pub async fn check_processing_allowed(
        &self,
        user_id: &str,
        purpose: DataProcessingPurpose,
    ) -> Result<()> {
        if purpose == DataProcessingPurpose::Essential {
            return Ok(());
        }
        if self.requires_parental_consent(user_id).await {
            warn!(
                "Blocked {} consent for user {} pending parental consent",
                purpose, user_id
            );
            return Err(Error::ParentalConsentRequired {
                user_id: user_id.to_string(),
                purpose,
            });
        }
        Ok(())
    }
}
