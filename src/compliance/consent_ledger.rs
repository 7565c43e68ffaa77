//! Consent Ledger
//!
//! 追記専用の同意台帳
//!
//! Each (user, purpose) pair owns an ordered sequence of [`ConsentRecord`]s.
//! Records are never mutated or removed: a withdrawal appends a record with
//! `granted = false`. The current state of a purpose is the record with the
//! latest timestamp (the later-appended one on ties).

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::age_gate::AgeGate;
use super::clock::Clock;
use super::region_policy::RegionPolicyResolver;
use super::types::*;
use crate::error::{Error, Result};

type PurposeLog = BTreeMap<DataProcessingPurpose, Vec<ConsentRecord>>;

fn latest_of(records: &[ConsentRecord]) -> Option<&ConsentRecord> {
    // max_by_key keeps the last element among equal timestamps
    records.iter().max_by_key(|r| r.timestamp)
}

/// 同意台帳
#[derive(Debug)]
pub struct ConsentLedger {
    policy: Arc<RegionPolicyResolver>,
    age_gate: Arc<AgeGate>,
    clock: Arc<dyn Clock>,
    /// 同意記録ストレージ（user_id -> 目的 -> 記録列）
    records: Arc<RwLock<HashMap<String, PurposeLog>>>,
}

impl ConsentLedger {
    pub fn new(
        policy: Arc<RegionPolicyResolver>,
        age_gate: Arc<AgeGate>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy,
            age_gate,
            clock,
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 同意記録を検証して作成（台帳には追記しない）
    pub async fn prepare_grant(
        &self,
        user_id: &str,
        grant: &ConsentGrant,
        record_id: Option<Uuid>,
    ) -> Result<ConsentRecord> {
        self.policy
            .ensure_legal_basis(grant.region, grant.purpose, grant.legal_basis)?;
        self.age_gate
            .check_processing_allowed(user_id, grant.purpose)
            .await?;

        Ok(ConsentRecord {
            id: record_id.unwrap_or_else(Uuid::new_v4),
            user_id: user_id.to_string(),
            purpose: grant.purpose,
            legal_basis: grant.legal_basis,
            region: grant.region,
            granted: true,
            consent_method: grant.method,
            consent_version: grant.version,
            timestamp: self.clock.now(),
            withdrawn_at: None,
        })
    }

    /// 撤回記録を作成（台帳には追記しない）
    pub async fn prepare_withdrawal(
        &self,
        user_id: &str,
        purpose: DataProcessingPurpose,
        record_id: Option<Uuid>,
    ) -> Result<ConsentRecord> {
        let active = self
            .latest(user_id, purpose)
            .await
            .filter(|r| r.granted)
            .ok_or_else(|| Error::NoActiveConsent {
                user_id: user_id.to_string(),
                purpose,
            })?;

        let now = self.clock.now();
        Ok(ConsentRecord {
            id: record_id.unwrap_or_else(Uuid::new_v4),
            granted: false,
            timestamp: now,
            withdrawn_at: Some(now),
            ..active
        })
    }

    /// 記録を追記する。同じIDが既にあれば追記せず `false` を返す
    pub(crate) async fn append(&self, record: ConsentRecord) -> bool {
        let mut records = self.records.write().await;
        let log = records
            .entry(record.user_id.clone())
            .or_default()
            .entry(record.purpose)
            .or_default();

        if log.iter().any(|r| r.id == record.id) {
            debug!("Consent record {} already in ledger", record.id);
            return false;
        }

        info!(
            "Consent {} for user {} purpose {} (version {}, {})",
            if record.granted { "granted" } else { "withdrawn" },
            record.user_id,
            record.purpose,
            record.consent_version,
            record.region
        );
        log.push(record);
        true
    }

    /// Inserts records pulled from the remote authority, skipping known ids.
    /// Returns the number of records added.
    pub(crate) async fn merge(&self, incoming: Vec<ConsentRecord>) -> usize {
        let mut records = self.records.write().await;
        let mut added = 0;

        for record in incoming {
            let log = records
                .entry(record.user_id.clone())
                .or_default()
                .entry(record.purpose)
                .or_default();
            if log.iter().any(|r| r.id == record.id) {
                continue;
            }
            let position = log.partition_point(|r| r.timestamp <= record.timestamp);
            log.insert(position, record);
            added += 1;
        }

        if added > 0 {
            debug!("Merged {} remote consent records", added);
        }
        added
    }

    /// 同意を記録（リモートを経由しない）
    #[cfg(test)]
    pub(crate) async fn record_consent(
        &self,
        user_id: &str,
        grant: &ConsentGrant,
    ) -> Result<ConsentRecord> {
        let record = self.prepare_grant(user_id, grant, None).await?;
        self.append(record.clone()).await;
        Ok(record)
    }

    /// 同意を撤回（リモートを経由しない）
    #[cfg(test)]
    pub(crate) async fn withdraw_consent(
        &self,
        user_id: &str,
        purpose: DataProcessingPurpose,
    ) -> Result<ConsentRecord> {
        let record = self.prepare_withdrawal(user_id, purpose, None).await?;
        self.append(record.clone()).await;
        Ok(record)
    }

    /// 一括更新
    ///
    /// Items are applied one by one; a failing item is reported in
    /// `failed` and does not stop the remaining items.
    #[cfg(test)]
    pub(crate) async fn batch_update_consent(
        &self,
        user_id: &str,
        updates: &[ConsentUpdate],
    ) -> BatchUpdateResult {
        let mut result = BatchUpdateResult::default();

        for update in updates {
            let outcome = match update {
                ConsentUpdate::Grant(grant) => self.record_consent(user_id, grant).await,
                ConsentUpdate::Withdraw(purpose) => self.withdraw_consent(user_id, *purpose).await,
            };
            match outcome {
                Ok(_) => result.updated += 1,
                Err(e) => {
                    warn!(
                        "Batch consent update for user {} purpose {} failed: {}",
                        user_id,
                        update.purpose(),
                        e
                    );
                    result.failed.push(BatchFailure {
                        purpose: update.purpose(),
                        code: e.code().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        result
    }

    /// 目的ごとの最新記録
    pub async fn latest(
        &self,
        user_id: &str,
        purpose: DataProcessingPurpose,
    ) -> Option<ConsentRecord> {
        let records = self.records.read().await;
        records
            .get(user_id)
            .and_then(|log| log.get(&purpose))
            .and_then(|history| latest_of(history))
            .cloned()
    }

    /// 現在の同意状態（目的ごとの最新記録から再構築）
    pub async fn current_state(&self, user_id: &str) -> PrivacyPreferences {
        let records = self.records.read().await;
        let mut preferences = PrivacyPreferences::empty(user_id);

        if let Some(log) = records.get(user_id) {
            for (purpose, history) in log {
                if let Some(record) = latest_of(history) {
                    preferences.purposes.insert(
                        *purpose,
                        PurposeConsent {
                            granted: record.granted,
                            legal_basis: record.legal_basis,
                            region: record.region,
                            consent_version: record.consent_version,
                            record_id: record.id,
                            updated_at: record.timestamp,
                        },
                    );
                    preferences.updated_at = preferences.updated_at.max(Some(record.timestamp));
                }
            }
        }

        preferences
    }

    /// 同意履歴を取得
    pub async fn history(
        &self,
        user_id: &str,
        purpose: DataProcessingPurpose,
    ) -> Vec<ConsentRecord> {
        let records = self.records.read().await;
        records
            .get(user_id)
            .and_then(|log| log.get(&purpose))
            .cloned()
            .unwrap_or_default()
    }

    /// 利用者の全記録（時刻順）
    pub async fn records_for_user(&self, user_id: &str) -> Vec<ConsentRecord> {
        let records = self.records.read().await;
        let mut all: Vec<ConsentRecord> = records
            .get(user_id)
            .map(|log| log.values().flatten().cloned().collect())
            .unwrap_or_default();
        all.sort_by_key(|r| r.timestamp);
        all
    }

    /// IDで記録を検索
    pub async fn find_record(&self, user_id: &str, record_id: Uuid) -> Option<ConsentRecord> {
        let records = self.records.read().await;
        records
            .get(user_id)?
            .values()
            .flatten()
            .find(|r| r.id == record_id)
            .cloned()
    }

    /// 同意の更新要否を判定
    pub async fn needs_renewal(&self, user_id: &str) -> RenewalStatus {
        let now = self.clock.now();
        let preferences = self.current_state(user_id).await;
        let mut expired_purposes = Vec::new();
        let mut deadline: Option<DateTime<Utc>> = None;

        for (purpose, state) in preferences.purposes.iter().filter(|(_, s)| s.granted) {
            let required = self.policy.required_version(state.region, *purpose);
            let validity = self.policy.consent_validity(state.region);
            let (required, validity) = match (required, validity) {
                (Ok(required), Ok(validity)) => (required, validity),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(
                        "Cannot check renewal of {} for user {}: {}",
                        purpose, user_id, e
                    );
                    expired_purposes.push(*purpose);
                    continue;
                }
            };

            let expires_at = state.updated_at + validity;
            deadline = Some(deadline.map_or(expires_at, |d| d.min(expires_at)));

            if state.consent_version < required || now - state.updated_at > validity {
                expired_purposes.push(*purpose);
            }
        }

        RenewalStatus {
            needs_renewal: !expired_purposes.is_empty(),
            expired_purposes,
            deadline,
        }
    }

    /// 同意統計を取得
    pub async fn statistics(&self) -> ConsentStatistics {
        let records = self.records.read().await;
        let mut stats = ConsentStatistics {
            total_subjects: records.len(),
            ..ConsentStatistics::default()
        };

        for log in records.values() {
            for (purpose, history) in log {
                stats.total_records += history.len();
                match latest_of(history) {
                    Some(r) if r.granted => {
                        stats.active_consents += 1;
                        *stats.active_by_purpose.entry(*purpose).or_insert(0) += 1;
                    }
                    Some(_) => stats.withdrawn_consents += 1,
                    None => {}
                }
            }
        }

        stats
    }
}

/// 同意統計
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConsentStatistics {
    /// 総データ主体数
    pub total_subjects: usize,
    /// 総記録数（撤回記録を含む）
    pub total_records: usize,
    /// 現在有効な同意数
    pub active_consents: usize,
    /// 撤回状態の目的数
    pub withdrawn_consents: usize,
    /// 目的別の有効な同意数
    pub active_by_purpose: BTreeMap<DataProcessingPurpose, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::clock::ManualClock;
    use crate::compliance::region_policy::fixtures::eu_us_policy;
    use chrono::{Duration, NaiveDate, TimeZone};

    struct Fixture {
        ledger: ConsentLedger,
        gate: Arc<AgeGate>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let policy = eu_us_policy();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        ));
        let gate = Arc::new(AgeGate::new(policy.clone(), clock.clone()));
        Fixture {
            ledger: ConsentLedger::new(policy, gate.clone(), clock.clone()),
            gate,
            clock,
        }
    }

    fn grant(purpose: DataProcessingPurpose, version: u32) -> ConsentGrant {
        ConsentGrant {
            purpose,
            legal_basis: LegalBasis::Consent,
            region: RegionCode::Us,
            method: ConsentMethod::Settings,
            version,
        }
    }

    #[tokio::test]
    async fn test_grant_withdraw_grant_round_trip() {
        let f = fixture();
        let user = "user@example.com";
        let marketing = DataProcessingPurpose::Marketing;

        f.ledger.record_consent(user, &grant(marketing, 1)).await.unwrap();
        f.ledger.withdraw_consent(user, marketing).await.unwrap();
        let third = f.ledger.record_consent(user, &grant(marketing, 2)).await.unwrap();

        let history = f.ledger.history(user, marketing).await;
        assert_eq!(history.len(), 3);
        assert!(history[0].granted);
        assert!(!history[1].granted);
        assert!(history[1].withdrawn_at.is_some());

        let state = f.ledger.current_state(user).await;
        let current = &state.purposes[&marketing];
        assert!(current.granted);
        assert_eq!(current.record_id, third.id);
        assert_eq!(current.consent_version, 2);
    }

    #[tokio::test]
    async fn test_withdraw_requires_active_grant() {
        let f = fixture();
        let err = f
            .ledger
            .withdraw_consent("u", DataProcessingPurpose::Analytics)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoActiveConsent { .. }));

        f.ledger
            .record_consent("u", &grant(DataProcessingPurpose::Analytics, 1))
            .await
            .unwrap();
        f.ledger
            .withdraw_consent("u", DataProcessingPurpose::Analytics)
            .await
            .unwrap();
        let err = f
            .ledger
            .withdraw_consent("u", DataProcessingPurpose::Analytics)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoActiveConsent { .. }));
        assert_eq!(
            f.ledger
                .history("u", DataProcessingPurpose::Analytics)
                .await
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_invalid_legal_basis() {
        let f = fixture();
        let mut eu_marketing = grant(DataProcessingPurpose::Marketing, 2);
        eu_marketing.region = RegionCode::Eu;
        eu_marketing.legal_basis = LegalBasis::LegitimateInterest;

        let err = f.ledger.record_consent("u", &eu_marketing).await.unwrap_err();
        assert!(matches!(err, Error::InvalidLegalBasis { .. }));
        assert!(f.ledger.history("u", DataProcessingPurpose::Marketing).await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_region_rejected() {
        let f = fixture();
        let mut cn = grant(DataProcessingPurpose::Analytics, 1);
        cn.region = RegionCode::Cn;
        let err = f.ledger.record_consent("u", &cn).await.unwrap_err();
        assert!(matches!(err, Error::UnknownRegion(RegionCode::Cn)));
    }

    #[tokio::test]
    async fn test_minor_gating() {
        let f = fixture();
        f.gate
            .verify_age(
                "kid",
                RegionCode::Eu,
                NaiveDate::from_ymd_opt(2010, 1, 1).unwrap(),
                AgeVerificationMethod::Document,
            )
            .await
            .unwrap();

        assert!(f
            .ledger
            .record_consent("kid", &grant(DataProcessingPurpose::Essential, 1))
            .await
            .is_ok());
        let err = f
            .ledger
            .record_consent("kid", &grant(DataProcessingPurpose::Marketing, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ParentalConsentRequired { .. }));
    }

    #[tokio::test]
    async fn test_batch_update_is_not_transactional() {
        let f = fixture();
        let mut bad = grant(DataProcessingPurpose::Personalization, 1);
        bad.legal_basis = LegalBasis::Contract;

        let result = f
            .ledger
            .batch_update_consent(
                "u",
                &[
                    ConsentUpdate::Grant(grant(DataProcessingPurpose::Analytics, 1)),
                    ConsentUpdate::Grant(bad),
                    ConsentUpdate::Withdraw(DataProcessingPurpose::ThirdPartySharing),
                    ConsentUpdate::Grant(grant(DataProcessingPurpose::Marketing, 1)),
                ],
            )
            .await;

        assert_eq!(result.updated, 2);
        assert_eq!(result.failed.len(), 2);
        assert_eq!(result.failed[0].purpose, DataProcessingPurpose::Personalization);
        assert_eq!(result.failed[0].code, "invalid_legal_basis");
        assert_eq!(result.failed[1].code, "no_active_consent");

        let state = f.ledger.current_state("u").await;
        assert!(state.is_granted(DataProcessingPurpose::Analytics));
        assert!(state.is_granted(DataProcessingPurpose::Marketing));
    }

    #[tokio::test]
    async fn test_needs_renewal_by_version_and_age() {
        let f = fixture();
        let mut eu_marketing = grant(DataProcessingPurpose::Marketing, 1);
        eu_marketing.region = RegionCode::Eu;
        f.ledger.record_consent("u", &eu_marketing).await.unwrap();
        f.ledger
            .record_consent("u", &grant(DataProcessingPurpose::Analytics, 1))
            .await
            .unwrap();

        let status = f.ledger.needs_renewal("u").await;
        assert!(status.needs_renewal);
        assert_eq!(status.expired_purposes, vec![DataProcessingPurpose::Marketing]);
        assert_eq!(status.deadline, Some(f.clock.now() + Duration::days(365)));

        // US validity is 730 days
        f.clock.advance(Duration::days(731));
        let status = f.ledger.needs_renewal("u").await;
        assert_eq!(
            status.expired_purposes,
            vec![
                DataProcessingPurpose::Analytics,
                DataProcessingPurpose::Marketing
            ]
        );
    }

    #[tokio::test]
    async fn test_withdrawn_purposes_never_need_renewal() {
        let f = fixture();
        f.ledger
            .record_consent("u", &grant(DataProcessingPurpose::Analytics, 1))
            .await
            .unwrap();
        f.ledger
            .withdraw_consent("u", DataProcessingPurpose::Analytics)
            .await
            .unwrap();
        f.clock.advance(Duration::days(1000));

        let status = f.ledger.needs_renewal("u").await;
        assert!(!status.needs_renewal);
        assert!(status.deadline.is_none());
    }

    #[tokio::test]
    async fn test_append_is_idempotent_and_merge_orders_by_time() {
        let f = fixture();
        let record = f
            .ledger
            .prepare_grant("u", &grant(DataProcessingPurpose::Analytics, 1), None)
            .await
            .unwrap();
        assert!(f.ledger.append(record.clone()).await);
        assert!(!f.ledger.append(record.clone()).await);

        let mut older = record.clone();
        older.id = Uuid::new_v4();
        older.granted = false;
        older.timestamp = record.timestamp - Duration::days(1);

        assert_eq!(f.ledger.merge(vec![older.clone(), record.clone()]).await, 1);
        let history = f.ledger.history("u", DataProcessingPurpose::Analytics).await;
        assert_eq!(history[0].id, older.id);
        assert!(f
            .ledger
            .current_state("u")
            .await
            .is_granted(DataProcessingPurpose::Analytics));
    }

    #[tokio::test]
    async fn test_statistics() {
        let f = fixture();
        f.ledger
            .record_consent("a", &grant(DataProcessingPurpose::Analytics, 1))
            .await
            .unwrap();
        f.ledger
            .record_consent("b", &grant(DataProcessingPurpose::Analytics, 1))
            .await
            .unwrap();
        f.ledger
            .withdraw_consent("b", DataProcessingPurpose::Analytics)
            .await
            .unwrap();

        let stats = f.ledger.statistics().await;
        assert_eq!(stats.total_subjects, 2);
        assert_eq!(stats.total_records, 3);
        assert_eq!(stats.active_consents, 1);
        assert_eq!(stats.withdrawn_consents, 1);
        assert_eq!(stats.active_by_purpose[&DataProcessingPurpose::Analytics], 1);
    }
}
