//! Compliance Evaluator
//!
//! 同意台帳・権利行使リクエスト・年齢ゲートを集約したスコアリング（読み取り専用）

use std::sync::Arc;
use tracing::debug;

use super::age_gate::AgeGate;
use super::clock::Clock;
use super::consent_ledger::ConsentLedger;
use super::rights_requests::RightsRequestTracker;
use super::types::*;

/// 既定の合格スコア
pub const DEFAULT_COMPLIANCE_THRESHOLD: u8 = 80;

const RENEWAL_PENALTY: i32 = 5;
const OVERDUE_PENALTY: i32 = 15;
const MINOR_PENALTY: i32 = 25;

/// コンプライアンス評価器
#[derive(Debug)]
pub struct ComplianceEvaluator {
    ledger: Arc<ConsentLedger>,
    rights: Arc<RightsRequestTracker>,
    age_gate: Arc<AgeGate>,
    clock: Arc<dyn Clock>,
    threshold: u8,
}

impl ComplianceEvaluator {
    pub fn new(
        ledger: Arc<ConsentLedger>,
        rights: Arc<RightsRequestTracker>,
        age_gate: Arc<AgeGate>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            rights,
            age_gate,
            clock,
            threshold: DEFAULT_COMPLIANCE_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: u8) -> Self {
        self.threshold = threshold.min(100);
        self
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    /// 同意更新レポート
    pub async fn renewal_report(&self, user_id: &str) -> RenewalStatus {
        self.ledger.needs_renewal(user_id).await
    }

    /// 利用者のコンプライアンス状態を評価
    ///
    /// Score starts at 100: -5 per purpose needing renewal, -15 per overdue
    /// rights request, -25 when a minor without verified parental consent
    /// holds any non-essential grant. Clamped to `[0, 100]`.
    pub async fn evaluate(&self, user_id: &str) -> ComplianceReport {
        let now = self.clock.now();
        let mut issues = Vec::new();

        let renewal = self.ledger.needs_renewal(user_id).await;
        issues.extend(
            renewal
                .expired_purposes
                .iter()
                .map(|purpose| ComplianceIssue::ConsentRenewalRequired { purpose: *purpose }),
        );

        issues.extend(
            self.rights
                .overdue_for_user(user_id, now)
                .await
                .into_iter()
                .map(|r| ComplianceIssue::OverdueRightsRequest {
                    request_id: r.id,
                    request_type: r.request_type,
                    deadline: r.effective_deadline(),
                }),
        );

        if self.age_gate.requires_parental_consent(user_id).await {
            let purposes = self.ledger.current_state(user_id).await.non_essential_grants();
            if !purposes.is_empty() {
                issues.push(ComplianceIssue::MinorWithoutParentalConsent { purposes });
            }
        }

        let penalty: i32 = issues
            .iter()
            .map(|issue| match issue {
                ComplianceIssue::ConsentRenewalRequired { .. } => RENEWAL_PENALTY,
                ComplianceIssue::OverdueRightsRequest { .. } => OVERDUE_PENALTY,
                ComplianceIssue::MinorWithoutParentalConsent { .. } => MINOR_PENALTY,
            })
            .sum();
        let score = (100 - penalty).clamp(0, 100) as u8;

        let mut recommendations: Vec<String> = Vec::new();
        for recommendation in issues.iter().map(ComplianceIssue::recommendation) {
            if !recommendations.contains(&recommendation) {
                recommendations.push(recommendation);
            }
        }

        debug!(
            "Evaluated user {}: score {} with {} issues",
            user_id,
            score,
            issues.len()
        );

        ComplianceReport {
            user_id: user_id.to_string(),
            compliant: score >= self.threshold,
            score,
            issues,
            recommendations,
            evaluated_at: now,
        }
    }
}
