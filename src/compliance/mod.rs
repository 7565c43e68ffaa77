//! Privacy & Consent Compliance
//!
//! このモジュールは、法域ごとのプライバシー法（GDPR、CCPA、LGPD、PIPL など）に準拠した
//! 同意管理・データ主体の権利行使・年齢確認の機能を提供します。
//!
//! ## 主要機能
//!
//! - **法域ポリシー**: 最低年齢、回答期限、適法根拠の表を一元管理
//! - **同意台帳**: 追記専用の同意履歴と現在状態の導出
//! - **年齢ゲート**: 未成年の判定と保護者同意のライフサイクル
//! - **権利行使リクエスト**: 状態遷移、期限延長、期限超過の検出
//! - **コンプライアンス評価**: 利用者ごとのスコアと推奨事項
//!
//! ## 使用例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use privacy_compliance::compliance::{
//!     ConsentGrant, ConsentMethod, DataProcessingPurpose, LegalBasis,
//!     PrivacyComplianceEngine, RegionCode, RegionPolicyResolver, WriteOptions,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = Arc::new(RegionPolicyResolver::builtin()?);
//! let engine = PrivacyComplianceEngine::builder(policy).build();
//!
//! let grant = ConsentGrant {
//!     purpose: DataProcessingPurpose::Analytics,
//!     legal_basis: LegalBasis::Consent,
//!     region: RegionCode::Eu,
//!     method: ConsentMethod::Banner,
//!     version: 1,
//! };
//! engine.record_consent("user-1", &grant, &WriteOptions::new()).await?;
//!
//! let report = engine.evaluate("user-1").await;
//! println!("score {} (stale: {})", report.value.score, report.stale);
//! # Ok(())
//! # }
//! ```

pub mod age_gate;
pub mod clock;
pub mod consent_ledger;
pub mod engine;
pub mod evaluator;
pub mod region_policy;
pub mod rights_requests;
pub mod types;

pub use age_gate::{AgeGate, ParentalTransition};
pub use clock::{Clock, ManualClock, SystemClock};
pub use consent_ledger::{ConsentLedger, ConsentStatistics};
pub use engine::{
    EngineBuilder, NewRightsRequest, PrivacyComplianceEngine, SyncSummary, Synced, WriteOptions,
};
pub use evaluator::ComplianceEvaluator;
pub use region_policy::{PrivacyLawRequirement, PurposeRule, RegionPolicyResolver};
pub use rights_requests::{RequestHistory, RequestStatistics, RightsRequestTracker};
pub use types::*;
