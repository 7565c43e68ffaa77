//! Compliance Types
//!
//! 同意台帳・権利行使リクエスト・年齢確認に関する型定義

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// Implements `ALL`, `as_str`, `Display` and `FromStr` for a closed-set enum.
/// Names must match the serde representation of each variant.
macro_rules! closed_set {
    ($ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            /// 全バリアント
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            /// 設定ファイル・API上の名前
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $name),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $ty::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str().eq_ignore_ascii_case(s.trim()))
                    .ok_or_else(|| {
                        Error::InvalidInput(format!(concat!("unknown ", stringify!($ty), ": {}"), s))
                    })
            }
        }
    };
}

/// 法域コード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RegionCode {
    /// 欧州連合（GDPR）
    Eu,
    /// 英国（UK GDPR）
    Uk,
    /// 米国（CCPA/COPPA）
    Us,
    /// カナダ（PIPEDA）
    Ca,
    /// ブラジル（LGPD）
    Br,
    /// 中国（PIPL）
    Cn,
    /// 台湾（PDPA）
    Tw,
    /// 日本（APPI）
    Jp,
    /// 韓国（PIPA）
    Kr,
    /// オーストラリア（Privacy Act）
    Au,
    /// シンガポール（PDPA）
    Sg,
    /// インド（DPDP Act）
    In,
}

closed_set!(RegionCode {
    Eu => "EU",
    Uk => "UK",
    Us => "US",
    Ca => "CA",
    Br => "BR",
    Cn => "CN",
    Tw => "TW",
    Jp => "JP",
    Kr => "KR",
    Au => "AU",
    Sg => "SG",
    In => "IN",
});

/// データ処理目的
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataProcessingPurpose {
    /// サービス提供に不可欠な処理
    Essential,
    /// 利用状況の分析
    Analytics,
    /// マーケティング
    Marketing,
    /// パーソナライズ
    Personalization,
    /// 第三者提供
    ThirdPartySharing,
}

closed_set!(DataProcessingPurpose {
    Essential => "essential",
    Analytics => "analytics",
    Marketing => "marketing",
    Personalization => "personalization",
    ThirdPartySharing => "third_party_sharing",
});

/// 法的根拠
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegalBasis {
    /// 同意（GDPR Art.6(1)(a)）
    Consent,
    /// 正当な利益（GDPR Art.6(1)(f)）
    LegitimateInterest,
    /// 契約履行（GDPR Art.6(1)(b)）
    Contract,
    /// 法的義務（GDPR Art.6(1)(c)）
    LegalObligation,
    /// 重要な利益（GDPR Art.6(1)(d)）
    VitalInterest,
    /// 公共の任務（GDPR Art.6(1)(e)）
    PublicTask,
}

closed_set!(LegalBasis {
    Consent => "consent",
    LegitimateInterest => "legitimate_interest",
    Contract => "contract",
    LegalObligation => "legal_obligation",
    VitalInterest => "vital_interest",
    PublicTask => "public_task",
});

/// 同意の取得方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentMethod {
    ExplicitOptIn,
    Banner,
    Settings,
    Api,
    Parental,
}

closed_set!(ConsentMethod {
    ExplicitOptIn => "explicit_opt_in",
    Banner => "banner",
    Settings => "settings",
    Api => "api",
    Parental => "parental",
});

/// データ主体リクエストの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    /// アクセス権（GDPR Art.15, CCPA §1798.100）
    Access,
    /// 訂正権（GDPR Art.16）
    Rectification,
    /// 削除権（GDPR Art.17, CCPA §1798.105）
    Erasure,
    /// ポータビリティ権（GDPR Art.20）
    Portability,
    /// 処理制限権（GDPR Art.18）
    Restriction,
    /// 異議申立権（GDPR Art.21, CCPA §1798.120）
    Objection,
}

closed_set!(RequestType {
    Access => "access",
    Rectification => "rectification",
    Erasure => "erasure",
    Portability => "portability",
    Restriction => "restriction",
    Objection => "objection",
});

/// リクエストの優先度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPriority {
    Low,
    Normal,
    High,
    Urgent,
}

closed_set!(RequestPriority {
    Low => "low",
    Normal => "normal",
    High => "high",
    Urgent => "urgent",
});

/// リクエスト処理ステータス
///
/// ```text
/// submitted ──▶ identity_verification_pending ──▶ in_progress ──▶ fulfilled | rejected
///                                                     │
///                                                     └──▶ extended ──▶ fulfilled | rejected
/// (any non-terminal) ──▶ withdrawn
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// 受付済み
    Submitted,
    /// 本人確認中
    IdentityVerificationPending,
    /// 処理中
    InProgress,
    /// 期限延長
    Extended,
    /// 完了
    Fulfilled,
    /// 拒否
    Rejected,
    /// 利用者による取り下げ
    Withdrawn,
}

closed_set!(RequestStatus {
    Submitted => "submitted",
    IdentityVerificationPending => "identity_verification_pending",
    InProgress => "in_progress",
    Extended => "extended",
    Fulfilled => "fulfilled",
    Rejected => "rejected",
    Withdrawn => "withdrawn",
});

impl RequestStatus {
    /// 終端状態かどうか
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Fulfilled | Self::Rejected | Self::Withdrawn)
    }

    /// 状態遷移が許可されているか
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Submitted, IdentityVerificationPending)
                | (IdentityVerificationPending, InProgress)
                | (InProgress, Fulfilled)
                | (InProgress, Rejected)
                | (InProgress, Extended)
                | (Extended, Fulfilled)
                | (Extended, Rejected)
                | (_, Withdrawn)
        )
    }
}

/// 年齢確認の方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeVerificationMethod {
    SelfDeclared,
    Document,
    PaymentCard,
    ParentalAttestation,
}

closed_set!(AgeVerificationMethod {
    SelfDeclared => "self_declared",
    Document => "document",
    PaymentCard => "payment_card",
    ParentalAttestation => "parental_attestation",
});

impl AgeVerificationMethod {
    /// 自己申告以外は検証済みとみなす
    pub fn is_verifying(&self) -> bool {
        !matches!(self, Self::SelfDeclared)
    }
}

/// 保護者同意リクエストのステータス
///
/// `pending → sent → {verified | rejected}`; `pending` may also go straight to
/// `verified` or `rejected`. `verified` and `rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentalConsentStatus {
    Pending,
    Sent,
    Verified,
    Rejected,
}

closed_set!(ParentalConsentStatus {
    Pending => "pending",
    Sent => "sent",
    Verified => "verified",
    Rejected => "rejected",
});

impl ParentalConsentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::Rejected)
    }

    pub fn can_transition_to(&self, next: ParentalConsentStatus) -> bool {
        use ParentalConsentStatus::*;
        matches!(
            (self, next),
            (Pending, Sent) | (Pending | Sent, Verified) | (Pending | Sent, Rejected)
        )
    }
}

/// 同意記録
///
/// Records are immutable once appended. A withdrawal is a new record with
/// `granted = false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
    /// 同意ID
    pub id: Uuid,
    /// 利用者ID
    pub user_id: String,
    /// 処理目的
    pub purpose: DataProcessingPurpose,
    /// 法的根拠
    pub legal_basis: LegalBasis,
    /// 法域
    pub region: RegionCode,
    /// 同意の有無
    pub granted: bool,
    /// 取得方法
    pub consent_method: ConsentMethod,
    /// 同意文書のバージョン
    pub consent_version: u32,
    /// 記録日時
    pub timestamp: DateTime<Utc>,
    /// 撤回日時
    pub withdrawn_at: Option<DateTime<Utc>>,
}

/// 同意付与の入力
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentGrant {
    pub purpose: DataProcessingPurpose,
    pub legal_basis: LegalBasis,
    pub region: RegionCode,
    pub method: ConsentMethod,
    pub version: u32,
}

/// 目的ごとの現在の同意状態
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurposeConsent {
    pub granted: bool,
    pub legal_basis: LegalBasis,
    pub region: RegionCode,
    pub consent_version: u32,
    pub record_id: Uuid,
    pub updated_at: DateTime<Utc>,
}

/// プライバシー設定のスナップショット（台帳から再構築可能なキャッシュ）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivacyPreferences {
    pub user_id: String,
    pub purposes: BTreeMap<DataProcessingPurpose, PurposeConsent>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PrivacyPreferences {
    pub fn empty(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            purposes: BTreeMap::new(),
            updated_at: None,
        }
    }

    /// 目的に対して同意が有効か
    pub fn is_granted(&self, purpose: DataProcessingPurpose) -> bool {
        self.purposes.get(&purpose).is_some_and(|p| p.granted)
    }

    /// Purposes other than `essential` that are currently granted.
    pub fn non_essential_grants(&self) -> Vec<DataProcessingPurpose> {
        self.purposes
            .iter()
            .filter(|(purpose, state)| {
                **purpose != DataProcessingPurpose::Essential && state.granted
            })
            .map(|(purpose, _)| *purpose)
            .collect()
    }
}

/// 一括更新の1件分
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsentUpdate {
    Grant(ConsentGrant),
    Withdraw(DataProcessingPurpose),
}

impl ConsentUpdate {
    pub fn purpose(&self) -> DataProcessingPurpose {
        match self {
            ConsentUpdate::Grant(grant) => grant.purpose,
            ConsentUpdate::Withdraw(purpose) => *purpose,
        }
    }
}

/// 一括更新で失敗した項目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub purpose: DataProcessingPurpose,
    pub code: String,
    pub reason: String,
}

/// 一括更新の結果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchUpdateResult {
    pub updated: usize,
    pub failed: Vec<BatchFailure>,
}

/// 同意更新の要否
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalStatus {
    pub needs_renewal: bool,
    pub expired_purposes: Vec<DataProcessingPurpose>,
    /// Earliest validity expiry among currently granted purposes.
    pub deadline: Option<DateTime<Utc>>,
}

/// データ主体リクエスト
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRightsRequest {
    /// リクエストID
    pub id: Uuid,
    /// 利用者ID
    pub user_id: String,
    /// 法域
    pub region: RegionCode,
    /// リクエストの種類
    pub request_type: RequestType,
    /// 説明
    pub description: String,
    /// 優先度
    pub priority: RequestPriority,
    /// ステータス
    pub status: RequestStatus,
    /// 受付日時
    pub submitted_at: DateTime<Utc>,
    /// 処理期限（受付時に確定）
    pub deadline: DateTime<Utc>,
    /// 延長後の期限（1回のみ設定可能）
    pub extended_deadline: Option<DateTime<Utc>>,
    /// 延長理由
    pub extension_reason: Option<String>,
    /// 完了日時
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DataRightsRequest {
    /// 実効期限
    pub fn effective_deadline(&self) -> DateTime<Utc> {
        self.extended_deadline.unwrap_or(self.deadline)
    }

    /// 期限超過かどうか
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.effective_deadline() < now
    }
}

/// 年齢確認結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeVerificationResult {
    pub user_id: String,
    pub region: RegionCode,
    pub birth_date: NaiveDate,
    pub age: u32,
    pub method: AgeVerificationMethod,
    pub verified: bool,
    pub requires_parental_consent: bool,
    pub verified_at: DateTime<Utc>,
}

/// 保護者同意リクエスト
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentalConsentRequest {
    pub id: Uuid,
    pub user_id: String,
    pub parent_email: String,
    pub status: ParentalConsentStatus,
    pub requested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// コンプライアンス上の問題
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComplianceIssue {
    /// 同意の更新が必要
    ConsentRenewalRequired { purpose: DataProcessingPurpose },
    /// 期限超過の権利行使リクエスト
    OverdueRightsRequest {
        request_id: Uuid,
        request_type: RequestType,
        deadline: DateTime<Utc>,
    },
    /// 保護者同意のない未成年者の非必須同意
    MinorWithoutParentalConsent {
        purposes: Vec<DataProcessingPurpose>,
    },
}

impl ComplianceIssue {
    /// 問題種別ごとの固定推奨文
    pub fn recommendation(&self) -> String {
        match self {
            ComplianceIssue::ConsentRenewalRequired { purpose } => {
                format!("Renew consent for purpose {}", purpose)
            }
            ComplianceIssue::OverdueRightsRequest {
                request_id,
                request_type,
                ..
            } => format!(
                "Resolve overdue {} request {} immediately",
                request_type, request_id
            ),
            ComplianceIssue::MinorWithoutParentalConsent { .. } => {
                "Obtain verified parental consent or suspend non-essential processing".to_string()
            }
        }
    }
}

/// コンプライアンスレポート（都度計算、永続化しない）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub user_id: String,
    pub compliant: bool,
    pub score: u8,
    pub issues: Vec<ComplianceIssue>,
    pub recommendations: Vec<String>,
    pub evaluated_at: DateTime<Utc>,
}
