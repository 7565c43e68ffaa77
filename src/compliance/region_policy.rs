//! Region Policy Resolver
//!
//! 法域ごとの法的要件（期限・最低年齢・許可される法的根拠）の静的参照
//!
//! The table is loaded once at start-up and checked for completeness: every
//! configured region must define a deadline and an extension for every
//! [`RequestType`], a minimum age, a consent validity period and a rule for
//! every [`DataProcessingPurpose`]. An incomplete table is a deployment
//! defect and construction fails with [`Error::InconsistentPolicy`].

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use super::types::{DataProcessingPurpose, LegalBasis, RegionCode, RequestType};
use crate::error::{Error, Result};

const BUILTIN_REGION_TABLE: &str = include_str!("../../config/regions.toml");

/// 目的ごとの規則
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurposeRule {
    /// 許可される法的根拠
    pub legal_bases: Vec<LegalBasis>,
    /// 現在要求される同意文書のバージョン
    pub required_version: u32,
}

/// 法域ごとの法的要件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrivacyLawRequirement {
    pub region: RegionCode,
    /// リクエスト種別ごとの処理期限（日数）
    pub request_deadline_days: BTreeMap<RequestType, u32>,
    /// リクエスト種別ごとの延長日数
    pub extension_days: BTreeMap<RequestType, u32>,
    /// 保護者同意なしで同意できる最低年齢
    pub minimum_age: u32,
    pub parental_consent_required: bool,
    /// 同意の最大有効期間（日数）
    pub consent_validity_days: u32,
    pub purposes: BTreeMap<DataProcessingPurpose, PurposeRule>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegionTableFile {
    #[serde(default)]
    regions: BTreeMap<String, RegionEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegionEntry {
    minimum_age: Option<u32>,
    #[serde(default = "default_parental_consent_required")]
    parental_consent_required: bool,
    consent_validity_days: Option<u32>,
    #[serde(default)]
    request_deadline_days: BTreeMap<String, u32>,
    #[serde(default)]
    extension_days: BTreeMap<String, u32>,
    #[serde(default)]
    purposes: BTreeMap<String, PurposeEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PurposeEntry {
    #[serde(default)]
    legal_bases: Vec<String>,
    #[serde(default = "default_required_version")]
    required_version: u32,
}

fn default_parental_consent_required() -> bool {
    true
}

fn default_required_version() -> u32 {
    1
}

fn parse_key<T: FromStr<Err = Error>>(raw: &str, context: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|e| Error::Config(format!("{}: {}", context, e)))
}

fn parse_day_map(
    raw: BTreeMap<String, u32>,
    context: &str,
) -> Result<BTreeMap<RequestType, u32>> {
    raw.into_iter()
        .map(|(key, days)| Ok((parse_key::<RequestType>(&key, context)?, days)))
        .collect()
}

/// Region entry with every key parsed. Completeness is checked afterwards.
#[derive(Debug)]
struct ParsedRegion {
    region: RegionCode,
    minimum_age: Option<u32>,
    parental_consent_required: bool,
    consent_validity_days: Option<u32>,
    request_deadline_days: BTreeMap<RequestType, u32>,
    extension_days: BTreeMap<RequestType, u32>,
    purposes: BTreeMap<DataProcessingPurpose, PurposeRule>,
}

impl RegionEntry {
    fn parse(self, region: RegionCode) -> Result<ParsedRegion> {
        let context = format!("region {}", region);

        let mut purposes = BTreeMap::new();
        for (key, entry) in self.purposes {
            let purpose = parse_key::<DataProcessingPurpose>(&key, &context)?;
            let legal_bases = entry
                .legal_bases
                .iter()
                .map(|basis| parse_key::<LegalBasis>(basis, &context))
                .collect::<Result<Vec<_>>>()?;
            purposes.insert(
                purpose,
                PurposeRule {
                    legal_bases,
                    required_version: entry.required_version,
                },
            );
        }

        Ok(ParsedRegion {
            region,
            minimum_age: self.minimum_age,
            parental_consent_required: self.parental_consent_required,
            consent_validity_days: self.consent_validity_days,
            request_deadline_days: parse_day_map(self.request_deadline_days, &context)?,
            extension_days: parse_day_map(self.extension_days, &context)?,
            purposes,
        })
    }
}

impl ParsedRegion {
    fn into_requirement(self) -> Result<PrivacyLawRequirement> {
        let region = self.region;
        let minimum_age = self.minimum_age.ok_or_else(|| {
            Error::InconsistentPolicy(format!("{}: minimum_age is not defined", region))
        })?;
        let consent_validity_days = self.consent_validity_days.ok_or_else(|| {
            Error::InconsistentPolicy(format!("{}: consent_validity_days is not defined", region))
        })?;

        Ok(PrivacyLawRequirement {
            region,
            request_deadline_days: self.request_deadline_days,
            extension_days: self.extension_days,
            minimum_age,
            parental_consent_required: self.parental_consent_required,
            consent_validity_days,
            purposes: self.purposes,
        })
    }
}

/// Collects every completeness problem of one region.
fn check_requirement(req: &PrivacyLawRequirement, problems: &mut Vec<String>) {
    let region = req.region;
    for request_type in RequestType::ALL {
        match req.request_deadline_days.get(request_type) {
            None => problems.push(format!("{}: no deadline for {}", region, request_type)),
            Some(0) => problems.push(format!("{}: deadline for {} is zero", region, request_type)),
            Some(_) => {}
        }
        if !req.extension_days.contains_key(request_type) {
            problems.push(format!("{}: no extension for {}", region, request_type));
        }
    }
    if req.consent_validity_days == 0 {
        problems.push(format!("{}: consent_validity_days is zero", region));
    }
    for purpose in DataProcessingPurpose::ALL {
        match req.purposes.get(purpose) {
            None => problems.push(format!("{}: no rule for purpose {}", region, purpose)),
            Some(rule) if rule.legal_bases.is_empty() => {
                problems.push(format!("{}: purpose {} allows no legal basis", region, purpose))
            }
            Some(rule) if rule.required_version == 0 => problems.push(format!(
                "{}: purpose {} has required_version 0",
                region, purpose
            )),
            Some(_) => {}
        }
    }
}

/// 法域ポリシーリゾルバ
///
/// Immutable after construction; share it with `Arc`.
#[derive(Debug, Clone)]
pub struct RegionPolicyResolver {
    requirements: BTreeMap<RegionCode, PrivacyLawRequirement>,
}

impl RegionPolicyResolver {
    /// 要件一覧から作成（整合性チェック付き）
    pub fn from_requirements(
        requirements: impl IntoIterator<Item = PrivacyLawRequirement>,
    ) -> Result<Self> {
        let mut table = BTreeMap::new();
        for requirement in requirements {
            let region = requirement.region;
            if table.insert(region, requirement).is_some() {
                return Err(Error::InconsistentPolicy(format!(
                    "{}: region defined more than once",
                    region
                )));
            }
        }

        if table.is_empty() {
            return Err(Error::InconsistentPolicy(
                "region table defines no regions".to_string(),
            ));
        }

        let mut problems = Vec::new();
        for requirement in table.values() {
            check_requirement(requirement, &mut problems);
        }
        if !problems.is_empty() {
            return Err(Error::InconsistentPolicy(problems.join("; ")));
        }

        info!("Loaded region policy table with {} regions", table.len());
        Ok(Self {
            requirements: table,
        })
    }

    /// TOML文字列から読み込み
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let file: RegionTableFile = toml::from_str(source)
            .map_err(|e| Error::Config(format!("Failed to parse region table: {}", e)))?;

        // unknown names anywhere in the file win over missing entries
        let parsed = file
            .regions
            .into_iter()
            .map(|(key, entry)| entry.parse(parse_key::<RegionCode>(&key, "region table")?))
            .collect::<Result<Vec<_>>>()?;
        let requirements = parsed
            .into_iter()
            .map(ParsedRegion::into_requirement)
            .collect::<Result<Vec<_>>>()?;

        Self::from_requirements(requirements)
    }

    /// ファイルから読み込み
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Reading region table from {}", path.display());
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// 組み込みテーブル
    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(BUILTIN_REGION_TABLE)
    }

    /// Loads `path` when given, the built-in table otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Self::builtin(),
        }
    }

    /// 設定済みの法域
    pub fn regions(&self) -> impl Iterator<Item = RegionCode> + '_ {
        self.requirements.keys().copied()
    }

    /// 法域の要件を取得
    pub fn requirements_for(&self, region: RegionCode) -> Result<&PrivacyLawRequirement> {
        self.requirements
            .get(&region)
            .ok_or(Error::UnknownRegion(region))
    }

    pub fn minimum_age(&self, region: RegionCode) -> Result<u32> {
        Ok(self.requirements_for(region)?.minimum_age)
    }

    pub fn deadline_days(&self, region: RegionCode, request_type: RequestType) -> Result<u32> {
        self.requirements_for(region)?
            .request_deadline_days
            .get(&request_type)
            .copied()
            .ok_or_else(|| {
                Error::InconsistentPolicy(format!("{}: no deadline for {}", region, request_type))
            })
    }

    pub fn extension_days(&self, region: RegionCode, request_type: RequestType) -> Result<u32> {
        self.requirements_for(region)?
            .extension_days
            .get(&request_type)
            .copied()
            .ok_or_else(|| {
                Error::InconsistentPolicy(format!("{}: no extension for {}", region, request_type))
            })
    }

    fn purpose_rule(
        &self,
        region: RegionCode,
        purpose: DataProcessingPurpose,
    ) -> Result<&PurposeRule> {
        self.requirements_for(region)?
            .purposes
            .get(&purpose)
            .ok_or_else(|| {
                Error::InconsistentPolicy(format!("{}: no rule for purpose {}", region, purpose))
            })
    }

    /// 目的に対して許可される法的根拠
    pub fn legal_bases_allowed(
        &self,
        region: RegionCode,
        purpose: DataProcessingPurpose,
    ) -> Result<&[LegalBasis]> {
        Ok(&self.purpose_rule(region, purpose)?.legal_bases)
    }

    pub fn required_version(
        &self,
        region: RegionCode,
        purpose: DataProcessingPurpose,
    ) -> Result<u32> {
        Ok(self.purpose_rule(region, purpose)?.required_version)
    }

    /// 同意の最大有効期間
    pub fn consent_validity(&self, region: RegionCode) -> Result<Duration> {
        Ok(Duration::days(i64::from(
            self.requirements_for(region)?.consent_validity_days,
        )))
    }

    /// Fails with [`Error::InvalidLegalBasis`] when `basis` is not allowed.
    pub fn ensure_legal_basis(
        &self,
        region: RegionCode,
        purpose: DataProcessingPurpose,
        basis: LegalBasis,
    ) -> Result<()> {
        if self.legal_bases_allowed(region, purpose)?.contains(&basis) {
            Ok(())
        } else {
            Err(Error::InvalidLegalBasis {
                purpose,
                basis,
                region,
            })
        }
    }
}
