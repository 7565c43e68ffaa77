//! # privacy-compliance
//!
//! Privacy & consent compliance engine: region-aware consent ledger, age gate,
//! data-subject rights request tracking and compliance scoring.
//!
//! Mutations are written through to a remote compliance authority before the
//! local state changes; reads are served locally and flagged when stale.

pub mod compliance;
pub mod config;
pub mod error;
pub mod logging;
pub mod sync;

pub use compliance::{PrivacyComplianceEngine, RegionPolicyResolver, Synced, WriteOptions};
pub use error::{Error, ErrorKind, Result};
