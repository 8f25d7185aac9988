//! Affiliate ledger storage abstractions.
//!
//! This crate defines the document-store contract the ledger consumes:
//! - affiliate records with their balance and counters
//! - referral reads, including cursor-paged scans for batch jobs
//! - payout records
//! - guarded multi-document commits for every balance-touching event
//!
//! Adapters:
//! - `memory`: deterministic, test-friendly, single process.
//! - `postgres` (feature): transactional source of truth with in-database
//!   increments.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

mod error;
pub mod memory;
mod model;
#[cfg(feature = "postgres")]
pub mod postgres;
mod traits;

pub use error::{StorageError, StorageResult};
pub use model::{
    ClearingCommit, ClearingCommitted, ClickCommitted, ConversionCommit, ConversionCommitted,
    PayoutCommit, PayoutCommitted,
};
pub use traits::{
    AffiliateStorage, AffiliateStore, LedgerCommitStore, PageRequest, PayoutStore, QueryWindow,
    ReferralStore,
};
