//! Fjall-based persistence layer backing the job repository and every other
//! entity in the data model (spec §3).
//!
//! This module owns the embedded LSM store and its partition layout. It
//! stands in for "the relational database" the spec describes only by
//! required semantics: single-row conditional updates, unique constraints,
//! foreign-key cascade/set-null, and atomic multi-write transactions.
//! `FjallStore` exposes generic JSON get/put/scan primitives per partition;
//! the domain-specific CAS operations (`ClaimPending`, `UpdateAtomic`) live in
//! [`crate::jobs::repository`], built on top of `claim_lock`.
//!
//! ## Partitions
//!
//! One partition per entity: `jobs`, `job_results`, `balances`,
//! `credit_transactions`, `usage_records`, `usage_insights`,
//! `schema_snapshots`, `api_keys`, `webhooks`, `webhook_deliveries`, plus
//! `idempotency` and `metadata` for cross-cutting concerns.
//!
//! ## Retention
//!
//! Jobs (and their cascaded JobResults) older than `job_ttl_days` in a
//! terminal state are pruned by the cleanup scheduler (spec §4.L); see
//! [`pruning`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use refyne_core::store::FjallStore;
//!
//! let store = FjallStore::open("data/store")?;
//! ```

pub mod engine;
pub mod error;
pub mod partitions;
pub mod pruning;

pub use engine::{FjallStore, StoreStats};
pub use error::{Result, StoreError};
pub use pruning::PruneStats;
