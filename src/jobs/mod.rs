//! Job lifecycle manager (spec §3, §4.G): the Job/JobResult data model and
//! the repository that exposes atomic transitions over the Fjall store.

pub mod error;
pub mod model;
pub mod repository;

pub use error::{JobError, Result};
pub use model::{
    ApiKey, ChainEntry, CrawlOptions, CrawlStatus, CreditTransaction, DeliveryStatus,
    DiscoveryMethod, ErrorCategory, Job, JobKind, JobResult, JobStatus, SchemaSnapshot,
    TransactionType, UsageInsight, UsageRecord, UserBalance, Webhook, WebhookDelivery,
};
pub use repository::{age_since, FjallJobRepository, JobMutator, JobRepository, ResultMutator};
