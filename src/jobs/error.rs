use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {job_id} expected status {expected:?} but was {actual:?}")]
    StatusMismatch {
        job_id: String,
        expected: crate::jobs::model::JobStatus,
        actual: crate::jobs::model::JobStatus,
    },

    #[error("duplicate job result for ({job_id}, {url})")]
    DuplicateResult { job_id: String, url: String },
}

pub type Result<T> = std::result::Result<T, JobError>;
