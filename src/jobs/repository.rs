//! Job repository (spec §4.G): transactional CRUD, `ClaimPending` and
//! `MarkStaleRunningJobsFailed` over the Fjall-backed store.
//!
//! Grounded on the teacher's `ledger::store::FjallStore` CRUD pattern,
//! generalized from one `jobs` partition to the job + job_results pair and
//! extended with the CAS operations an embedded store needs in place of SQL
//! transactions (see [`crate::store::engine`] for the locking rationale).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::jobs::model::{Job, JobResult, JobStatus};
use crate::store::partitions::{
    encode_job_key, encode_result_key, encode_result_prefix, encode_meta_key,
};
use crate::store::FjallStore;

use super::error::{JobError, Result};

/// Mutator applied under the job-row CAS lock. Boxed so the trait stays
/// object-safe (`Arc<dyn JobRepository>` is shared across worker tasks).
pub type JobMutator = Box<dyn FnOnce(&mut Job) + Send>;
pub type ResultMutator = Box<dyn FnOnce(&mut JobResult) + Send>;

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create(&self, job: Job) -> Result<()>;
    async fn get_by_id(&self, job_id: &str) -> Result<Option<Job>>;
    async fn update_atomic(&self, job_id: &str, expected: JobStatus, mutate: JobMutator) -> Result<Job>;
    async fn list_for_user(&self, user_id: &str, limit: usize, offset: usize) -> Result<Vec<Job>>;
    async fn count_concurrent_running(&self, user_id: &str) -> Result<usize>;
    async fn claim_pending(&self) -> Result<Option<Job>>;
    async fn mark_stale_running_jobs_failed(&self, max_age: chrono::Duration) -> Result<usize>;

    async fn insert_result(&self, result: JobResult) -> Result<bool>;
    async fn get_result(&self, job_id: &str, url: &str) -> Result<Option<JobResult>>;
    async fn update_result(&self, job_id: &str, url: &str, mutate: ResultMutator) -> Result<()>;
    async fn list_results(&self, job_id: &str, limit: usize, offset: usize) -> Result<Vec<JobResult>>;
    async fn claim_next_pending_result(&self, job_id: &str) -> Result<Option<JobResult>>;
    async fn next_result_seq(&self, job_id: &str) -> Result<u64>;
}

#[derive(Clone)]
pub struct FjallJobRepository {
    store: FjallStore,
}

impl FjallJobRepository {
    pub fn new(store: FjallStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JobRepository for FjallJobRepository {
    async fn create(&self, job: Job) -> Result<()> {
        let key = encode_job_key(&job.id);
        self.store.put_json(&self.store.jobs, key, &job)?;
        Ok(())
    }

    async fn get_by_id(&self, job_id: &str) -> Result<Option<Job>> {
        let key = encode_job_key(job_id);
        Ok(self.store.get_json(&self.store.jobs, &key)?)
    }

    async fn update_atomic(&self, job_id: &str, expected: JobStatus, mutate: JobMutator) -> Result<Job> {
        let _guard = self.store.claim_lock.lock().unwrap();
        let key = encode_job_key(job_id);
        let mut job: Job = self
            .store
            .get_json(&self.store.jobs, &key)?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

        if job.status != expected {
            return Err(JobError::StatusMismatch {
                job_id: job_id.to_string(),
                expected,
                actual: job.status,
            });
        }

        mutate(&mut job);
        job.updated_at = Utc::now();
        self.store.put_json(&self.store.jobs, key, &job)?;
        Ok(job)
    }

    async fn list_for_user(&self, user_id: &str, limit: usize, offset: usize) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self.store.scan_all_json(&self.store.jobs)?;
        jobs.retain(|j| j.user_id == user_id);
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_concurrent_running(&self, user_id: &str) -> Result<usize> {
        let jobs: Vec<Job> = self.store.scan_all_json(&self.store.jobs)?;
        Ok(jobs
            .iter()
            .filter(|j| j.user_id == user_id && j.status == JobStatus::Running)
            .count())
    }

    async fn claim_pending(&self) -> Result<Option<Job>> {
        let _guard = self.store.claim_lock.lock().unwrap();

        let mut candidates: Vec<Job> = self.store.scan_all_json(&self.store.jobs)?;
        candidates.retain(|j| j.status == JobStatus::Pending);
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let Some(mut job) = candidates.into_iter().next() else {
            return Ok(None);
        };

        let now = Utc::now();
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.updated_at = now;

        let key = encode_job_key(&job.id);
        self.store.put_json(&self.store.jobs, key, &job)?;
        Ok(Some(job))
    }

    async fn mark_stale_running_jobs_failed(&self, max_age: chrono::Duration) -> Result<usize> {
        let _guard = self.store.claim_lock.lock().unwrap();
        let cutoff = Utc::now() - max_age;

        let jobs: Vec<Job> = self.store.scan_all_json(&self.store.jobs)?;
        let mut count = 0;

        for mut job in jobs {
            if job.status != JobStatus::Running {
                continue;
            }
            let started = match job.started_at {
                Some(started) => started,
                None => continue,
            };
            if started >= cutoff {
                continue;
            }

            job.status = JobStatus::Failed;
            job.error_category = Some(crate::jobs::model::ErrorCategory::StaleWorker);
            job.error_message = Some("job recovered after worker crash (stale claim)".to_string());
            job.completed_at = Some(Utc::now());
            job.updated_at = Utc::now();

            let key = encode_job_key(&job.id);
            self.store.put_json(&self.store.jobs, key, &job)?;
            count += 1;
        }

        Ok(count)
    }

    async fn insert_result(&self, mut result: JobResult) -> Result<bool> {
        let _guard = self.store.claim_lock.lock().unwrap();
        let key = encode_result_key(&result.job_id, &result.url);

        if self.store.job_results.get(&key)?.is_some() {
            return Ok(false);
        }

        result.seq = self.next_seq_locked(&result.job_id)?;
        self.store.put_json(&self.store.job_results, key, &result)?;
        Ok(true)
    }

    async fn get_result(&self, job_id: &str, url: &str) -> Result<Option<JobResult>> {
        let key = encode_result_key(job_id, url);
        Ok(self.store.get_json(&self.store.job_results, &key)?)
    }

    async fn update_result(&self, job_id: &str, url: &str, mutate: ResultMutator) -> Result<()> {
        let key = encode_result_key(job_id, url);
        let mut result: JobResult = self
            .store
            .get_json(&self.store.job_results, &key)?
            .ok_or_else(|| JobError::NotFound(format!("{job_id}:{url}")))?;
        mutate(&mut result);
        self.store.put_json(&self.store.job_results, key, &result)?;
        Ok(())
    }

    async fn list_results(&self, job_id: &str, limit: usize, offset: usize) -> Result<Vec<JobResult>> {
        let prefix = encode_result_prefix(job_id);
        let mut results: Vec<JobResult> = self.store.scan_prefix_json(&self.store.job_results, &prefix)?;
        results.sort_by_key(|r| r.seq);
        Ok(results.into_iter().skip(offset).take(limit).collect())
    }

    async fn claim_next_pending_result(&self, job_id: &str) -> Result<Option<JobResult>> {
        let _guard = self.store.claim_lock.lock().unwrap();
        let prefix = encode_result_prefix(job_id);
        let mut candidates: Vec<JobResult> = self.store.scan_prefix_json(&self.store.job_results, &prefix)?;
        candidates.retain(|r| r.crawl_status == crate::jobs::model::CrawlStatus::Pending);
        candidates.sort_by_key(|r| r.seq);

        let Some(mut result) = candidates.into_iter().next() else {
            return Ok(None);
        };

        result.crawl_status = crate::jobs::model::CrawlStatus::Crawling;
        let key = encode_result_key(&result.job_id, &result.url);
        self.store.put_json(&self.store.job_results, key, &result)?;
        Ok(Some(result))
    }

    async fn next_result_seq(&self, job_id: &str) -> Result<u64> {
        let _guard = self.store.claim_lock.lock().unwrap();
        self.next_seq_locked(job_id)
    }
}

impl FjallJobRepository {
    fn next_seq_locked(&self, job_id: &str) -> Result<u64> {
        let meta_key = encode_meta_key(&format!("result_seq:{job_id}"));
        let current: u64 = match self.store.metadata.get(&meta_key)? {
            Some(bytes) => std::str::from_utf8(&bytes).ok().and_then(|s| s.parse().ok()).unwrap_or(0),
            None => 0,
        };
        let next = current + 1;
        self.store.metadata.insert(meta_key, next.to_string().as_bytes())?;
        Ok(next)
    }
}

/// Helper to derive a job's effective `DateTime` window for age comparisons
/// used outside this module (e.g. idle monitor reporting the oldest running
/// job). Kept here to avoid re-deriving chrono arithmetic in callers.
pub fn age_since(timestamp: DateTime<Utc>) -> chrono::Duration {
    Utc::now() - timestamp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{ChainEntry, JobKind};
    use tempfile::TempDir;

    fn make_repo() -> (FjallJobRepository, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = FjallStore::open(temp.path().join("store")).unwrap();
        (FjallJobRepository::new(store), temp)
    }

    fn make_job(id: &str, user_id: &str) -> Job {
        Job::new_pending(
            id.into(),
            user_id.into(),
            JobKind::Extract,
            "https://example.com".into(),
            serde_json::json!({"title": "string"}),
            None,
            vec![ChainEntry { provider: "openrouter".into(), model: "m".into(), temperature: None, max_tokens: None, strict_mode: None }],
            "free".into(),
            false,
            false,
            None,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (repo, _temp) = make_repo();
        let job = make_job("job_1", "user_1");
        repo.create(job.clone()).await.unwrap();
        let fetched = repo.get_by_id("job_1").await.unwrap().unwrap();
        assert_eq!(fetched.id, "job_1");
        assert_eq!(fetched.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_claim_pending_picks_oldest_and_marks_running() {
        let (repo, _temp) = make_repo();
        let mut older = make_job("job_old", "user_1");
        older.created_at = Utc::now() - chrono::Duration::seconds(10);
        let newer = make_job("job_new", "user_1");

        repo.create(newer).await.unwrap();
        repo.create(older).await.unwrap();

        let claimed = repo.claim_pending().await.unwrap().unwrap();
        assert_eq!(claimed.id, "job_old");
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(claimed.started_at.is_some());

        let remaining = repo.claim_pending().await.unwrap().unwrap();
        assert_eq!(remaining.id, "job_new");

        assert!(repo.claim_pending().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_atomic_rejects_status_mismatch() {
        let (repo, _temp) = make_repo();
        let job = make_job("job_1", "user_1");
        repo.create(job).await.unwrap();

        let result = repo
            .update_atomic("job_1", JobStatus::Running, Box::new(|j| j.status = JobStatus::Completed))
            .await;
        assert!(matches!(result, Err(JobError::StatusMismatch { .. })));

        let ok = repo
            .update_atomic("job_1", JobStatus::Pending, Box::new(|j| j.status = JobStatus::Running))
            .await
            .unwrap();
        assert_eq!(ok.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_mark_stale_running_jobs_failed() {
        let (repo, _temp) = make_repo();
        let mut job = make_job("job_stale", "user_1");
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now() - chrono::Duration::minutes(90));
        repo.create(job).await.unwrap();

        let count = repo.mark_stale_running_jobs_failed(chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(count, 1);

        let fetched = repo.get_by_id("job_stale").await.unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Failed);
        assert_eq!(fetched.error_category, Some(crate::jobs::model::ErrorCategory::StaleWorker));
    }

    #[tokio::test]
    async fn test_insert_result_dedupes_by_job_and_url() {
        let (repo, _temp) = make_repo();
        let now = Utc::now();
        let result = JobResult::new_pending("job_1".into(), "https://example.com/a".into(), None, 0, 0, now);

        assert!(repo.insert_result(result.clone()).await.unwrap());
        assert!(!repo.insert_result(result).await.unwrap());

        let all = repo.list_results("job_1", 10, 0).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_next_pending_result_orders_by_seq() {
        let (repo, _temp) = make_repo();
        let now = Utc::now();
        for i in 0..3 {
            let r = JobResult::new_pending("job_1".into(), format!("https://example.com/{i}"), None, 0, 0, now);
            repo.insert_result(r).await.unwrap();
        }

        let first = repo.claim_next_pending_result("job_1").await.unwrap().unwrap();
        assert_eq!(first.url, "https://example.com/0");
        assert_eq!(first.crawl_status, crate::jobs::model::CrawlStatus::Crawling);

        let second = repo.claim_next_pending_result("job_1").await.unwrap().unwrap();
        assert_eq!(second.url, "https://example.com/1");
    }
}
