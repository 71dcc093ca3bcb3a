//! Retention policy implementation for the cleanup scheduler (spec §4.L).

use chrono::Utc;

use super::engine::FjallStore;
use super::error::Result;
use super::partitions::{decode_job_key, encode_meta_key, encode_result_prefix};
use crate::jobs::model::{Job, JobStatus};

const RETENTION_IDEMPOTENCY_DAYS: i64 = 14;

const META_LAST_PRUNE_JOBS: &str = "last_prune_jobs";
const META_LAST_PRUNE_IDEM: &str = "last_prune_idem";

#[derive(Debug, Default)]
pub struct PruneStats {
    pub jobs_pruned: usize,
    pub job_results_pruned: usize,
    pub idempotency_pruned: usize,
}

/// Prune expired entries from all partitions. Jobs past `job_ttl_days` in a
/// terminal state are deleted along with their JobResults (ownership rule:
/// "Jobs exclusively own their JobResults; deleting a job cascades", spec
/// §3). `debug_capture_ttl_days` governs the separate S3-side reap handled by
/// [`reap_debug_captures`], which this function does not touch.
pub fn prune_expired(store: &FjallStore, job_ttl_days: u32, _debug_capture_ttl_days: u32) -> Result<PruneStats> {
    let mut stats = PruneStats::default();

    stats.jobs_pruned = prune_jobs(store, job_ttl_days, &mut stats.job_results_pruned)?;
    stats.idempotency_pruned = prune_idempotency(store)?;

    store.persist()?;
    Ok(stats)
}

fn prune_jobs(store: &FjallStore, job_ttl_days: u32, job_results_pruned: &mut usize) -> Result<usize> {
    let cutoff = Utc::now() - chrono::Duration::days(job_ttl_days as i64);
    let mut pruned = 0;

    let mut expired_ids = Vec::new();
    for item in store.jobs.iter() {
        let (key, value) = item?;
        let job: Job = serde_json::from_slice(&value)?;
        if job.status.is_terminal() {
            let reference_time = job.completed_at.unwrap_or(job.updated_at);
            if reference_time < cutoff {
                expired_ids.push((key, job.id));
            }
        }
    }

    for (key, job_id) in expired_ids {
        store.jobs.remove(key)?;

        let prefix = encode_result_prefix(&job_id);
        let mut result_keys = Vec::new();
        for item in store.job_results.prefix(&prefix) {
            let (key, _) = item?;
            result_keys.push(key);
        }
        for key in result_keys {
            store.job_results.remove(key)?;
            *job_results_pruned += 1;
        }

        pruned += 1;
    }

    store.metadata.insert(
        encode_meta_key(META_LAST_PRUNE_JOBS),
        Utc::now().to_rfc3339().as_bytes(),
    )?;

    Ok(pruned)
}

/// Idempotency keys have no timestamp of their own (matching the teacher's
/// design); they are cleared wholesale once per retention window rather than
/// tracked individually, since they are meant to be short-lived anyway.
fn prune_idempotency(store: &FjallStore) -> Result<usize> {
    let cutoff = Utc::now() - chrono::Duration::days(RETENTION_IDEMPOTENCY_DAYS);
    let mut pruned = 0;

    let should_clear = match store.metadata.get(encode_meta_key(META_LAST_PRUNE_IDEM))? {
        Some(bytes) => {
            let last = std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok());
            match last {
                Some(last) => last.with_timezone(&Utc) < cutoff,
                None => true,
            }
        }
        None => true,
    };

    if should_clear {
        let mut keys = Vec::new();
        for item in store.idempotency.iter() {
            let (key, _) = item?;
            keys.push(key);
        }
        for key in keys {
            store.idempotency.remove(key)?;
            pruned += 1;
        }
    }

    store.metadata.insert(
        encode_meta_key(META_LAST_PRUNE_IDEM),
        Utc::now().to_rfc3339().as_bytes(),
    )?;

    Ok(pruned)
}

/// Decode a raw job key back to its id; exposed for the cleanup scheduler's
/// logging/metrics when it wants to name what it deleted.
pub fn job_id_from_key(key: &[u8]) -> Option<String> {
    decode_job_key(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::{ChainEntry, JobKind};
    use tempfile::TempDir;

    fn create_test_store() -> (FjallStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FjallStore::open(temp_dir.path().join("test_store")).unwrap();
        (store, temp_dir)
    }

    fn make_job(id: &str, completed_at: chrono::DateTime<Utc>, status: JobStatus) -> Job {
        let mut job = Job::new_pending(
            id.into(),
            "user_1".into(),
            JobKind::Extract,
            "https://example.com".into(),
            serde_json::json!({}),
            None,
            vec![ChainEntry { provider: "p".into(), model: "m".into(), temperature: None, max_tokens: None, strict_mode: None }],
            "free".into(),
            false,
            false,
            None,
            completed_at,
        );
        job.status = status;
        job.completed_at = Some(completed_at);
        job
    }

    #[test]
    fn test_prune_jobs_removes_old_terminal_jobs_and_cascades_results() {
        let (store, _temp) = create_test_store();

        let old_job = make_job("job_old", Utc::now() - chrono::Duration::days(60), JobStatus::Completed);
        let key = super::super::partitions::encode_job_key(&old_job.id);
        store.put_json(&store.jobs, key, &old_job).unwrap();

        let result_key = super::super::partitions::encode_result_key("job_old", "https://example.com");
        store.put_json(&store.job_results, result_key, &serde_json::json!({"seq": 0})).unwrap();

        let fresh_job = make_job("job_new", Utc::now(), JobStatus::Completed);
        let key = super::super::partitions::encode_job_key(&fresh_job.id);
        store.put_json(&store.jobs, key, &fresh_job).unwrap();

        let stats = prune_expired(&store, 30, 7).unwrap();
        assert_eq!(stats.jobs_pruned, 1);
        assert_eq!(stats.job_results_pruned, 1);

        assert!(store.get_json::<Job>(&store.jobs, &super::super::partitions::encode_job_key("job_old")).unwrap().is_none());
        assert!(store.get_json::<Job>(&store.jobs, &super::super::partitions::encode_job_key("job_new")).unwrap().is_some());
    }

    #[test]
    fn test_prune_leaves_running_jobs_alone_regardless_of_age() {
        let (store, _temp) = create_test_store();
        let mut job = make_job("job_running", Utc::now() - chrono::Duration::days(90), JobStatus::Running);
        job.completed_at = None;
        let key = super::super::partitions::encode_job_key(&job.id);
        store.put_json(&store.jobs, key, &job).unwrap();

        let stats = prune_expired(&store, 30, 7).unwrap();
        assert_eq!(stats.jobs_pruned, 0);
    }
}
