//! Cost & usage accounting (spec §4.J): pricing lookup, cost calculation,
//! atomic debit/credit against a user's balance, idempotent UsageRecord.

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::dynamic_config::PricingDoc;
use crate::jobs::model::{CreditTransaction, JobKind, JobStatus, TransactionType, UsageInsight, UsageRecord, UserBalance};
use crate::store::partitions::{encode_balance_key, encode_credit_key, encode_idem_key, encode_meta_key, encode_usage_key};
use crate::store::FjallStore;

#[derive(Debug, Error)]
pub enum AccountingError {
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("insufficient credits: balance {balance_usd:.4} would fall below floor {floor_usd:.4}")]
    InsufficientCredits { balance_usd: f64, floor_usd: f64 },
}

pub type Result<T> = std::result::Result<T, AccountingError>;

/// One attempt's token usage, attributed to a (provider, model) pair.
#[derive(Debug, Clone)]
pub struct TokenUsage {
    pub provider: String,
    pub model: String,
    pub token_in: u64,
    pub token_out: u64,
}

/// The rich telemetry a caller hands `finalize_job` so it can write the
/// UsageInsight row paired 1:1 with the UsageRecord (spec §3).
#[derive(Debug, Clone, Default)]
pub struct InsightInput {
    pub provider: String,
    pub model: String,
    pub generation_id: Option<String>,
    pub fetch_duration_ms: u64,
    pub extract_duration_ms: u64,
    pub token_in: u64,
    pub token_out: u64,
    pub markup_rate: f64,
}

/// `llm_cost_usd = Σ(input_tokens * input_rate + output_tokens * output_rate)`
/// across all attempts and pages (spec §4.J step 2); free models (no pricing
/// entry) contribute 0.
pub fn calculate_llm_cost(usages: &[TokenUsage], pricing: &PricingDoc) -> f64 {
    usages
        .iter()
        .map(|usage| match pricing.resolve(&usage.provider, &usage.model) {
            Some(rate) => {
                (usage.token_in as f64 / 1_000_000.0) * rate.input_per_million
                    + (usage.token_out as f64 / 1_000_000.0) * rate.output_per_million
            }
            None => 0.0,
        })
        .sum()
}

/// `user_charge_usd`: 0 if BYOK, else cost marked up by the tier's rate
/// (spec §4.J step 3).
pub fn calculate_user_charge(llm_cost_usd: f64, is_byok: bool, markup_rate: f64) -> f64 {
    if is_byok {
        0.0
    } else {
        llm_cost_usd * (1.0 + markup_rate)
    }
}

pub struct AccountingLedger {
    store: FjallStore,
}

impl AccountingLedger {
    pub fn new(store: FjallStore) -> Self {
        Self { store }
    }

    /// Finalize accounting for a terminal job: write UsageRecord +
    /// UsageInsight (insight written by the caller, which has the richer
    /// per-page telemetry), debit the balance, and append a CreditTransaction
    /// (spec §4.J step 4). Idempotent: a second call for the same job_id is
    /// a no-op, since `usage_records` is keyed uniquely by job_id.
    #[allow(clippy::too_many_arguments)]
    pub fn finalize_job(
        &self,
        job_id: &str,
        user_id: &str,
        kind: JobKind,
        status: JobStatus,
        user_charge_usd: f64,
        is_byok: bool,
        balance_floor_usd: f64,
        insight: InsightInput,
    ) -> Result<()> {
        let usage_key = encode_usage_key(job_id);
        if self.store.usage_records.get(&usage_key)?.is_some() {
            return Ok(());
        }

        if user_charge_usd > 0.0 {
            self.debit_balance(user_id, job_id, user_charge_usd, balance_floor_usd)?;
        }

        let record = UsageRecord {
            job_id: job_id.to_string(),
            user_id: user_id.to_string(),
            date: Utc::now(),
            kind,
            status,
            total_charged_usd: user_charge_usd,
            is_byok,
        };
        self.store.put_json(&self.store.usage_records, usage_key, &record)?;

        let insight_row = UsageInsight {
            job_id: job_id.to_string(),
            provider: insight.provider,
            model: insight.model,
            generation_id: insight.generation_id,
            fetch_duration_ms: insight.fetch_duration_ms,
            extract_duration_ms: insight.extract_duration_ms,
            token_in: insight.token_in,
            token_out: insight.token_out,
            markup_rate: insight.markup_rate,
        };
        self.store.put_json(&self.store.usage_insights, encode_usage_key(job_id), &insight_row)?;

        Ok(())
    }

    /// Reads back the UsageInsight row written by `finalize_job`, for admin
    /// views and tests (spec §3 UsageInsight is otherwise write-only here).
    pub fn get_insight(&self, job_id: &str) -> Result<Option<UsageInsight>> {
        Ok(self.store.get_json(&self.store.usage_insights, &encode_usage_key(job_id))?)
    }

    /// Sums `total_charged_usd` across this user's UsageRecords since the
    /// start of `now`'s UTC calendar month, for tier monthly-quota
    /// enforcement (spec §4.D). `usage_records` has no per-user index, so
    /// this scans the whole partition; acceptable at job-creation rate.
    pub fn monthly_spend(&self, user_id: &str, now: chrono::DateTime<Utc>) -> Result<f64> {
        use chrono::Datelike;
        let month_start = now
            .date_naive()
            .with_day(1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| chrono::DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
            .unwrap_or(now);

        let records: Vec<UsageRecord> = self.store.scan_all_json(&self.store.usage_records)?;
        Ok(records.iter().filter(|r| r.user_id == user_id && r.date >= month_start).map(|r| r.total_charged_usd).sum())
    }

    fn debit_balance(&self, user_id: &str, job_id: &str, amount_usd: f64, floor_usd: f64) -> Result<()> {
        let _guard = self.store.claim_lock.lock().unwrap();

        let balance_key = encode_balance_key(user_id);
        let mut balance: UserBalance = self.store.get_json(&self.store.balances, &balance_key)?.unwrap_or_else(|| {
            let now = Utc::now();
            UserBalance { user_id: user_id.to_string(), balance_usd: 0.0, lifetime_added: 0.0, lifetime_spent: 0.0, period_start: now, period_end: now, updated_at: now }
        });

        let projected = balance.balance_usd - amount_usd;
        if projected < floor_usd {
            return Err(AccountingError::InsufficientCredits { balance_usd: balance.balance_usd, floor_usd });
        }

        balance.balance_usd = projected;
        balance.lifetime_spent += amount_usd;
        balance.updated_at = Utc::now();
        self.store.put_json(&self.store.balances, balance_key, &balance)?;

        let seq = self.next_credit_seq(user_id)?;
        let transaction = CreditTransaction {
            id: Uuid::now_v7().to_string(),
            user_id: user_id.to_string(),
            kind: TransactionType::Usage,
            amount_usd: -amount_usd,
            balance_after: balance.balance_usd,
            expiry: None,
            external_payment_id: None,
            job_id: Some(job_id.to_string()),
            description: format!("usage charge for job {job_id}"),
            created_at: Utc::now(),
        };
        let credit_key = encode_credit_key(user_id, seq);
        self.store.put_json(&self.store.credit_transactions, credit_key, &transaction)?;

        Ok(())
    }

    /// Credits a user's balance outside the usage-debit path: subscription
    /// renewals and topups from the external-IdP lifecycle webhook (spec §6
    /// `POST /webhooks/clerk`). Idempotent on `external_payment_id` when
    /// supplied, mirroring the CreditTransaction invariant in spec §3.
    pub fn credit_balance(&self, user_id: &str, amount_usd: f64, kind: TransactionType, external_payment_id: Option<&str>, description: &str) -> Result<()> {
        let _guard = self.store.claim_lock.lock().unwrap();

        if let Some(payment_id) = external_payment_id {
            let idem_key = encode_idem_key(&format!("extpay:{payment_id}"));
            if self.store.idempotency.get(&idem_key)?.is_some() {
                return Ok(());
            }
            self.store.idempotency.insert(idem_key, user_id.as_bytes())?;
        }

        let balance_key = encode_balance_key(user_id);
        let mut balance: UserBalance = self.store.get_json(&self.store.balances, &balance_key)?.unwrap_or_else(|| {
            let now = Utc::now();
            UserBalance { user_id: user_id.to_string(), balance_usd: 0.0, lifetime_added: 0.0, lifetime_spent: 0.0, period_start: now, period_end: now, updated_at: now }
        });

        balance.balance_usd += amount_usd;
        balance.lifetime_added += amount_usd;
        balance.updated_at = Utc::now();
        self.store.put_json(&self.store.balances, balance_key, &balance)?;

        let seq = self.next_credit_seq(user_id)?;
        let transaction = CreditTransaction {
            id: Uuid::now_v7().to_string(),
            user_id: user_id.to_string(),
            kind,
            amount_usd,
            balance_after: balance.balance_usd,
            expiry: None,
            external_payment_id: external_payment_id.map(String::from),
            job_id: None,
            description: description.to_string(),
            created_at: Utc::now(),
        };
        let credit_key = encode_credit_key(user_id, seq);
        self.store.put_json(&self.store.credit_transactions, credit_key, &transaction)?;

        Ok(())
    }

    /// Records the tier the external IdP reports for a user (spec §6 "mutates
    /// UserBalance and tier state"). Read back by the `Authenticator` at
    /// request time; stored alongside the other per-user ledger rows rather
    /// than as a standalone entity since spec §3 doesn't name one.
    pub fn set_user_tier(&self, user_id: &str, tier: &str) -> Result<()> {
        let key = encode_meta_key(&format!("user_tier:{user_id}"));
        self.store.metadata.insert(key, tier.as_bytes())?;
        Ok(())
    }

    pub fn get_user_tier(&self, user_id: &str) -> Result<Option<String>> {
        let key = encode_meta_key(&format!("user_tier:{user_id}"));
        Ok(self.store.metadata.get(&key)?.and_then(|bytes| std::str::from_utf8(&bytes).ok().map(String::from)))
    }

    fn next_credit_seq(&self, user_id: &str) -> Result<u64> {
        let meta_key = crate::store::partitions::encode_meta_key(&format!("credit_seq:{user_id}"));
        let current: u64 = match self.store.metadata.get(&meta_key)? {
            Some(bytes) => std::str::from_utf8(&bytes).ok().and_then(|s| s.parse().ok()).unwrap_or(0),
            None => 0,
        };
        let next = current + 1;
        self.store.metadata.insert(meta_key, next.to_string().as_bytes())?;
        Ok(next)
    }
}
