//! Cost ledger: pricing, per-job cost arithmetic, project aggregation, and
//! budget classification.
//!
//! Prices are USD per million tokens. All arithmetic uses [`Decimal`] and
//! comparisons always use the unrounded value; rounding to two decimal
//! places happens only in the report shapes handed back to the HTTP layer.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::CostConfig;
use crate::error::{CostError, StoreError};
use crate::job::{JobStatus, JobStore};

const MILLION: Decimal = dec!(1000000);

/// USD per million input/output tokens for one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricePair {
    pub input: Decimal,
    pub output: Decimal,
}

/// Static price table. Unlisted models fall back to their provider's
/// default row; unknown providers fall back to the deployment default.
fn table_price(provider: &str, model: &str) -> Option<PricePair> {
    let (input, output) = match (provider, model) {
        ("anthropic", "claude-sonnet-4-20250514") => (dec!(3.00), dec!(15.00)),
        ("anthropic", "claude-sonnet-4-5-20250929") => (dec!(3.00), dec!(15.00)),
        ("anthropic", "claude-haiku-4-5-20251001") => (dec!(0.25), dec!(1.25)),
        ("anthropic", "claude-opus-4-5-20251101") => (dec!(15.00), dec!(75.00)),
        ("anthropic", _) => (dec!(3.00), dec!(15.00)),

        ("openai", "gpt-5.1") => (dec!(10.00), dec!(30.00)),
        ("openai", "gpt-5-mini") => (dec!(0.15), dec!(0.60)),
        ("openai", "gpt-5-nano") => (dec!(0.10), dec!(0.40)),
        ("openai", "gpt-5-pro") => (dec!(15.00), dec!(60.00)),
        ("openai", "gpt-4o") => (dec!(5.00), dec!(15.00)),
        ("openai", _) => (dec!(5.00), dec!(15.00)),

        ("groq", "llama-3.3-70b-versatile") => (dec!(0.59), dec!(0.79)),
        ("groq", "llama-3.1-8b-instant") => (dec!(0.05), dec!(0.08)),
        ("groq", "gemma2-27b-it") => (dec!(0.20), dec!(0.20)),
        ("groq", "mixtral-8x7b-32768") => (dec!(0.27), dec!(0.27)),
        ("groq", _) => (dec!(0.20), dec!(0.20)),

        ("xai", "grok-4-1-fast-reasoning") => (dec!(5.00), dec!(15.00)),
        ("xai", "grok-4-1-fast-non-reasoning") => (dec!(1.00), dec!(5.00)),
        ("xai", "grok-code-fast-1") => (dec!(2.00), dec!(10.00)),
        ("xai", "grok-4-fast-reasoning") => (dec!(5.00), dec!(15.00)),
        ("xai", "grok-3-mini") => (dec!(0.50), dec!(2.00)),
        ("xai", "grok-3") => (dec!(3.00), dec!(10.00)),
        ("xai", _) => (dec!(2.00), dec!(8.00)),

        _ => return None,
    };
    Some(PricePair { input, output })
}

/// Cost of one usage sample: `(in/1e6)·p_in + (out/1e6)·p_out`.
pub fn cost_of(
    provider: &str,
    model: &str,
    tokens_in: u64,
    tokens_out: u64,
    config: &CostConfig,
) -> Result<Decimal, CostError> {
    let price = match table_price(provider, model) {
        Some(pair) => pair,
        None => match (config.default_input_price, config.default_output_price) {
            (Some(input), Some(output)) => PricePair { input, output },
            _ => {
                return Err(CostError::PricingUnknown {
                    provider: provider.to_string(),
                    model: model.to_string(),
                });
            }
        },
    };
    Ok(Decimal::from(tokens_in) / MILLION * price.input
        + Decimal::from(tokens_out) / MILLION * price.output)
}

/// Spend classification relative to a project's allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetLevel {
    Ok,
    Warning,
    Critical,
    Exceeded,
}

impl BudgetLevel {
    /// Thresholds are inclusive: exactly 80% is `Warning`, exactly 95% is
    /// `Critical`, exactly 100% is `Exceeded`.
    fn from_pct(pct: Decimal) -> Self {
        if pct >= dec!(100) {
            Self::Exceeded
        } else if pct >= dec!(95) {
            Self::Critical
        } else if pct >= dec!(80) {
            Self::Warning
        } else {
            Self::Ok
        }
    }
}

/// Budget report for one project.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    pub project_id: Uuid,
    pub has_budget: bool,
    pub allocated: Option<Decimal>,
    pub actual: Decimal,
    /// `None` when no budget is set (unbounded remaining).
    pub remaining: Option<Decimal>,
    pub pct_used: Option<Decimal>,
    pub level: BudgetLevel,
}

/// Aggregated spend for one project over a window.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectCostReport {
    pub project_id: Uuid,
    pub total_cost: Decimal,
    pub total_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub average_cost_per_job: Decimal,
}

/// Platform-wide spend over a window.
#[derive(Debug, Clone, Serialize)]
pub struct PlatformCostReport {
    pub total_cost: Decimal,
    pub total_jobs: usize,
    pub total_tokens: u64,
    pub average_cost_per_job: Decimal,
}

/// Read-side of the ledger: aggregations over job rows.
#[derive(Clone)]
pub struct CostLedger {
    store: Arc<dyn JobStore>,
    config: CostConfig,
}

impl CostLedger {
    pub fn new(store: Arc<dyn JobStore>, config: CostConfig) -> Self {
        Self { store, config }
    }

    /// Cost of a usage sample under this deployment's pricing.
    pub fn cost_of(
        &self,
        provider: &str,
        model: &str,
        tokens_in: u64,
        tokens_out: u64,
    ) -> Result<Decimal, CostError> {
        cost_of(provider, model, tokens_in, tokens_out, &self.config)
    }

    /// Aggregate spend for a project. `since` bounds the window by
    /// `completed_at`; `None` means all time (and includes jobs that never
    /// completed — their partial token spend is real money).
    pub async fn project_period(
        &self,
        project_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> Result<ProjectCostReport, StoreError> {
        let jobs = self.store.jobs_for_project(project_id).await?;
        let jobs: Vec<_> = match since {
            Some(cutoff) => jobs
                .into_iter()
                .filter(|j| j.completed_at.is_some_and(|t| t >= cutoff))
                .collect(),
            None => jobs,
        };

        let total_cost: Decimal = jobs.iter().map(|j| j.actual_cost).sum();
        let total_jobs = jobs.len();
        let completed_jobs = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Completed)
            .count();
        let failed_jobs = jobs
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Failed | JobStatus::DeadLetter))
            .count();
        let average = if total_jobs > 0 {
            total_cost / Decimal::from(total_jobs as u64)
        } else {
            Decimal::ZERO
        };

        Ok(ProjectCostReport {
            project_id,
            total_cost: total_cost.round_dp(2),
            total_jobs,
            completed_jobs,
            failed_jobs,
            average_cost_per_job: average.round_dp(2),
        })
    }

    /// Unrounded total spend for a project, used for budget comparisons.
    async fn project_actual(&self, project_id: Uuid) -> Result<Decimal, StoreError> {
        Ok(self
            .store
            .jobs_for_project(project_id)
            .await?
            .iter()
            .map(|j| j.actual_cost)
            .sum())
    }

    /// Classify a project's spend against its allocation.
    pub async fn budget_status(&self, project_id: Uuid) -> Result<BudgetStatus, StoreError> {
        let project = self.store.project(project_id).await?;
        let actual = self.project_actual(project_id).await?;

        let Some(allocated) = project.budget_allocated else {
            return Ok(BudgetStatus {
                project_id,
                has_budget: false,
                allocated: None,
                actual,
                remaining: None,
                pct_used: None,
                level: BudgetLevel::Ok,
            });
        };

        // An explicit zero (or negative) allocation means "block all
        // work", not "uncapped" — only an absent budget is uncapped.
        if allocated <= Decimal::ZERO {
            return Ok(BudgetStatus {
                project_id,
                has_budget: true,
                allocated: Some(allocated),
                actual,
                remaining: Some(allocated - actual),
                pct_used: None,
                level: BudgetLevel::Exceeded,
            });
        }

        let pct = actual / allocated * dec!(100);
        Ok(BudgetStatus {
            project_id,
            has_budget: true,
            allocated: Some(allocated),
            actual,
            remaining: Some(allocated - actual),
            pct_used: Some(pct),
            level: BudgetLevel::from_pct(pct),
        })
    }

    /// Whether new work for this project may start.
    pub async fn admits_new_work(&self, project_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.budget_status(project_id).await?.level != BudgetLevel::Exceeded)
    }

    /// Platform-wide report across every project.
    pub async fn platform_report(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<PlatformCostReport, StoreError> {
        let jobs = self.store.all_jobs().await?;
        let jobs: Vec<_> = match since {
            Some(cutoff) => jobs
                .into_iter()
                .filter(|j| j.completed_at.is_some_and(|t| t >= cutoff))
                .collect(),
            None => jobs,
        };

        let total_cost: Decimal = jobs.iter().map(|j| j.actual_cost).sum();
        let total_tokens: u64 = jobs.iter().map(|j| j.tokens_used_total).sum();
        let total_jobs = jobs.len();
        let average = if total_jobs > 0 {
            total_cost / Decimal::from(total_jobs as u64)
        } else {
            Decimal::ZERO
        };

        Ok(PlatformCostReport {
            total_cost: total_cost.round_dp(2),
            total_jobs,
            total_tokens,
            average_cost_per_job: average.round_dp(2),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobSubmission, JobType, MemoryStore, Project};
    use serde_json::json;

    fn ledger_with_store() -> (Arc<MemoryStore>, CostLedger) {
        let store = Arc::new(MemoryStore::new());
        let ledger = CostLedger::new(store.clone(), CostConfig::default());
        (store, ledger)
    }

    async fn seed_job(store: &MemoryStore, project_id: Uuid, cost: Decimal, complete: bool) {
        let job = Job::from_submission(
            JobSubmission {
                project_id,
                job_type: JobType::Implement,
                payload: json!({"task": "t"}),
                assigned_agent_id: None,
                max_retries: None,
            },
            3,
        );
        let id = job.id;
        store.insert_job(job).await.unwrap();
        store.mark_running(id, None).await.unwrap();
        store
            .record_attempt_usage(id, 0, 0, cost, "")
            .await
            .unwrap();
        if complete {
            store.complete(id, json!({"ok": true})).await.unwrap();
        }
    }

    #[test]
    fn cost_formula_matches_price_table() {
        let config = CostConfig::default();
        // 1,000 in + 500 out on claude-sonnet (3.00 / 15.00 per 1M):
        // 0.003 + 0.0075 = 0.0105
        let cost = cost_of("anthropic", "claude-sonnet-4-20250514", 1000, 500, &config).unwrap();
        assert_eq!(cost, dec!(0.0105));

        // Unlisted model falls back to the provider default row.
        let cost = cost_of("anthropic", "claude-mystery", 1_000_000, 0, &config).unwrap();
        assert_eq!(cost, dec!(3.00));
    }

    #[test]
    fn unknown_provider_without_default_fails() {
        let config = CostConfig::default();
        let err = cost_of("acme", "m1", 10, 10, &config).unwrap_err();
        assert!(matches!(err, CostError::PricingUnknown { .. }));

        let config = CostConfig {
            default_input_price: Some(dec!(1.00)),
            default_output_price: Some(dec!(3.00)),
        };
        let cost = cost_of("acme", "m1", 1_000_000, 1_000_000, &config).unwrap();
        assert_eq!(cost, dec!(4.00));
    }

    #[test]
    fn budget_level_boundaries_are_inclusive() {
        assert_eq!(BudgetLevel::from_pct(dec!(79.999)), BudgetLevel::Ok);
        assert_eq!(BudgetLevel::from_pct(dec!(80)), BudgetLevel::Warning);
        assert_eq!(BudgetLevel::from_pct(dec!(94.999)), BudgetLevel::Warning);
        assert_eq!(BudgetLevel::from_pct(dec!(95)), BudgetLevel::Critical);
        assert_eq!(BudgetLevel::from_pct(dec!(99.999)), BudgetLevel::Critical);
        assert_eq!(BudgetLevel::from_pct(dec!(100)), BudgetLevel::Exceeded);
        assert_eq!(BudgetLevel::from_pct(dec!(250)), BudgetLevel::Exceeded);
    }

    #[tokio::test]
    async fn budget_status_without_budget_is_ok() {
        let (store, ledger) = ledger_with_store();
        let project_id = Uuid::new_v4();
        store
            .insert_project(Project {
                id: project_id,
                name: "unbounded".into(),
                budget_allocated: None,
            })
            .await
            .unwrap();
        seed_job(&store, project_id, dec!(123.45), true).await;

        let status = ledger.budget_status(project_id).await.unwrap();
        assert!(!status.has_budget);
        assert_eq!(status.level, BudgetLevel::Ok);
        assert!(status.remaining.is_none());
        assert!(ledger.admits_new_work(project_id).await.unwrap());
    }

    #[tokio::test]
    async fn zero_budget_is_exceeded_not_uncapped() {
        let (store, ledger) = ledger_with_store();
        let project_id = Uuid::new_v4();
        store
            .insert_project(Project {
                id: project_id,
                name: "frozen".into(),
                budget_allocated: Some(Decimal::ZERO),
            })
            .await
            .unwrap();

        let status = ledger.budget_status(project_id).await.unwrap();
        assert!(status.has_budget);
        assert_eq!(status.level, BudgetLevel::Exceeded);
        assert!(!ledger.admits_new_work(project_id).await.unwrap());
    }

    #[tokio::test]
    async fn exceeded_budget_blocks_new_work() {
        let (store, ledger) = ledger_with_store();
        let project_id = Uuid::new_v4();
        store
            .insert_project(Project {
                id: project_id,
                name: "tight".into(),
                budget_allocated: Some(dec!(0.01)),
            })
            .await
            .unwrap();
        seed_job(&store, project_id, dec!(0.01), true).await;

        let status = ledger.budget_status(project_id).await.unwrap();
        assert_eq!(status.level, BudgetLevel::Exceeded);
        assert_eq!(status.remaining, Some(Decimal::ZERO));
        assert!(!ledger.admits_new_work(project_id).await.unwrap());
    }

    #[tokio::test]
    async fn failed_jobs_count_toward_project_cost() {
        let (store, ledger) = ledger_with_store();
        let project_id = Uuid::new_v4();
        store
            .insert_project(Project {
                id: project_id,
                name: "p".into(),
                budget_allocated: Some(dec!(100)),
            })
            .await
            .unwrap();

        seed_job(&store, project_id, dec!(2.00), true).await;
        // Failed job: spent partial tokens, then dead-lettered.
        let job = Job::from_submission(
            JobSubmission {
                project_id,
                job_type: JobType::Test,
                payload: json!({"task": "t"}),
                assigned_agent_id: None,
                max_retries: None,
            },
            3,
        );
        let id = job.id;
        store.insert_job(job).await.unwrap();
        store.mark_running(id, None).await.unwrap();
        store
            .record_attempt_usage(id, 0, 0, dec!(1.00), "")
            .await
            .unwrap();
        store.mark_failed(id, "boom").await.unwrap();
        store.mark_dead_letter(id, "unknown error").await.unwrap();

        let report = ledger.project_period(project_id, None).await.unwrap();
        assert_eq!(report.total_cost, dec!(3.00));
        assert_eq!(report.total_jobs, 2);
        assert_eq!(report.completed_jobs, 1);
        assert_eq!(report.failed_jobs, 1);
        assert_eq!(report.average_cost_per_job, dec!(1.50));
    }
}
