// Job Scheduler - Central scheduler for background jobs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{error, info};
use uuid::Uuid;

use super::sequence_poller::{PollResult, SequencePollerJob};
use crate::config::SequenceConfig;
use crate::sequences::SequenceError;

pub const SEQUENCE_POLLER: &str = "sequence_poller";

const MAX_EXECUTION_LOGS: usize = 100;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Sequence error: {0}")]
    SequenceError(#[from] SequenceError),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionLog {
    pub id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub items_processed: i32,
    pub errors: Vec<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Completed,
    Failed,
    PartialFailure,
}

pub type ExecutionLogs = Arc<RwLock<Vec<JobExecutionLog>>>;

pub struct JobScheduler {
    scheduler: TokioScheduler,
    poller: Arc<SequencePollerJob>,
    config: SequenceConfig,
    execution_logs: ExecutionLogs,
}

impl JobScheduler {
    pub async fn new(
        poller: Arc<SequencePollerJob>,
        config: SequenceConfig,
        execution_logs: ExecutionLogs,
    ) -> JobResult<Self> {
        config
            .validate()
            .map_err(|e| JobError::ConfigError(e.to_string()))?;
        let scheduler = TokioScheduler::new().await?;

        Ok(Self {
            scheduler,
            poller,
            config,
            execution_logs,
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting background job scheduler");

        if self.config.poller_enabled {
            self.schedule_sequence_poller().await?;
        } else {
            info!("Sequence poller is disabled, skipping schedule");
        }

        self.scheduler.start().await?;

        info!("Background job scheduler started successfully");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> JobResult<()> {
        info!("Shutting down background job scheduler");
        self.scheduler.shutdown().await?;
        Ok(())
    }

    async fn schedule_sequence_poller(&self) -> JobResult<()> {
        let interval = self.config.poll_interval_minutes;
        let cron_expr = format!("0 */{} * * * *", interval); // Every N minutes

        let poller = self.poller.clone();
        let logs = self.execution_logs.clone();

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let poller = poller.clone();
            let logs = logs.clone();

            Box::pin(async move {
                // Failures are already logged and recorded
                let _ = run_poller(&poller, &logs).await;
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled sequence poller to run every {} minutes", interval);

        Ok(())
    }
}

/// Run a named job outside its schedule and record the execution.
pub async fn run_job_now(job_name: &str, poller: &SequencePollerJob, logs: &ExecutionLogs) -> JobResult<JobExecutionLog> {
    match job_name {
        SEQUENCE_POLLER => run_poller(poller, logs).await,
        _ => Err(JobError::ConfigError(format!("Unknown job: {}", job_name))),
    }
}

async fn run_poller(poller: &SequencePollerJob, logs: &ExecutionLogs) -> JobResult<JobExecutionLog> {
    let started_at = Utc::now();
    info!("Running sequence poller job");

    let outcome = poller.run().await;
    let completed_at = Utc::now();

    let mut log = JobExecutionLog {
        id: Uuid::new_v4(),
        job_name: SEQUENCE_POLLER.to_string(),
        started_at,
        completed_at: Some(completed_at),
        status: JobStatus::Completed,
        items_processed: 0,
        errors: Vec::new(),
        duration_ms: Some((completed_at - started_at).num_milliseconds()),
    };

    let result = match outcome {
        Ok(PollResult { processed, errors, .. }) => {
            if !errors.is_empty() {
                log.status = JobStatus::PartialFailure;
            }
            log.items_processed = processed;
            log.errors = errors;
            Ok(log.clone())
        }
        Err(e) => {
            error!("Sequence poller failed: {}", e);
            log.status = JobStatus::Failed;
            log.errors = vec![e.to_string()];
            Err(e)
        }
    };

    record(logs, log).await;
    result
}

async fn record(logs: &ExecutionLogs, log: JobExecutionLog) {
    let mut logs = logs.write().await;
    logs.push(log);
    // Keep only the most recent logs
    if logs.len() > MAX_EXECUTION_LOGS {
        logs.remove(0);
    }
}
