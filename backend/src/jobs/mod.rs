// Background Jobs Service
//
// This module provides scheduled background jobs for the CRM backend.
// Jobs are scheduled using tokio-cron-scheduler and run automatically at specified intervals.

pub mod scheduler;
pub mod sequence_poller;

pub use scheduler::{run_job_now, ExecutionLogs, JobError, JobExecutionLog, JobScheduler, JobStatus};
pub use sequence_poller::SequencePollerJob;
