pub mod scheduler;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use mod_connect_cache::WorkspaceSync;
use mod_connect_core::{
    cancel::CancelToken,
    config::LimitsConfig,
    models::{RepoId, RepositoryDescriptor, SubmissionUnit},
    report::{RunOutcome, RunReport, RunStatus},
    retry::{ErrorClass, RetryPolicy, RetryState},
};
use mod_connect_ingest::{AckStatus, IngestSink, Submitter};
use mod_connect_provider::{PageToken, ProviderError, SourceProvider};
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::scheduler::{Scheduler, Task, TaskFailure, TaskFn, TaskOutcome, TaskResult};

/// One provider plus the organizations to enumerate through it.
pub struct DiscoverySource {
    pub provider: Arc<dyn SourceProvider>,
    pub organizations: Vec<String>,
}

/// Lifecycle of one run. Streaming overlaps the middle states per
/// repository; the coordinator tracks the coarse position for logging and
/// abort handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Discovering,
    Syncing,
    Submitting,
    Reporting,
    Done,
    Aborted,
}

/// Orchestrates discovery -> clone/update -> submit and aggregates one
/// outcome per discovered repository identity. Single writer of the run
/// report.
pub struct Pipeline {
    sources: Vec<DiscoverySource>,
    cache: Arc<dyn WorkspaceSync>,
    sink: Arc<dyn IngestSink>,
    max_concurrency: usize,
    per_host: usize,
    batch_size: usize,
    policy: RetryPolicy,
    cancel: CancelToken,
}

impl Pipeline {
    pub fn new(
        sources: Vec<DiscoverySource>,
        cache: Arc<dyn WorkspaceSync>,
        sink: Arc<dyn IngestSink>,
        limits: &LimitsConfig,
        batch_size: usize,
        cancel: CancelToken,
    ) -> Self {
        Self {
            sources,
            cache,
            sink,
            max_concurrency: limits.max_concurrency,
            per_host: limits.per_host,
            batch_size,
            policy: limits.retry.policy(),
            cancel,
        }
    }

    /// Run to completion. `Err` means the run was cut short by a fatal error
    /// with no single-repository context (e.g. bad credentials during
    /// discovery); partial failures land in the report instead.
    pub async fn execute(&self) -> Result<RunReport> {
        let started = OffsetDateTime::now_utc();
        let mut state = RunState::Discovering;
        tracing::debug!("Run state: {state:?}");

        let scheduler = Arc::new(Scheduler::new(
            self.max_concurrency,
            self.per_host,
            self.policy,
            self.cancel.clone(),
        ));
        let (task_tx, task_rx) = mpsc::channel::<Task>(self.max_concurrency.max(1) * 2);
        let scheduler_handle = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run(task_rx).await })
        };
        let submitter = Submitter::spawn(
            self.sink.clone(),
            self.batch_size,
            self.policy,
            self.cancel.clone(),
        );

        let mut seen: HashSet<RepoId> = HashSet::new();
        let mut outcomes: Vec<RunOutcome> = Vec::new();
        let mut dispatched: HashMap<usize, RepositoryDescriptor> = HashMap::new();
        let mut index = 0usize;
        let mut fatal: Option<anyhow::Error> = None;

        'discovery: for source in &self.sources {
            for organization in &source.organizations {
                let provider = source.provider.as_ref();
                let mut token: Option<PageToken> = None;
                let mut retry = RetryState::new(self.policy);
                loop {
                    if self.cancel.is_cancelled() {
                        break 'discovery;
                    }
                    let page = match provider.list_page(organization, token.as_ref()).await {
                        Ok(page) => page,
                        Err(ProviderError::NotFound(_)) => {
                            tracing::warn!(
                                "Organization {organization} not found on {}, skipping",
                                provider.name()
                            );
                            break;
                        }
                        Err(err) if err.class() == ErrorClass::Retryable => {
                            retry.begin();
                            match retry.backoff(ErrorClass::Retryable) {
                                Some(delay) => {
                                    tracing::warn!(
                                        "Listing {organization} on {} failed ({err}), \
                                         retrying in {}ms",
                                        provider.name(),
                                        delay.as_millis()
                                    );
                                    tokio::select! {
                                        _ = tokio::time::sleep(delay) => continue,
                                        _ = self.cancel.cancelled() => break 'discovery,
                                    }
                                }
                                None => {
                                    fatal = Some(anyhow!(err).context(format!(
                                        "Listing {organization} failed after {} attempts",
                                        retry.attempts()
                                    )));
                                    self.cancel.cancel();
                                    break 'discovery;
                                }
                            }
                        }
                        Err(err) => {
                            fatal = Some(anyhow!(err).context(format!(
                                "Discovery aborted while listing {organization} on {}",
                                provider.name()
                            )));
                            self.cancel.cancel();
                            break 'discovery;
                        }
                    };
                    retry = RetryState::new(self.policy);

                    for (descriptor, reason) in page.skipped {
                        if !seen.insert(descriptor.id.clone()) {
                            continue;
                        }
                        tracing::info!("Skipping {}: {reason}", descriptor.id);
                        outcomes.push(RunOutcome {
                            index,
                            repository: descriptor,
                            status: RunStatus::Skipped,
                            reason: Some(reason),
                            attempts: 0,
                            duration_ms: 0,
                        });
                        index += 1;
                    }
                    for descriptor in page.repositories {
                        if !seen.insert(descriptor.id.clone()) {
                            tracing::debug!("Duplicate descriptor for {}, ignoring", descriptor.id);
                            continue;
                        }
                        if state == RunState::Discovering {
                            state = RunState::Syncing;
                            tracing::debug!("Run state: {state:?}");
                        }
                        let task = self.make_task(index, descriptor.clone(), &submitter);
                        dispatched.insert(index, descriptor);
                        index += 1;
                        if task_tx.send(task).await.is_err() {
                            break 'discovery;
                        }
                    }

                    match page.next {
                        Some(next) => token = Some(next),
                        None => break,
                    }
                }
            }
        }
        drop(task_tx);

        state = RunState::Submitting;
        tracing::debug!("Run state: {state:?}");
        let results = scheduler_handle.await.context("Scheduler task failed")?;

        state = RunState::Reporting;
        tracing::debug!("Run state: {state:?}");
        for result in results {
            dispatched.remove(&result.index);
            outcomes.push(outcome_from(result));
        }
        // Tasks lost to a panic still owe the report an outcome.
        for (index, descriptor) in dispatched {
            outcomes.push(RunOutcome {
                index,
                repository: descriptor,
                status: RunStatus::Failed,
                reason: Some("task terminated unexpectedly".to_string()),
                attempts: 0,
                duration_ms: 0,
            });
        }

        if let Some(fatal) = fatal {
            return Err(fatal);
        }

        let aborted = self.cancel.is_cancelled();
        let report = RunReport::new(started, OffsetDateTime::now_utc(), aborted, outcomes);
        state = if aborted { RunState::Aborted } else { RunState::Done };
        tracing::debug!("Run state: {state:?}");
        tracing::info!(
            "Run finished: {} succeeded, {} skipped, {} failed, {} aborted",
            report.totals.success,
            report.totals.skipped,
            report.totals.failed,
            report.totals.aborted
        );
        Ok(report)
    }

    /// Per-repository work: sync the working copy, then hand the unit to the
    /// submitter and wait for its ack. Sync failures carry their own class
    /// for the scheduler's retry loop; submission failures arrive here
    /// already retried, so they are terminal.
    fn make_task(
        &self,
        index: usize,
        descriptor: RepositoryDescriptor,
        submitter: &Submitter,
    ) -> Task {
        let host = descriptor
            .clone_url
            .host_str()
            .unwrap_or_else(|| descriptor.id.provider.as_str())
            .to_string();
        let work: TaskFn = {
            let cache = self.cache.clone();
            let submitter = submitter.clone();
            let descriptor = descriptor.clone();
            Arc::new(move |_attempt| {
                let cache = cache.clone();
                let submitter = submitter.clone();
                let descriptor = descriptor.clone();
                Box::pin(async move {
                    let copy = cache
                        .sync(&descriptor)
                        .await
                        .map_err(|e| TaskFailure { class: e.class(), reason: e.to_string() })?;
                    let unit = SubmissionUnit::from_working_copy(&copy);
                    let ack = submitter.submit(unit).await.map_err(|e| TaskFailure {
                        class: ErrorClass::Terminal,
                        reason: e.to_string(),
                    })?;
                    match ack.status {
                        AckStatus::Accepted => Ok(()),
                        AckStatus::Rejected => Err(TaskFailure {
                            class: ErrorClass::Terminal,
                            reason: format!(
                                "rejected by ingestion API: {}",
                                ack.reason.unwrap_or_else(|| "no reason given".to_string())
                            ),
                        }),
                    }
                })
            })
        };
        Task { index, descriptor, host, work }
    }
}

fn outcome_from(result: TaskResult) -> RunOutcome {
    let (status, reason) = match result.outcome {
        TaskOutcome::Completed => (RunStatus::Success, None),
        TaskOutcome::Failed(failure) => (RunStatus::Failed, Some(failure.reason)),
        TaskOutcome::Aborted => {
            (RunStatus::Aborted, Some("run cancelled before completion".to_string()))
        }
    };
    RunOutcome {
        index: result.index,
        repository: result.descriptor,
        status,
        reason,
        attempts: result.attempts,
        duration_ms: result.duration.as_millis() as u64,
    }
}
