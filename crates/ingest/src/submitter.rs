use std::sync::Arc;

use mod_connect_core::{
    cancel::CancelToken,
    models::SubmissionUnit,
    retry::{RetryPolicy, RetryState},
};
use tokio::sync::{mpsc, oneshot};

use crate::{IngestError, IngestSink, UnitAck};

struct Pending {
    unit: SubmissionUnit,
    ack: oneshot::Sender<Result<UnitAck, IngestError>>,
}

/// Hands units to a background loop that coalesces whatever is ready into
/// batches, so concurrent tasks share outbound calls without waiting on each
/// other. Dropping the last handle stops the loop once the queue drains.
#[derive(Clone)]
pub struct Submitter {
    tx: mpsc::Sender<Pending>,
}

impl Submitter {
    pub fn spawn(
        sink: Arc<dyn IngestSink>,
        batch_size: usize,
        policy: RetryPolicy,
        cancel: CancelToken,
    ) -> Self {
        let batch_size = batch_size.max(1);
        let (tx, rx) = mpsc::channel(batch_size * 4);
        tokio::spawn(run_loop(sink, batch_size, policy, cancel, rx));
        Self { tx }
    }

    /// Submit one unit and wait for its ack. The returned error is final:
    /// transient failures have already been retried by the loop.
    pub async fn submit(&self, unit: SubmissionUnit) -> Result<UnitAck, IngestError> {
        let (ack, response) = oneshot::channel();
        self.tx
            .send(Pending { unit, ack })
            .await
            .map_err(|_| IngestError::Other("submitter stopped".to_string()))?;
        response.await.map_err(|_| IngestError::Other("submission abandoned".to_string()))?
    }
}

async fn run_loop(
    sink: Arc<dyn IngestSink>,
    batch_size: usize,
    policy: RetryPolicy,
    cancel: CancelToken,
    mut rx: mpsc::Receiver<Pending>,
) {
    // Runs until every handle is dropped and the queue drains: in-flight
    // tasks may still submit after cancellation, within their grace period.
    // Cancellation only cuts retry backoffs short (see flush).
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(pending) => batch.push(pending),
                Err(_) => break,
            }
        }
        flush(sink.as_ref(), policy, &cancel, batch).await;
    }
}

/// Submit one batch, retrying call-level failures with backoff. Every unit
/// is acked exactly once.
async fn flush(sink: &dyn IngestSink, policy: RetryPolicy, cancel: &CancelToken, batch: Vec<Pending>) {
    let mut retry = RetryState::new(policy);
    loop {
        let attempt = retry.begin();
        let units: Vec<SubmissionUnit> = batch
            .iter()
            .map(|pending| {
                let mut unit = pending.unit.clone();
                unit.attempt = attempt;
                unit
            })
            .collect();
        match sink.submit(&units).await {
            Ok(acks) => {
                for pending in batch {
                    let result = acks
                        .iter()
                        .find(|ack| ack.matches(&pending.unit))
                        .cloned()
                        .ok_or_else(|| {
                            IngestError::Other(format!(
                                "no ack for {}@{}",
                                pending.unit.descriptor.id, pending.unit.revision
                            ))
                        });
                    let _ = pending.ack.send(result);
                }
                return;
            }
            Err(err) => match retry.backoff(err.class()) {
                Some(delay) if !cancel.is_cancelled() => {
                    tracing::warn!(
                        "Submission attempt {} failed ({}), retrying in {}ms",
                        attempt,
                        err,
                        delay.as_millis()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            fail_all(batch, IngestError::Other("run cancelled".to_string()));
                            return;
                        }
                    }
                }
                _ => {
                    tracing::error!(
                        "Giving up on batch of {} after {} attempts: {}",
                        batch.len(),
                        attempt,
                        err
                    );
                    fail_all(batch, err);
                    return;
                }
            },
        }
    }
}

fn fail_all(batch: Vec<Pending>, err: IngestError) {
    for pending in batch {
        let _ = pending.ack.send(Err(err.clone()));
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::Mutex,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use mod_connect_core::models::{RepoId, RepositoryDescriptor, Visibility};

    use super::*;
    use crate::AckStatus;

    fn unit(name: &str) -> SubmissionUnit {
        SubmissionUnit {
            descriptor: RepositoryDescriptor {
                id: RepoId::new("github", "org", name),
                clone_url: format!("https://github.com/org/{name}.git").parse().unwrap(),
                default_branch: Some("main".to_string()),
                visibility: Visibility::Public,
            },
            revision: format!("{name}-rev"),
            payload: serde_json::json!({}),
            attempt: 0,
        }
    }

    fn accept(unit: &SubmissionUnit) -> UnitAck {
        UnitAck {
            provider: unit.descriptor.id.provider.clone(),
            organization: unit.descriptor.id.organization.clone(),
            name: unit.descriptor.id.name.clone(),
            revision: unit.revision.clone(),
            status: AckStatus::Accepted,
            reason: None,
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    /// Fails the first `failures` calls with the given error, then accepts.
    struct FlakySink {
        failures: usize,
        error: IngestError,
        calls: AtomicUsize,
        last_attempt: AtomicUsize,
    }

    impl FlakySink {
        fn new(failures: usize, error: IngestError) -> Self {
            Self { failures, error, calls: AtomicUsize::new(0), last_attempt: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl IngestSink for FlakySink {
        fn host(&self) -> &str { "ingest.example.com" }

        async fn submit(&self, units: &[SubmissionUnit]) -> Result<Vec<UnitAck>, IngestError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.last_attempt.store(units[0].attempt as usize, Ordering::SeqCst);
            if call <= self.failures {
                return Err(self.error.clone());
            }
            Ok(units.iter().map(accept).collect())
        }
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let sink = Arc::new(FlakySink::new(2, IngestError::Transient("503".to_string())));
        let submitter =
            Submitter::spawn(sink.clone(), 1, fast_policy(), CancelToken::new());
        let ack = submitter.submit(unit("repo")).await.unwrap();
        assert_eq!(ack.status, AckStatus::Accepted);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sink.last_attempt.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejected_calls_are_not_retried() {
        let sink = Arc::new(FlakySink::new(usize::MAX, IngestError::Rejected("bad".to_string())));
        let submitter =
            Submitter::spawn(sink.clone(), 1, fast_policy(), CancelToken::new());
        let err = submitter.submit(unit("repo")).await.unwrap_err();
        assert!(matches!(err, IngestError::Rejected(_)));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_is_retried_once() {
        let sink = Arc::new(FlakySink::new(usize::MAX, IngestError::Timeout));
        let submitter =
            Submitter::spawn(sink.clone(), 1, fast_policy(), CancelToken::new());
        let err = submitter.submit(unit("repo")).await.unwrap_err();
        assert!(matches!(err, IngestError::Timeout));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    }

    /// Records every batch it sees and acks each unit.
    struct RecordingSink {
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl IngestSink for RecordingSink {
        fn host(&self) -> &str { "ingest.example.com" }

        async fn submit(&self, units: &[SubmissionUnit]) -> Result<Vec<UnitAck>, IngestError> {
            self.batches.lock().unwrap().push(units.len());
            Ok(units.iter().map(accept).collect())
        }
    }

    #[tokio::test]
    async fn ready_units_are_coalesced_into_one_call() {
        let sink = Arc::new(RecordingSink { batches: Mutex::new(Vec::new()) });
        let (tx, rx) = mpsc::channel(8);
        let mut responses = Vec::new();
        for name in ["a", "b", "c"] {
            let (ack, response) = oneshot::channel();
            tx.send(Pending { unit: unit(name), ack }).await.unwrap();
            responses.push(response);
        }
        drop(tx);
        run_loop(sink.clone(), 10, fast_policy(), CancelToken::new(), rx).await;

        assert_eq!(*sink.batches.lock().unwrap(), vec![3]);
        for (response, name) in responses.into_iter().zip(["a", "b", "c"]) {
            let ack = response.await.unwrap().unwrap();
            assert_eq!(ack.name, name);
            assert_eq!(ack.revision, format!("{name}-rev"));
        }
    }

    /// Persists units, then reports a timeout for the first call; duplicate
    /// (identity, revision) pairs on later calls are acked as accepted
    /// without creating a second record.
    struct DedupingSink {
        records: Mutex<HashSet<(RepoId, String)>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl IngestSink for DedupingSink {
        fn host(&self) -> &str { "ingest.example.com" }

        async fn submit(&self, units: &[SubmissionUnit]) -> Result<Vec<UnitAck>, IngestError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let mut records = self.records.lock().unwrap();
            for unit in units {
                records.insert((unit.descriptor.id.clone(), unit.revision.clone()));
            }
            if call == 1 {
                // The remote persisted the batch but the response was lost.
                return Err(IngestError::Timeout);
            }
            Ok(units.iter().map(accept).collect())
        }
    }

    #[tokio::test]
    async fn retried_submission_does_not_duplicate_remote_records() {
        let sink = Arc::new(DedupingSink {
            records: Mutex::new(HashSet::new()),
            calls: AtomicUsize::new(0),
        });
        let submitter =
            Submitter::spawn(sink.clone(), 1, fast_policy(), CancelToken::new());
        let ack = submitter.submit(unit("repo")).await.unwrap();
        assert_eq!(ack.status, AckStatus::Accepted);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
        assert_eq!(sink.records.lock().unwrap().len(), 1);
    }
}
