use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::future::BoxFuture;
use mod_connect_core::{
    cancel::CancelToken,
    models::RepositoryDescriptor,
    retry::{ErrorClass, RetryPolicy, RetryState},
};
use tokio::{
    sync::{Semaphore, mpsc},
    task::JoinSet,
    time::Instant,
};

/// How long in-flight tasks may keep running after cancellation.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(10);

/// Why a task attempt did not complete.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub class: ErrorClass,
    pub reason: String,
}

/// The work body, invoked once per attempt with the 1-based attempt number.
pub type TaskFn = Arc<dyn Fn(u32) -> BoxFuture<'static, Result<(), TaskFailure>> + Send + Sync>;

pub struct Task {
    /// Discovery order, carried through for deterministic reporting.
    pub index: usize,
    pub descriptor: RepositoryDescriptor,
    /// Upstream host the task talks to, for the per-host limit.
    pub host: String,
    pub work: TaskFn,
}

#[derive(Debug)]
pub enum TaskOutcome {
    Completed,
    Failed(TaskFailure),
    /// Cancelled before completion, or never dispatched.
    Aborted,
}

#[derive(Debug)]
pub struct TaskResult {
    pub index: usize,
    pub descriptor: RepositoryDescriptor,
    pub attempts: u32,
    pub duration: Duration,
    pub outcome: TaskOutcome,
}

/// Bounded-concurrency executor for repository tasks. A global semaphore
/// caps total in-flight work; per-host semaphores, created lazily, keep any
/// single upstream within its own limit independent of the global ceiling.
pub struct Scheduler {
    global: Arc<Semaphore>,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
    per_host: usize,
    policy: RetryPolicy,
    cancel: CancelToken,
    grace: Duration,
}

impl Scheduler {
    pub fn new(
        max_concurrency: usize,
        per_host: usize,
        policy: RetryPolicy,
        cancel: CancelToken,
    ) -> Self {
        Self {
            global: Arc::new(Semaphore::new(max_concurrency.max(1))),
            hosts: Mutex::new(HashMap::new()),
            per_host: per_host.max(1),
            policy,
            cancel,
            grace: DEFAULT_GRACE,
        }
    }

    #[cfg(test)]
    fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        self.hosts
            .lock()
            .unwrap()
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host)))
            .clone()
    }

    /// Execute tasks as they arrive until the channel closes. Tasks run out
    /// of order; the result set covers every task received, including those
    /// reached only after cancellation (as Aborted).
    pub async fn run(&self, mut tasks: mpsc::Receiver<Task>) -> Vec<TaskResult> {
        let mut set: JoinSet<TaskResult> = JoinSet::new();
        let mut results = Vec::new();
        loop {
            tokio::select! {
                task = tasks.recv() => match task {
                    Some(task) => {
                        if self.cancel.is_cancelled() {
                            results.push(aborted(task, 0, Duration::ZERO));
                            continue;
                        }
                        let global = self.global.clone();
                        let host = self.host_semaphore(&task.host);
                        let policy = self.policy;
                        let cancel = self.cancel.clone();
                        let grace = self.grace;
                        set.spawn(execute(task, global, host, policy, cancel, grace));
                    }
                    None => break,
                },
                Some(joined) = set.join_next(), if !set.is_empty() => {
                    match joined {
                        Ok(result) => results.push(result),
                        Err(e) => tracing::error!("Task panicked: {e:?}"),
                    }
                }
            }
        }
        // No more tasks will arrive; drain the in-flight set. Workers
        // resolve themselves under cancellation, so no hard abort is needed.
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!("Task panicked: {e:?}"),
            }
        }
        results
    }
}

fn aborted(task: Task, attempts: u32, duration: Duration) -> TaskResult {
    TaskResult {
        index: task.index,
        descriptor: task.descriptor,
        attempts,
        duration,
        outcome: TaskOutcome::Aborted,
    }
}

async fn execute(
    task: Task,
    global: Arc<Semaphore>,
    host: Arc<Semaphore>,
    policy: RetryPolicy,
    cancel: CancelToken,
    grace: Duration,
) -> TaskResult {
    let started = Instant::now();
    let mut retry = RetryState::new(policy);
    let done = |outcome: TaskOutcome, retry: &RetryState| TaskResult {
        index: task.index,
        descriptor: task.descriptor.clone(),
        attempts: retry.attempts(),
        duration: started.elapsed(),
        outcome,
    };
    loop {
        let _global = tokio::select! {
            permit = global.clone().acquire_owned() => permit.expect("semaphore closed"),
            _ = cancel.cancelled() => return done(TaskOutcome::Aborted, &retry),
        };
        let _host = tokio::select! {
            permit = host.clone().acquire_owned() => permit.expect("semaphore closed"),
            _ = cancel.cancelled() => return done(TaskOutcome::Aborted, &retry),
        };
        // A permit can be won in the same instant the run is cancelled; no
        // new attempt may start after the signal.
        if cancel.is_cancelled() {
            return done(TaskOutcome::Aborted, &retry);
        }
        let attempt = retry.begin();
        let work = (task.work)(attempt);
        // Once cancelled, the attempt gets the grace period to finish on its
        // own; afterwards it is dropped and reported as aborted.
        let result = tokio::select! {
            result = work => Some(result),
            _ = async { cancel.cancelled().await; tokio::time::sleep(grace).await } => None,
        };
        drop(_host);
        drop(_global);
        match result {
            None => return done(TaskOutcome::Aborted, &retry),
            Some(Ok(())) => return done(TaskOutcome::Completed, &retry),
            Some(Err(failure)) => {
                if failure.class == ErrorClass::Fatal {
                    tracing::error!("{}: fatal error: {}", task.descriptor.id, failure.reason);
                    cancel.cancel();
                    return done(TaskOutcome::Failed(failure), &retry);
                }
                match retry.backoff(failure.class) {
                    Some(delay) if !cancel.is_cancelled() => {
                        tracing::warn!(
                            "{}: attempt {} failed ({}), retrying in {}ms",
                            task.descriptor.id,
                            attempt,
                            failure.reason,
                            delay.as_millis()
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => return done(TaskOutcome::Aborted, &retry),
                        }
                    }
                    _ => return done(TaskOutcome::Failed(failure), &retry),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use mod_connect_core::models::{RepoId, Visibility};

    use super::*;

    fn descriptor(name: &str) -> RepositoryDescriptor {
        RepositoryDescriptor {
            id: RepoId::new("github", "org", name),
            clone_url: format!("https://github.com/org/{name}.git").parse().unwrap(),
            default_branch: None,
            visibility: Visibility::Public,
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn task(index: usize, host: &str, work: TaskFn) -> Task {
        Task { index, descriptor: descriptor(&format!("repo-{index}")), host: host.to_string(), work }
    }

    /// Tracks the peak number of concurrently running bodies.
    #[derive(Default)]
    struct InFlight {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl InFlight {
        fn enter(&self) {
            let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);
        }

        fn exit(&self) { self.current.fetch_sub(1, Ordering::SeqCst); }
    }

    fn counting_task(index: usize, host: &str, in_flight: Arc<InFlight>) -> Task {
        task(
            index,
            host,
            Arc::new(move |_| {
                let in_flight = in_flight.clone();
                Box::pin(async move {
                    in_flight.enter();
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.exit();
                    Ok(())
                })
            }),
        )
    }

    async fn run_tasks(scheduler: Scheduler, tasks: Vec<Task>) -> Vec<TaskResult> {
        let (tx, rx) = mpsc::channel(tasks.len().max(1));
        for task in tasks {
            tx.send(task).await.unwrap();
        }
        drop(tx);
        scheduler.run(rx).await
    }

    #[tokio::test]
    async fn global_concurrency_is_bounded() {
        let in_flight = Arc::new(InFlight::default());
        let tasks: Vec<Task> =
            (0..40).map(|i| counting_task(i, "host-a", in_flight.clone())).collect();
        let scheduler = Scheduler::new(5, 100, fast_policy(), CancelToken::new());
        let results = run_tasks(scheduler, tasks).await;

        assert_eq!(results.len(), 40);
        assert!(results.iter().all(|r| matches!(r.outcome, TaskOutcome::Completed)));
        assert!(in_flight.peak.load(Ordering::SeqCst) <= 5);
    }

    #[tokio::test]
    async fn per_host_limit_is_independent_of_global() {
        let host_a = Arc::new(InFlight::default());
        let host_b = Arc::new(InFlight::default());
        let mut tasks = Vec::new();
        for i in 0..8 {
            let tracker = if i % 2 == 0 { host_a.clone() } else { host_b.clone() };
            let host = if i % 2 == 0 { "host-a" } else { "host-b" };
            tasks.push(counting_task(i, host, tracker));
        }
        let scheduler = Scheduler::new(8, 1, fast_policy(), CancelToken::new());
        let results = run_tasks(scheduler, tasks).await;

        assert_eq!(results.len(), 8);
        assert_eq!(host_a.peak.load(Ordering::SeqCst), 1);
        assert_eq!(host_b.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_failures_succeed_with_recorded_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let work: TaskFn = {
            let calls = calls.clone();
            Arc::new(move |_| {
                let calls = calls.clone();
                Box::pin(async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TaskFailure {
                            class: ErrorClass::Retryable,
                            reason: "transient".to_string(),
                        })
                    } else {
                        Ok(())
                    }
                })
            })
        };
        let scheduler = Scheduler::new(2, 2, fast_policy(), CancelToken::new());
        let results = run_tasks(scheduler, vec![task(0, "host", work)]).await;

        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].outcome, TaskOutcome::Completed));
        assert_eq!(results[0].attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_failures_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let work: TaskFn = {
            let calls = calls.clone();
            Arc::new(move |_| {
                let calls = calls.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TaskFailure { class: ErrorClass::Terminal, reason: "rejected".to_string() })
                })
            })
        };
        let scheduler = Scheduler::new(2, 2, fast_policy(), CancelToken::new());
        let results = run_tasks(scheduler, vec![task(0, "host", work)]).await;

        assert!(matches!(&results[0].outcome, TaskOutcome::Failed(f) if f.reason == "rejected"));
        assert_eq!(results[0].attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_dispatch_and_aborts_pending() {
        let cancel = CancelToken::new();
        let started = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for i in 0..22 {
            let started = started.clone();
            tasks.push(task(
                i,
                "host",
                Arc::new(move |_| {
                    let started = started.clone();
                    Box::pin(async move {
                        started.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(())
                    })
                }),
            ));
        }
        let scheduler = Scheduler::new(2, 2, fast_policy(), cancel.clone())
            .with_grace(Duration::from_secs(1));
        let (tx, rx) = mpsc::channel(tasks.len());
        for task in tasks {
            tx.send(task).await.unwrap();
        }
        drop(tx);

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                cancel.cancel();
            })
        };
        let results = scheduler.run(rx).await;
        canceller.await.unwrap();

        assert_eq!(results.len(), 22);
        let completed =
            results.iter().filter(|r| matches!(r.outcome, TaskOutcome::Completed)).count();
        let aborted =
            results.iter().filter(|r| matches!(r.outcome, TaskOutcome::Aborted)).count();
        // The two in-flight tasks finish within the grace period; nothing
        // else ever starts.
        assert_eq!(completed, 2);
        assert_eq!(aborted, 20);
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }
}
