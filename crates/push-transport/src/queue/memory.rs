//! 进程内任务队列
//!
//! 每个注册的队列由一个 worker 循环驱动：先取信号量许可，再取下一个任务，
//! 任务在独立 task 中执行，完成后释放许可。关闭时 worker 不再取新任务，
//! 等待已派发的任务全部结束。
//!
//! 已结束的任务按 `RetentionPolicy` 保留，超出上限时淘汰最早结束的。

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::join_all;
use parking_lot::Mutex;
use push_shared::observability::metrics;
use push_shared::retry::RetryPolicy;
use tokio::sync::{Notify, Semaphore, broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::{
    DeliveryJob, JobCounts, JobEvent, JobHandler, JobId, JobQueue, JobState, RetentionPolicy,
};
use crate::error::{DeliveryError, QueueError};
use crate::message::Message;

const EVENT_CAPACITY: usize = 1024;

/// 进程内任务队列
#[derive(Clone)]
pub struct InMemoryJobQueue {
    inner: Arc<Inner>,
}

struct Inner {
    pending: Mutex<HashMap<String, VecDeque<JobId>>>,
    jobs: DashMap<JobId, DeliveryJob>,
    job_available: Notify,
    shutdown_tx: watch::Sender<bool>,
    consumers: Mutex<HashSet<String>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<JobEvent>,
    /// 按队列统计的在途任务数
    in_flight: DashMap<String, usize>,
    /// 已结束任务，按结束先后排列
    finished: Mutex<VecDeque<JobId>>,
    retry: RetryPolicy,
    retention: RetentionPolicy,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl InMemoryJobQueue {
    pub fn new(retry: RetryPolicy) -> Self {
        Self::with_retention(retry, RetentionPolicy::default())
    }

    pub fn with_retention(retry: RetryPolicy, retention: RetentionPolicy) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashMap::new()),
                jobs: DashMap::new(),
                job_available: Notify::new(),
                shutdown_tx,
                consumers: Mutex::new(HashSet::new()),
                workers: Mutex::new(Vec::new()),
                events,
                in_flight: DashMap::new(),
                finished: Mutex::new(VecDeque::new()),
                retry,
                retention,
            }),
        }
    }

    /// 订阅任务事件
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// 查询任务快照
    pub fn job(&self, id: JobId) -> Option<DeliveryJob> {
        self.inner.jobs.get(&id).map(|job| job.clone())
    }

    /// 当前保留的任务总数（含已结束）
    pub fn retained(&self) -> usize {
        self.inner.jobs.len()
    }

    /// 指定队列正在执行的任务数
    pub fn in_flight(&self, queue: &str) -> usize {
        self.inner.in_flight.get(queue).map_or(0, |count| *count)
    }

    pub fn counts(&self) -> JobCounts {
        let mut counts = JobCounts::default();
        for job in self.inner.jobs.iter() {
            match job.state {
                JobState::Queued => counts.queued += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Delayed => counts.delayed += 1,
            }
        }
        counts
    }
}

impl Inner {
    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn emit(&self, event: JobEvent) {
        // 没有订阅者时发送失败，忽略即可
        let _ = self.events.send(event);
    }

    fn push_pending(&self, queue: &str, id: JobId) {
        self.pending
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push_back(id);
        self.job_available.notify_waiters();
    }

    fn pop_pending(&self, queue: &str) -> Option<JobId> {
        self.pending.lock().get_mut(queue).and_then(VecDeque::pop_front)
    }

    /// 等待队列中出现下一个任务
    async fn next_job(&self, queue: &str) -> JobId {
        loop {
            let notified = self.job_available.notified();
            tokio::pin!(notified);
            // 先登记再检查，避免错过检查与等待之间的通知
            notified.as_mut().enable();

            if let Some(id) = self.pop_pending(queue) {
                return id;
            }
            notified.await;
        }
    }

    fn update_in_flight(&self, queue: &str, delta: isize) {
        let current = {
            let mut count = self.in_flight.entry(queue.to_string()).or_insert(0);
            *count = count.saturating_add_signed(delta);
            *count
        };
        metrics::set_jobs_in_flight(queue, current);
    }

    /// 关闭超时后被中止的任务不会再递减计数，统一清零
    fn reset_in_flight(&self) {
        for mut count in self.in_flight.iter_mut() {
            *count.value_mut() = 0;
            metrics::set_jobs_in_flight(count.key(), 0);
        }
    }

    /// 任务进入终态后按保留策略登记或移除，在发出终态事件之前调用
    ///
    /// 调用时不能持有该任务在 `jobs` 中的引用。
    fn retire(&self, id: JobId, completed: bool) {
        if completed && self.retention.remove_on_complete {
            self.jobs.remove(&id);
            return;
        }

        let evicted: Vec<JobId> = {
            let mut finished = self.finished.lock();
            finished.push_back(id);
            let excess = finished.len().saturating_sub(self.retention.max_finished);
            finished.drain(..excess).collect()
        };
        for old in evicted {
            self.jobs.remove(&old);
        }
    }

    /// 执行一个任务并记录结果
    async fn execute(self: &Arc<Self>, queue: &str, id: JobId, handler: Arc<dyn JobHandler>) {
        let snapshot = {
            let Some(mut job) = self.jobs.get_mut(&id) else {
                warn!(job_id = %id, "任务不存在，跳过");
                return;
            };
            job.attempts += 1;
            job.transition(JobState::Active);
            job.clone()
        };

        self.emit(JobEvent::Started {
            id,
            attempt: snapshot.attempts,
        });
        self.update_in_flight(queue, 1);

        let outcome = AssertUnwindSafe(handler.handle(&snapshot))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!(job_id = %id, "任务处理函数 panic");
                Err(DeliveryError::Unknown {
                    message: "job handler panicked".to_string(),
                })
            });

        self.update_in_flight(queue, -1);

        match outcome {
            Ok(result) => {
                // 关闭超时时任务可能已被标记为放弃
                let recorded = match self.jobs.get_mut(&id) {
                    Some(mut job) if job.state == JobState::Active => {
                        job.result = Some(result.clone());
                        job.last_error = None;
                        job.transition(JobState::Completed);
                        true
                    }
                    _ => false,
                };
                if !recorded {
                    return;
                }
                debug!(job_id = %id, queue, "任务完成");
                metrics::record_queue_job(queue, "completed");
                self.retire(id, true);
                self.emit(JobEvent::Completed { id, result });
            }
            Err(error) => self.fail_or_retry(queue, id, snapshot.attempts, error),
        }
    }

    fn fail_or_retry(
        self: &Arc<Self>,
        queue: &str,
        id: JobId,
        attempts: u32,
        error: DeliveryError,
    ) {
        let retry =
            attempts > 0 && self.retry.should_retry(attempts - 1) && !self.is_shutting_down();

        let recorded = match self.jobs.get_mut(&id) {
            Some(mut job) if job.state == JobState::Active => {
                job.last_error = Some(error.clone());
                job.transition(if retry {
                    JobState::Delayed
                } else {
                    JobState::Failed
                });
                true
            }
            _ => false,
        };
        if !recorded {
            return;
        }

        if !retry {
            warn!(job_id = %id, queue, attempts, error = %error, "任务失败");
            metrics::record_queue_job(queue, "failed");
            self.retire(id, false);
            self.emit(JobEvent::Failed { id, error });
            return;
        }

        let delay = self.retry.delay_for_attempt(attempts - 1);
        info!(
            job_id = %id,
            queue,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "任务失败，退避后重试"
        );
        metrics::record_queue_job(queue, "retrying");
        self.emit(JobEvent::Retrying {
            id,
            attempt: attempts,
            delay,
        });

        let inner = Arc::clone(self);
        let queue = queue.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.is_shutting_down() {
                return;
            }
            if let Some(mut job) = inner.jobs.get_mut(&id) {
                job.transition(JobState::Queued);
            }
            inner.push_pending(&queue, id);
        });
    }

    /// 关闭超时后仍在执行的任务一律标记为失败，返回被放弃的任务数
    fn fail_abandoned(&self) -> usize {
        let error = DeliveryError::Unknown {
            message: "abandoned at shutdown".to_string(),
        };

        let mut abandoned = Vec::new();
        for mut job in self.jobs.iter_mut() {
            if job.state == JobState::Active {
                job.last_error = Some(error.clone());
                job.transition(JobState::Failed);
                abandoned.push((job.id, job.queue_name.clone()));
            }
        }

        for (id, queue) in &abandoned {
            warn!(job_id = %id, queue = %queue, "关闭超时，任务被放弃");
            metrics::record_queue_job(queue, "failed");
            self.retire(*id, false);
            self.emit(JobEvent::Failed {
                id: *id,
                error: error.clone(),
            });
        }
        abandoned.len()
    }
}

/// 关闭信号到达时返回
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        let stopping = *rx.borrow_and_update();
        if stopping || rx.changed().await.is_err() {
            return;
        }
    }
}

async fn run_worker(
    inner: Arc<Inner>,
    queue: String,
    concurrency: usize,
    handler: Arc<dyn JobHandler>,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    let mut running = JoinSet::new();

    info!(queue = %queue, concurrency, "队列消费者已启动");

    loop {
        while running.try_join_next().is_some() {}

        let permit = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown_rx) => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let id = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown_rx) => break,
            id = inner.next_job(&queue) => id,
        };

        let inner = Arc::clone(&inner);
        let handler = Arc::clone(&handler);
        let queue = queue.clone();
        running.spawn(async move {
            let _permit = permit;
            inner.execute(&queue, id, handler).await;
        });
    }

    debug!(queue = %queue, in_flight = running.len(), "消费者停止取任务，等待在途任务");
    while running.join_next().await.is_some() {}
    info!(queue = %queue, "队列消费者已退出");
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, queue_name: &str, message: Message) -> Result<JobId, QueueError> {
        if self.inner.is_shutting_down() {
            return Err(QueueError::ShuttingDown);
        }

        let job = DeliveryJob::new(queue_name, message, self.inner.retry.max_attempts());
        let id = job.id;
        self.inner.jobs.insert(id, job);
        self.inner.push_pending(queue_name, id);

        debug!(job_id = %id, queue = queue_name, "任务已入队");
        self.inner.emit(JobEvent::Enqueued {
            id,
            queue: queue_name.to_string(),
        });
        Ok(id)
    }

    fn process(
        &self,
        queue_name: &str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), QueueError> {
        if concurrency == 0 {
            return Err(QueueError::InvalidConcurrency(concurrency));
        }
        if self.inner.is_shutting_down() {
            return Err(QueueError::ShuttingDown);
        }
        if !self.inner.consumers.lock().insert(queue_name.to_string()) {
            return Err(QueueError::AlreadyProcessing {
                queue: queue_name.to_string(),
            });
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| QueueError::OperationFailed(e.to_string()))?;
        let worker = runtime.spawn(run_worker(
            Arc::clone(&self.inner),
            queue_name.to_string(),
            concurrency,
            handler,
        ));
        self.inner.workers.lock().push(worker);
        Ok(())
    }

    async fn shutdown(&self, timeout: Duration) -> Result<(), QueueError> {
        if self.inner.shutdown_tx.send_replace(true) {
            return Ok(());
        }

        let workers = std::mem::take(&mut *self.inner.workers.lock());
        let aborts: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();

        info!(workers = workers.len(), timeout_ms = timeout.as_millis() as u64, "队列开始关闭");

        match tokio::time::timeout(timeout, join_all(workers)).await {
            Ok(_) => {
                info!("队列已关闭");
                Ok(())
            }
            Err(_) => {
                // 中止 worker 会连带中止其 JoinSet 中的任务
                for abort in aborts {
                    abort.abort();
                }
                let abandoned = self.inner.fail_abandoned();
                self.inner.reset_in_flight();
                warn!(abandoned, "队列关闭超时");
                Err(QueueError::ShutdownTimeout { timeout })
            }
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DeliveryResult;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use tokio_test::assert_ok;

    /// 记录并发峰值的处理函数
    struct SlowHandler {
        delay: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicU32,
    }

    impl SlowHandler {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl JobHandler for SlowHandler {
        async fn handle(&self, _job: &DeliveryJob) -> Result<DeliveryResult, DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(DeliveryResult::success())
        }
    }

    /// 前 N 次失败的处理函数
    struct FlakyHandler {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn handle(&self, _job: &DeliveryJob) -> Result<DeliveryResult, DeliveryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(DeliveryError::ServerUnavailable { status: 503 })
            } else {
                Ok(DeliveryResult::success())
            }
        }
    }

    fn message() -> Message {
        Message::new(["token-a"], "hi")
    }

    /// 等待收到指定数量的完成事件
    async fn wait_for_completed_events(
        events: &mut broadcast::Receiver<JobEvent>,
        expected: usize,
    ) {
        tokio::time::timeout(Duration::from_secs(5), async {
            let mut completed = 0;
            while completed < expected {
                if let JobEvent::Completed { .. } = events.recv().await.unwrap() {
                    completed += 1;
                }
            }
        })
        .await
        .expect("jobs did not complete in time");
    }

    async fn wait_for_finished(queue: &InMemoryJobQueue, expected: usize) {
        for _ in 0..200 {
            let counts = queue.counts();
            if counts.completed + counts.failed == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("jobs did not finish: {:?}", queue.counts());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let queue = InMemoryJobQueue::default();
        let handler = SlowHandler::new(Duration::from_millis(30));

        for _ in 0..8 {
            assert_ok!(queue.enqueue("push", message()).await);
        }
        assert_ok!(queue.process("push", 2, handler.clone()));

        wait_for_finished(&queue, 8).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 8);
        assert!(handler.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(queue.counts().completed, 8);
    }

    #[tokio::test]
    async fn test_events_report_completion() {
        let queue = InMemoryJobQueue::default();
        let mut events = queue.subscribe();

        let id = queue.enqueue("push", message()).await.unwrap();
        queue
            .process("push", 1, SlowHandler::new(Duration::ZERO))
            .unwrap();

        loop {
            match events.recv().await.unwrap() {
                JobEvent::Completed { id: done, result } => {
                    assert_eq!(done, id);
                    assert_eq!(result.provider_message, "success");
                    break;
                }
                other => assert_eq!(other.job_id(), id),
            }
        }
        assert_eq!(queue.job(id).unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_failed_job_without_retry() {
        let queue = InMemoryJobQueue::default();
        let handler = Arc::new(FlakyHandler {
            failures: 1,
            calls: AtomicU32::new(0),
        });

        let id = queue.enqueue("push", message()).await.unwrap();
        queue.process("push", 1, handler.clone()).unwrap();
        wait_for_finished(&queue, 1).await;

        let job = queue.job(id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(
            job.last_error,
            Some(DeliveryError::ServerUnavailable { status: 503 })
        );
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let queue = InMemoryJobQueue::new(RetryPolicy::from_attempts(3, Duration::from_millis(5)));
        let handler = Arc::new(FlakyHandler {
            failures: 2,
            calls: AtomicU32::new(0),
        });

        let id = queue.enqueue("push", message()).await.unwrap();
        queue.process("push", 1, handler.clone()).unwrap();
        wait_for_finished(&queue, 1).await;

        let job = queue.job(id).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_process_rejects_duplicates_and_zero() {
        let queue = InMemoryJobQueue::default();
        let handler = SlowHandler::new(Duration::ZERO);

        assert!(matches!(
            queue.process("push", 0, handler.clone()),
            Err(QueueError::InvalidConcurrency(0))
        ));
        assert_ok!(queue.process("push", 1, handler.clone()));
        assert!(matches!(
            queue.process("push", 1, handler),
            Err(QueueError::AlreadyProcessing { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight() {
        let queue = InMemoryJobQueue::default();
        let handler = SlowHandler::new(Duration::from_millis(50));

        queue.enqueue("push", message()).await.unwrap();
        queue.process("push", 1, handler.clone()).unwrap();
        // 等任务开始执行
        while handler.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert_ok!(queue.shutdown(Duration::from_secs(1)).await);
        assert_eq!(queue.counts().completed, 1);
        assert!(queue.is_shutting_down());
        assert!(matches!(
            queue.enqueue("push", message()).await,
            Err(QueueError::ShuttingDown)
        ));

        // 再次关闭直接返回
        assert_ok!(queue.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_shutdown_timeout_abandons_jobs() {
        let queue = InMemoryJobQueue::default();
        let handler = SlowHandler::new(Duration::from_secs(10));
        let mut events = queue.subscribe();

        let id = queue.enqueue("push", message()).await.unwrap();
        queue.process("push", 1, handler.clone()).unwrap();
        while handler.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(queue.in_flight("push"), 1);

        let result = queue.shutdown(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(QueueError::ShutdownTimeout { .. })));
        assert_eq!(queue.job(id).unwrap().state, JobState::Failed);
        assert_eq!(queue.in_flight("push"), 0);

        // 订阅方能收到被放弃任务的失败事件
        let mut failed = None;
        while let Ok(event) = events.try_recv() {
            if let JobEvent::Failed { id: failed_id, error } = event {
                failed = Some((failed_id, error));
            }
        }
        let (failed_id, error) = failed.expect("abandoned job should emit a failed event");
        assert_eq!(failed_id, id);
        assert_eq!(error.code(), "UNKNOWN");
    }

    #[tokio::test]
    async fn test_finished_jobs_are_evicted_beyond_limit() {
        let retention = RetentionPolicy {
            remove_on_complete: false,
            max_finished: 10,
        };
        let queue = InMemoryJobQueue::with_retention(RetryPolicy::default(), retention);
        let mut events = queue.subscribe();
        let mut ids = Vec::new();
        for _ in 0..50 {
            ids.push(queue.enqueue("push", message()).await.unwrap());
        }
        queue
            .process("push", 4, SlowHandler::new(Duration::from_millis(1)))
            .unwrap();

        wait_for_completed_events(&mut events, 50).await;

        assert_eq!(queue.retained(), 10);
        assert_eq!(queue.counts().completed, 10);
        // 最早完成的任务已被淘汰
        assert!(ids.iter().filter(|id| queue.job(**id).is_some()).count() == 10);
    }

    #[tokio::test]
    async fn test_remove_on_complete_keeps_failures() {
        let retention = RetentionPolicy {
            remove_on_complete: true,
            max_finished: 100,
        };
        let queue = InMemoryJobQueue::with_retention(RetryPolicy::default(), retention);
        let mut events = queue.subscribe();
        let handler = Arc::new(FlakyHandler {
            failures: 1,
            calls: AtomicU32::new(0),
        });

        let failed = queue.enqueue("push", message()).await.unwrap();
        let completed = queue.enqueue("push", message()).await.unwrap();
        queue.process("push", 1, handler).unwrap();

        wait_for_completed_events(&mut events, 1).await;

        assert!(queue.job(completed).is_none());
        assert_eq!(queue.job(failed).unwrap().state, JobState::Failed);
        assert_eq!(queue.retained(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_without_consumers() {
        let queue = InMemoryJobQueue::default();
        assert_ok!(queue.shutdown(Duration::from_millis(10)).await);
    }
}
