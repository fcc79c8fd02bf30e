//! 调度能力适配器
//!
//! 对宿主暴露的调度策略提供统一的四个操作：立即执行、延迟执行、异步执行、取消。
//! 策略在启动时根据宿主能力探测结果选择一次，调用方无法感知当前使用的是哪种。

use crate::{HotswapError, Result};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 可调度的任务
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// 调度策略种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    /// 单一全局调度器：非异步任务在同一个串行执行器上按提交顺序运行
    Global,
    /// 分区并行调度器：每个任务独立派发到运行时
    Regional,
}

/// 调度器统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerMetrics {
    pub tasks_scheduled: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
}

const PENDING: u8 = 0;
const STARTED: u8 = 1;
const CANCELLED: u8 = 2;

/// 可取消的任务句柄
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    kind: SchedulerKind,
    token: CancellationToken,
    /// 等待中、已开始或已取消，只从等待中迁出一次
    status: Arc<AtomicU8>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 产生该句柄的调度策略
    pub fn kind(&self) -> SchedulerKind {
        self.kind
    }

    pub fn is_cancelled(&self) -> bool {
        self.status.load(Ordering::Acquire) == CANCELLED
    }

    /// 任务是否已开始执行
    pub fn is_started(&self) -> bool {
        self.status.load(Ordering::Acquire) == STARTED
    }

    /// 取消尚未开始的任务，返回是否由此次调用取消
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .status
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            self.token.cancel();
        }
        cancelled
    }

    fn start(&self) -> bool {
        self.status
            .compare_exchange(PENDING, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// 两种策略共享的状态
#[derive(Debug)]
struct SchedulerShared {
    runtime: Handle,
    next_id: AtomicU64,
    metrics: Mutex<SchedulerMetrics>,
}

impl SchedulerShared {
    fn new(runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            next_id: AtomicU64::new(1),
            metrics: Mutex::new(SchedulerMetrics::default()),
        })
    }

    fn handle(&self, kind: SchedulerKind) -> TaskHandle {
        self.metrics.lock().tasks_scheduled += 1;
        TaskHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind,
            token: CancellationToken::new(),
            status: Arc::new(AtomicU8::new(PENDING)),
        }
    }

    /// 执行任务，捕获panic；已取消的任务直接跳过
    fn execute(&self, handle: &TaskHandle, task: Task) {
        let task_id = handle.id;
        if !handle.start() {
            debug!("Skipping cancelled task {}", task_id);
            return;
        }

        let outcome = catch_unwind(AssertUnwindSafe(task));
        let mut metrics = self.metrics.lock();
        match outcome {
            Ok(()) => metrics.tasks_completed += 1,
            Err(_) => {
                metrics.tasks_failed += 1;
                warn!("Scheduled task {} panicked", task_id);
            }
        }
    }

    fn spawn_blocking(self: &Arc<Self>, handle: &TaskHandle, task: Task) {
        let shared = self.clone();
        let handle = handle.clone();
        self.runtime.spawn_blocking(move || shared.execute(&handle, task));
    }

    /// 等待延迟后交给 `dispatch`；延迟期间取消则直接放弃
    fn spawn_delayed<F>(self: &Arc<Self>, handle: &TaskHandle, delay: Duration, dispatch: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let token = handle.token.clone();
        let id = handle.id;
        self.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!("Delayed task {} cancelled before firing", id),
                _ = tokio::time::sleep(delay) => dispatch(),
            }
        });
    }
}

struct QueuedTask {
    handle: TaskHandle,
    task: Task,
}

/// 单一全局调度器
pub struct GlobalScheduler {
    shared: Arc<SchedulerShared>,
    sender: mpsc::UnboundedSender<QueuedTask>,
}

impl GlobalScheduler {
    fn new(shared: Arc<SchedulerShared>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<QueuedTask>();

        // 串行执行器
        let executor = shared.clone();
        shared.runtime.spawn(async move {
            while let Some(queued) = receiver.recv().await {
                executor.execute(&queued.handle, queued.task);
            }
            debug!("Global scheduler executor stopped");
        });

        Self { shared, sender }
    }

    fn enqueue(sender: &mpsc::UnboundedSender<QueuedTask>, handle: &TaskHandle, task: Task) {
        let queued = QueuedTask {
            handle: handle.clone(),
            task,
        };
        if sender.send(queued).is_err() {
            warn!("Global scheduler executor is gone, dropping task {}", handle.id);
        }
    }

    fn run_task(&self, task: Task) -> TaskHandle {
        let handle = self.shared.handle(SchedulerKind::Global);
        Self::enqueue(&self.sender, &handle, task);
        handle
    }

    fn run_task_later(&self, task: Task, delay: Duration) -> TaskHandle {
        let handle = self.shared.handle(SchedulerKind::Global);
        let sender = self.sender.clone();
        let queued_handle = handle.clone();
        self.shared
            .spawn_delayed(&handle, delay, move || Self::enqueue(&sender, &queued_handle, task));
        handle
    }

    fn run_task_async(&self, task: Task) -> TaskHandle {
        let handle = self.shared.handle(SchedulerKind::Global);
        self.shared.spawn_blocking(&handle, task);
        handle
    }
}

/// 分区并行调度器
pub struct RegionalScheduler {
    shared: Arc<SchedulerShared>,
}

impl RegionalScheduler {
    fn new(shared: Arc<SchedulerShared>) -> Self {
        Self { shared }
    }

    fn dispatch(shared: &Arc<SchedulerShared>, handle: &TaskHandle, task: Task) {
        let executor = shared.clone();
        let handle = handle.clone();
        shared.runtime.spawn(async move { executor.execute(&handle, task) });
    }

    fn run_task(&self, task: Task) -> TaskHandle {
        let handle = self.shared.handle(SchedulerKind::Regional);
        Self::dispatch(&self.shared, &handle, task);
        handle
    }

    fn run_task_later(&self, task: Task, delay: Duration) -> TaskHandle {
        let handle = self.shared.handle(SchedulerKind::Regional);
        let shared = self.shared.clone();
        let dispatched = handle.clone();
        self.shared
            .spawn_delayed(&handle, delay, move || Self::dispatch(&shared, &dispatched, task));
        handle
    }

    fn run_task_async(&self, task: Task) -> TaskHandle {
        let handle = self.shared.handle(SchedulerKind::Regional);
        self.shared.spawn_blocking(&handle, task);
        handle
    }
}

/// 调度能力适配器
pub enum SchedulerAdapter {
    Global(GlobalScheduler),
    Regional(RegionalScheduler),
}

impl SchedulerAdapter {
    /// 根据能力探测结果选择调度策略
    pub fn select(region_capable: bool, runtime: Handle) -> Self {
        let shared = SchedulerShared::new(runtime);
        let adapter = if region_capable {
            SchedulerAdapter::Regional(RegionalScheduler::new(shared))
        } else {
            SchedulerAdapter::Global(GlobalScheduler::new(shared))
        };
        info!("Scheduler adapter bound to {:?} strategy", adapter.kind());
        adapter
    }

    /// 使用当前tokio运行时
    pub fn from_current(region_capable: bool) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| HotswapError::scheduler(format!("No tokio runtime available: {}", e)))?;
        Ok(Self::select(region_capable, runtime))
    }

    pub fn kind(&self) -> SchedulerKind {
        match self {
            SchedulerAdapter::Global(_) => SchedulerKind::Global,
            SchedulerAdapter::Regional(_) => SchedulerKind::Regional,
        }
    }

    /// 立即执行
    pub fn run_task<F>(&self, task: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            SchedulerAdapter::Global(s) => s.run_task(Box::new(task)),
            SchedulerAdapter::Regional(s) => s.run_task(Box::new(task)),
        }
    }

    /// 延迟执行
    pub fn run_task_later<F>(&self, task: F, delay: Duration) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            SchedulerAdapter::Global(s) => s.run_task_later(Box::new(task), delay),
            SchedulerAdapter::Regional(s) => s.run_task_later(Box::new(task), delay),
        }
    }

    /// 异步执行（阻塞线程池）
    pub fn run_task_async<F>(&self, task: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            SchedulerAdapter::Global(s) => s.run_task_async(Box::new(task)),
            SchedulerAdapter::Regional(s) => s.run_task_async(Box::new(task)),
        }
    }

    /// 取消任务，返回此次调用是否真正取消了它；已开始或已完成的任务返回 `false`
    pub fn cancel_task(&self, handle: &TaskHandle) -> bool {
        if !handle.cancel() {
            return false;
        }
        self.shared().metrics.lock().tasks_cancelled += 1;
        debug!("Cancelled task {}", handle.id);
        true
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.shared().metrics.lock().clone()
    }

    fn shared(&self) -> &Arc<SchedulerShared> {
        match self {
            SchedulerAdapter::Global(s) => &s.shared,
            SchedulerAdapter::Regional(s) => &s.shared,
        }
    }
}

impl std::fmt::Debug for SchedulerAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerAdapter")
            .field("kind", &self.kind())
            .field("metrics", &self.metrics())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_select_strategy_from_capability() {
        let global = SchedulerAdapter::select(false, Handle::current());
        let regional = SchedulerAdapter::select(true, Handle::current());
        assert_eq!(global.kind(), SchedulerKind::Global);
        assert_eq!(regional.kind(), SchedulerKind::Regional);
        assert_eq!(regional.run_task(|| {}).kind(), SchedulerKind::Regional);
    }

    #[tokio::test]
    async fn test_global_runs_tasks_in_submission_order() {
        let scheduler = SchedulerAdapter::from_current(false).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();

        for i in 0..5 {
            let order = order.clone();
            scheduler.run_task(move || order.lock().push(i));
        }
        scheduler.run_task(move || {
            let _ = done_tx.send(());
        });

        done_rx.await.unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_run_task_later_fires_after_delay() {
        for region_capable in [false, true] {
            let scheduler = SchedulerAdapter::from_current(region_capable).unwrap();
            let (tx, rx) = oneshot::channel();
            scheduler.run_task_later(
                move || {
                    let _ = tx.send(42);
                },
                Duration::from_millis(20),
            );
            assert_eq!(rx.await.unwrap(), 42);
        }
    }

    #[tokio::test]
    async fn test_cancelled_delayed_task_never_runs() {
        let scheduler = SchedulerAdapter::from_current(false).unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        let handle = scheduler.run_task_later(
            move || flag.store(true, Ordering::SeqCst),
            Duration::from_millis(50),
        );
        assert!(scheduler.cancel_task(&handle));
        assert!(!scheduler.cancel_task(&handle));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(scheduler.metrics().tasks_cancelled, 1);
    }

    #[tokio::test]
    async fn test_cancel_after_completion_is_refused() {
        for region_capable in [false, true] {
            let scheduler = SchedulerAdapter::from_current(region_capable).unwrap();
            let (tx, rx) = oneshot::channel();
            let handle = scheduler.run_task(move || {
                let _ = tx.send(());
            });
            rx.await.unwrap();

            assert!(handle.is_started());
            assert!(!scheduler.cancel_task(&handle));
            assert!(!handle.is_cancelled());
            assert_eq!(scheduler.metrics().tasks_cancelled, 0);
        }
    }

    #[tokio::test]
    async fn test_async_task_panic_is_contained() {
        let scheduler = SchedulerAdapter::from_current(true).unwrap();
        scheduler.run_task_async(|| panic!("task bug"));

        let (tx, rx) = oneshot::channel();
        scheduler.run_task_async(move || {
            let _ = tx.send(());
        });
        rx.await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let metrics = scheduler.metrics();
        assert_eq!(metrics.tasks_scheduled, 2);
        assert_eq!(metrics.tasks_failed, 1);
    }
}
