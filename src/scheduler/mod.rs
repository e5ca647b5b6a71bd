// Copyright 2024 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Index/Stats Task Scheduler (C5). Holds `pending` (a fair-share queue)
//! and `running` (a concurrent map keyed by `task_id`), driven by a dispatch
//! loop and a polling loop, each on their own tick plus an edge-triggered
//! notify.

pub mod metrics;
pub mod queue;
pub mod rpc;
pub mod task_kind;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use lru::LruCache;
use tokio::sync::{Mutex, Notify, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use self::metrics::SchedulerMetrics;
pub use self::queue::FairQueue;
pub use self::rpc::{RpcJobStatus, WorkerRpcClient};
pub use self::task_kind::{PreCheckOutcome, TaskHooks};

use crate::config::SchedulerConfig;
use crate::error::{CoordError, CoordResult};
use crate::model::{TaskId, TaskKind, TaskRecord, TaskState, WorkerId, UNASSIGNED_NODE};
use crate::registry::WorkerRegistry;
use crate::storage::{cf, MetaStore};

pub type SchedulerRef = Arc<Scheduler>;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock may have gone backwards")
        .as_millis() as u64
}

/// Greedily picks a node for `cost`: the first with enough slots, or, if
/// none fits, the node with the most positive slots as a fallback.
fn pick_node(slots: &mut HashMap<WorkerId, u32>, cost: u32) -> Option<WorkerId> {
    let mut ids: Vec<WorkerId> = slots.keys().copied().collect();
    ids.sort_unstable();
    for id in &ids {
        if slots[id] >= cost {
            *slots.get_mut(id).expect("id came from the same map") -= cost;
            return Some(*id);
        }
    }
    let fallback = ids
        .into_iter()
        .filter(|id| slots[id] > 0)
        .max_by_key(|id| slots[id]);
    if let Some(id) = fallback {
        slots.insert(id, 0);
        return Some(id);
    }
    None
}

struct RunningEntry {
    task: Mutex<TaskRecord>,
}

pub struct Scheduler {
    meta_store: Arc<dyn MetaStore>,
    registry: Arc<WorkerRegistry>,
    rpc: Arc<dyn WorkerRpcClient>,
    hooks: HashMap<TaskKind, Box<dyn TaskHooks>>,
    pending: Mutex<FairQueue>,
    running: RwLock<HashMap<TaskId, Arc<RunningEntry>>>,
    next_task_id: AtomicU64,
    notify: Notify,
    poll_semaphore: Arc<Semaphore>,
    finished: Mutex<LruCache<TaskId, (TaskRecord, Instant)>>,
    accepting: AtomicBool,
    config: SchedulerConfig,
    metrics: Arc<SchedulerMetrics>,
}

impl Scheduler {
    /// Rebuilds `pending`/`running` from persisted task records on
    /// startup: `in-progress` tasks resume in `running` for the polling
    /// loop to re-query, every other non-terminal state is reset and
    /// re-queued.
    pub async fn new(
        meta_store: Arc<dyn MetaStore>,
        registry: Arc<WorkerRegistry>,
        rpc: Arc<dyn WorkerRpcClient>,
        hooks: HashMap<TaskKind, Box<dyn TaskHooks>>,
        config: SchedulerConfig,
        metrics: Arc<SchedulerMetrics>,
    ) -> CoordResult<Arc<Self>> {
        let rows = meta_store.list_cf(cf::TASKS).await?;
        let mut pending = FairQueue::new();
        let mut running = HashMap::new();
        let mut max_task_id = 0u64;
        for (_, value) in rows {
            let mut task: TaskRecord = serde_json::from_slice(&value).map_err(CoordError::meta_store)?;
            max_task_id = max_task_id.max(task.task_id);
            match task.state {
                TaskState::InProgress => {
                    running.insert(task.task_id, Arc::new(RunningEntry { task: Mutex::new(task) }));
                }
                TaskState::Finished | TaskState::Failed => {
                    // Recovered terminal tasks are not replayed into either
                    // collection; they are already done.
                }
                TaskState::Init | TaskState::Retry | TaskState::None => {
                    task.state = TaskState::Init;
                    task.node_id = UNASSIGNED_NODE;
                    pending.push(task);
                }
            }
        }
        let capacity = NonZeroUsize::new(config.finished_lru_capacity.max(1)).expect("max(1) is nonzero");
        Ok(Arc::new(Self {
            meta_store,
            registry,
            rpc,
            hooks,
            pending: Mutex::new(pending),
            running: RwLock::new(running),
            next_task_id: AtomicU64::new(max_task_id + 1),
            notify: Notify::new(),
            poll_semaphore: Arc::new(Semaphore::new(config.poll_concurrency)),
            finished: Mutex::new(LruCache::new(capacity)),
            accepting: AtomicBool::new(true),
            config,
            metrics,
        }))
    }

    /// Admits a new task into `pending`. Rejected once the scheduler has
    /// begun shutting down.
    pub async fn submit(
        &self,
        kind: TaskKind,
        fairness_key: impl Into<String>,
        slot_cost: u32,
        payload: Vec<u8>,
    ) -> CoordResult<TaskId> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(CoordError::Cancelled);
        }
        let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        let task = TaskRecord::new(task_id, kind, fairness_key, slot_cost, payload, now_ms());
        self.persist(&task).await?;
        self.pending.lock().await.push(task);
        self.notify.notify_one();
        Ok(task_id)
    }

    pub async fn query_task(&self, task_id: TaskId) -> Option<TaskRecord> {
        if let Some(entry) = self.running.read().await.get(&task_id) {
            return Some(entry.task.lock().await.clone());
        }
        if let Some((task, _)) = self.finished.lock().await.peek(&task_id) {
            return Some(task.clone());
        }
        None
    }

    /// Cancels a task wherever it currently sits: pending tasks are pulled
    /// out and moved straight into `running` in `failed` state so the
    /// polling loop finalizes them within one tick; already-running tasks
    /// are marked in place.
    pub async fn abort(&self, task_id: TaskId) -> CoordResult<()> {
        if let Some(mut task) = self.pending.lock().await.remove(task_id) {
            task.fail("canceled");
            self.persist(&task).await?;
            self.metrics.in_flight.with_label_values(&[task.kind.as_str()]).inc();
            self.running
                .write()
                .await
                .insert(task_id, Arc::new(RunningEntry { task: Mutex::new(task) }));
            return Ok(());
        }
        let running = self.running.read().await;
        if let Some(entry) = running.get(&task_id) {
            let mut task = entry.task.lock().await;
            task.fail("canceled");
            self.persist(&task).await?;
            return Ok(());
        }
        Err(CoordError::validation(format!("task {task_id} not found")))
    }

    pub fn trigger(&self) {
        self.notify.notify_one();
    }

    async fn persist(&self, task: &TaskRecord) -> CoordResult<()> {
        let value = serde_json::to_vec(task).map_err(CoordError::meta_store)?;
        self.meta_store
            .put_cf(cf::TASKS, task.task_id.to_string().into_bytes(), value)
            .await
    }

    async fn running_counts_by_partition(&self) -> HashMap<String, usize> {
        let running = self.running.read().await;
        let mut counts = HashMap::new();
        for entry in running.values() {
            let key = entry.task.lock().await.fairness_key.clone();
            *counts.entry(key).or_insert(0usize) += 1;
        }
        counts
    }

    /// Runs exactly one dispatch pass: pops as many tasks as current slots
    /// allow, spawns one `process_init` per chosen task, then waits for all
    /// of them before returning (a wait-group barrier before the next pass).
    pub async fn dispatch_pass(self: &Arc<Self>) {
        let mut slots = self.registry.query_all_slots().await.slots;
        let mut joins = Vec::new();
        loop {
            if slots.values().all(|&s| s == 0) {
                break;
            }
            let running_counts = self.running_counts_by_partition().await;
            let Some(mut task) = self.pending.lock().await.pop(&running_counts) else {
                break;
            };
            let Some(node_id) = pick_node(&mut slots, task.slot_cost) else {
                self.pending.lock().await.push_front(task);
                break;
            };
            task.node_id = node_id;
            task.state = TaskState::InProgress;
            let task_id = task.task_id;
            let entry = Arc::new(RunningEntry { task: Mutex::new(task) });
            self.running.write().await.insert(task_id, entry.clone());
            self.metrics.in_flight.with_label_values(&[entry.task.lock().await.kind.as_str()]).inc();

            let this = self.clone();
            joins.push(tokio::spawn(async move { this.process_init(task_id, entry).await }));
        }
        for handle in joins {
            if let Err(e) = handle.await {
                warn!(error = %e, "process_init task panicked");
            }
        }
    }

    /// Runs the `process_init` sequence for one task freshly popped from
    /// `pending`: pre-check, acquire RPC client, bump attempt version,
    /// submit the job, then record the in-progress state.
    async fn process_init(self: Arc<Self>, task_id: TaskId, entry: Arc<RunningEntry>) {
        let kind = entry.task.lock().await.kind;
        let Some(hooks) = self.hooks.get(&kind) else {
            warn!(task_id, ?kind, "no hooks registered for task kind");
            return;
        };

        let precheck = {
            let task = entry.task.lock().await;
            hooks.pre_check(&task).await
        };
        match precheck {
            Ok(PreCheckOutcome::Skip) => {
                let mut task = entry.task.lock().await;
                task.state = TaskState::Finished;
                task.started_at = Some(now_ms());
                task.finished_at = task.started_at;
                self.finalize_locked(task_id, hooks.as_ref(), &mut task).await;
                return;
            }
            Ok(PreCheckOutcome::Proceed) => {}
            Err(e) => {
                warn!(task_id, error = %e, "pre_check failed, re-queueing");
                self.requeue(task_id).await;
                return;
            }
        }

        let node_id = entry.task.lock().await.node_id;
        if !self.rpc.is_available(node_id).await {
            self.requeue(task_id).await;
            return;
        }

        {
            let mut task = entry.task.lock().await;
            if let Err(e) = hooks.update_version(self.meta_store.as_ref(), &mut task).await {
                warn!(task_id, error = %e, "update_version failed, re-queueing");
                drop(task);
                self.requeue(task_id).await;
                return;
            }
        }

        {
            let mut task = entry.task.lock().await;
            if let Err(e) = hooks.assign_task(self.rpc.as_ref(), &task).await {
                task.fail_reason = Some(e.to_string());
                // Stays in-progress; the polling loop's query_result will
                // surface the failure on the next tick.
            }
        }

        let persisted = {
            let mut task = entry.task.lock().await;
            task.started_at = Some(now_ms());
            self.metrics
                .queue_latency_seconds
                .with_label_values(&[kind.as_str()])
                .observe((task.started_at.unwrap().saturating_sub(task.queued_at)) as f64 / 1000.0);
            self.persist(&task).await
        };
        if let Err(e) = persisted {
            warn!(task_id, error = %e, "failed to persist in-progress state, marking retry");
            entry.task.lock().await.state = TaskState::Retry;
        }
    }

    /// Removes a task from `running` and re-queues it in `pending`, used
    /// whenever `process_init` can't proceed past an early step.
    async fn requeue(&self, task_id: TaskId) {
        if let Some(entry) = self.running.write().await.remove(&task_id) {
            let mut task = entry.task.lock().await;
            self.metrics.in_flight.with_label_values(&[task.kind.as_str()]).dec();
            task.state = TaskState::Init;
            task.node_id = UNASSIGNED_NODE;
            let task = task.clone();
            self.pending.lock().await.push_front(task);
        }
    }

    /// One polling pass over every task currently in `running`, capped at
    /// `poll_concurrency` in-flight polls via the scheduler's semaphore.
    pub async fn poll_pass(self: &Arc<Self>) {
        let ids: Vec<TaskId> = self.running.read().await.keys().copied().collect();
        let mut joins = Vec::new();
        for task_id in ids {
            let permit = self.poll_semaphore.clone().acquire_owned().await;
            let Ok(permit) = permit else { continue };
            let this = self.clone();
            joins.push(tokio::spawn(async move {
                let _permit = permit;
                this.poll_one(task_id).await;
            }));
        }
        for handle in joins {
            if let Err(e) = handle.await {
                warn!(error = %e, "poll task panicked");
            }
        }
    }

    async fn poll_one(self: &Arc<Self>, task_id: TaskId) {
        let Some(entry) = self.running.read().await.get(&task_id).cloned() else {
            return;
        };
        let mut task = entry.task.lock().await;
        let Some(hooks) = self.hooks.get(&task.kind) else {
            return;
        };

        match task.state {
            TaskState::InProgress => {
                let worker_lost = !self.registry.get_client(task.node_id).await;
                if worker_lost {
                    // Worker-lost and an explicit `retry` verdict both drain
                    // through drop/reset/re-enqueue within this same tick
                    // rather than waiting for a second poll to observe the
                    // `retry` state.
                    hooks.drop_task_on_worker(self.rpc.as_ref(), &task).await;
                    hooks.reset(&mut task);
                    task.state = TaskState::Init;
                    task.node_id = UNASSIGNED_NODE;
                    drop(task);
                    self.requeue(task_id).await;
                    return;
                }
                match hooks.query_result(self.rpc.as_ref(), &task).await {
                    Ok(RpcJobStatus::Finished) => {
                        task.state = TaskState::Finished;
                        task.finished_at = Some(now_ms());
                    }
                    Ok(RpcJobStatus::Failed(reason)) => {
                        task.fail(reason);
                        task.finished_at = Some(now_ms());
                    }
                    Ok(RpcJobStatus::Running) => {
                        if let Some(started) = task.started_at {
                            let running_for = Duration::from_millis(now_ms().saturating_sub(started));
                            if running_for >= self.config.slow_threshold {
                                warn!(task_id, node_id = task.node_id, ?running_for, "task exceeds slow_threshold");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(task_id, error = %e, "query_result failed");
                    }
                }
                if task.is_terminal() {
                    self.finalize_locked(task_id, hooks.as_ref(), &mut task).await;
                }
            }
            TaskState::Retry => {
                hooks.drop_task_on_worker(self.rpc.as_ref(), &task).await;
                hooks.reset(&mut task);
                task.state = TaskState::Init;
                task.node_id = UNASSIGNED_NODE;
                drop(task);
                if let Some(entry) = self.running.write().await.remove(&task_id) {
                    let task = entry.task.lock().await.clone();
                    self.metrics.in_flight.with_label_values(&[task.kind.as_str()]).dec();
                    self.pending.lock().await.push(task);
                    self.notify.notify_one();
                }
            }
            TaskState::Finished | TaskState::Failed => {
                self.finalize_locked(task_id, hooks.as_ref(), &mut task).await;
            }
            TaskState::Init | TaskState::None => {}
        }
    }

    /// Persists the final record, best-effort drops worker-side state,
    /// evicts from `running` into the bounded finished-task LRU, and emits
    /// the run-latency metric.
    async fn finalize_locked(&self, task_id: TaskId, hooks: &dyn TaskHooks, task: &mut TaskRecord) {
        if let Err(e) = hooks.set_job_info(self.meta_store.as_ref(), task).await {
            warn!(task_id, error = %e, "failed to persist final task record");
        }
        hooks.drop_task_on_worker(self.rpc.as_ref(), task).await;

        if let (Some(start), Some(end)) = (task.started_at, task.finished_at) {
            self.metrics
                .run_latency_seconds
                .with_label_values(&[task.kind.as_str()])
                .observe(end.saturating_sub(start) as f64 / 1000.0);
        }

        self.running.write().await.remove(&task_id);
        self.metrics.in_flight.with_label_values(&[task.kind.as_str()]).dec();

        let mut finished = self.finished.lock().await;
        prune_expired(&mut finished, self.config.finished_lru_ttl);
        finished.put(task_id, (task.clone(), Instant::now()));
    }

    /// Spawns the dispatch and polling loops; both stop once `cancel` fires.
    pub fn start(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let dispatch = {
            let this = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(this.config.interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = this.notify.notified() => {}
                        _ = cancel.cancelled() => {
                            info!("dispatch loop stopped");
                            return;
                        }
                    }
                    this.dispatch_pass().await;
                }
            })
        };
        let poll = {
            let this = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(this.config.interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = cancel.cancelled() => {
                            info!("polling loop stopped");
                            return;
                        }
                    }
                    this.poll_pass().await;
                }
            })
        };
        self.accepting.store(true, Ordering::Release);
        (dispatch, poll)
    }

    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }
}

fn prune_expired(cache: &mut LruCache<TaskId, (TaskRecord, Instant)>, ttl: Duration) {
    let expired: Vec<TaskId> = cache
        .iter()
        .filter(|(_, (_, inserted))| inserted.elapsed() > ttl)
        .map(|(id, _)| *id)
        .collect();
    for id in expired {
        cache.pop(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::WorkerRegistry;
    use crate::scheduler::rpc::mock::MockWorkerRpcClient;
    use crate::storage::MemStore;

    async fn new_test_scheduler() -> (Arc<Scheduler>, Arc<WorkerRegistry>, Arc<MockWorkerRpcClient>) {
        let meta_store = Arc::new(MemStore::new());
        let (registry, _events) = WorkerRegistry::new();
        let rpc = Arc::new(MockWorkerRpcClient::new());
        let metrics = Arc::new(SchedulerMetrics::for_test());
        let scheduler = Scheduler::new(
            meta_store,
            registry.clone(),
            rpc.clone(),
            task_kind::default_hooks(),
            SchedulerConfig::default(),
            metrics,
        )
        .await
        .unwrap();
        (scheduler, registry, rpc)
    }

    #[tokio::test]
    async fn submit_dispatch_finish_happy_path() {
        let (scheduler, registry, rpc) = new_test_scheduler().await;
        registry.on_node_join(1, "127.0.0.1:1".to_string(), 10).await;

        let task_id = scheduler
            .submit(TaskKind::Analyze, "tenant-a", 4, b"payload".to_vec())
            .await
            .unwrap();
        rpc.set_available(1, true);

        scheduler.dispatch_pass().await;
        let task = scheduler.query_task(task_id).await.unwrap();
        assert_eq!(task.state, TaskState::InProgress);
        assert_eq!(task.node_id, 1);

        rpc.set_status(1, task_id, RpcJobStatus::Finished);
        scheduler.poll_pass().await;
        let task = scheduler.query_task(task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Finished);
    }

    #[tokio::test]
    async fn worker_loss_during_task_triggers_retry() {
        let (scheduler, registry, rpc) = new_test_scheduler().await;
        registry.on_node_join(1, "127.0.0.1:1".to_string(), 10).await;
        rpc.set_available(1, true);

        let task_id = scheduler
            .submit(TaskKind::IndexBuild, "tenant-a", 4, b"payload".to_vec())
            .await
            .unwrap();
        scheduler.dispatch_pass().await;
        assert_eq!(scheduler.query_task(task_id).await.unwrap().state, TaskState::InProgress);

        registry.on_node_leave(1).await;
        scheduler.poll_pass().await;

        // worker-lost moved it to retry and the polling loop already reset
        // it back into pending within the same tick.
        assert!(scheduler.query_task(task_id).await.is_none());
        assert_eq!(scheduler.pending.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn abort_pending_task_finalizes_as_canceled() {
        let (scheduler, _registry, _rpc) = new_test_scheduler().await;
        let task_id = scheduler
            .submit(TaskKind::Statistics, "tenant-b", 1, vec![])
            .await
            .unwrap();

        scheduler.abort(task_id).await.unwrap();
        assert_eq!(scheduler.pending.lock().await.len(), 0);
        let task = scheduler.query_task(task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.fail_reason.as_deref(), Some("canceled"));

        scheduler.poll_pass().await;
        // Finalized and evicted from `running` into the finished LRU, not
        // forgotten entirely: `query_task` still answers for it there.
        let task = scheduler.query_task(task_id).await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.fail_reason.as_deref(), Some("canceled"));
    }

    #[tokio::test]
    async fn slot_cost_exceeding_every_node_uses_exactly_one_fallback() {
        let (scheduler, registry, rpc) = new_test_scheduler().await;
        registry.on_node_join(1, "127.0.0.1:1".to_string(), 2).await;
        rpc.set_available(1, true);

        let t1 = scheduler.submit(TaskKind::Analyze, "a", 10, vec![]).await.unwrap();
        let t2 = scheduler.submit(TaskKind::Analyze, "a", 10, vec![]).await.unwrap();
        scheduler.dispatch_pass().await;

        let mut dispatched = 0;
        for id in [t1, t2] {
            if scheduler.query_task(id).await.map(|t| t.state) == Some(TaskState::InProgress) {
                dispatched += 1;
            }
        }
        assert_eq!(dispatched, 1);
    }
}
