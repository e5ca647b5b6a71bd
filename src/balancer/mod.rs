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

//! Channel Balancer (C3): owns the in-memory channel -> node assignment map
//! and the fair-share policy. Structured as a thin outer type guarding an
//! inner core behind a single mutex, generalized from worker-node
//! bookkeeping to channel assignment with a condition-variable watch.

pub mod policy;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use self::policy::{BalancePolicy, PolicyInput, VchannelFairPolicy};
use crate::config::BalancerConfig;
use crate::error::{CoordError, CoordResult};
use crate::model::{AccessMode, ChannelState, PChannelMeta, Version, WorkerId};
use crate::storage::{cf, MetaStore, Transaction};

pub type ChannelBalancerRef = Arc<ChannelBalancer>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAssignment {
    pub node_id: WorkerId,
    pub mode: AccessMode,
    pub state: ChannelState,
}

/// Instantaneous snapshot of the channel -> node map plus its version pair.
#[derive(Debug, Clone)]
pub struct AssignmentView {
    pub version: Version,
    pub channels: HashMap<String, ChannelAssignment>,
}

struct BalancerCore {
    channels: HashMap<String, PChannelMeta>,
    version: Version,
}

impl BalancerCore {
    fn view(&self) -> AssignmentView {
        AssignmentView {
            version: self.version,
            channels: self
                .channels
                .iter()
                .map(|(name, meta)| {
                    (
                        name.clone(),
                        ChannelAssignment {
                            node_id: meta.assignee,
                            mode: meta.mode,
                            state: meta.state,
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Owns `channels: map[channel_id -> pchannel_meta]`. A single
/// `tokio::sync::Mutex` guards the map (short, non-blocking sections only)
/// and a `Notify` implements the condition-variable broadcast suspension
/// point subscribers block on in `watch`.
pub struct ChannelBalancer {
    core: Mutex<BalancerCore>,
    changed: Notify,
    rebalance_requested: Notify,
    meta_store: Arc<dyn MetaStore>,
    policy: Mutex<Box<dyn BalancePolicy>>,
    vchannel_counts: Mutex<HashMap<String, u32>>,
    streaming_enabled: AtomicBool,
    streaming_notifiers: Mutex<Vec<oneshot::Sender<()>>>,
    config: BalancerConfig,
}

impl ChannelBalancer {
    /// Recovers `channels` from the metadata store so a restarted
    /// coordinator rebuilds a channel map bit-identical to the one it held
    /// before the restart, modulo in-flight mutations.
    pub async fn new(meta_store: Arc<dyn MetaStore>, config: BalancerConfig) -> CoordResult<Arc<Self>> {
        let rows = meta_store.list_cf(cf::CHANNELS).await?;
        let mut channels = HashMap::new();
        for (_, value) in rows {
            let meta: PChannelMeta =
                serde_json::from_slice(&value).map_err(|e| CoordError::meta_store(e))?;
            channels.insert(meta.name.clone(), meta);
        }
        let streaming_enabled = match meta_store.get_cf(cf::STREAMING_VERSION, b"enabled").await {
            Ok(_) => true,
            Err(_) => false,
        };
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock may have gone backwards")
            .as_millis() as u64;
        Ok(Arc::new(Self {
            core: Mutex::new(BalancerCore {
                channels,
                version: Version::initial(epoch),
            }),
            changed: Notify::new(),
            rebalance_requested: Notify::new(),
            meta_store,
            policy: Mutex::new(Box::new(VchannelFairPolicy)),
            vchannel_counts: Mutex::new(HashMap::new()),
            streaming_enabled: AtomicBool::new(streaming_enabled),
            streaming_notifiers: Mutex::new(Vec::new()),
            config,
        }))
    }

    pub async fn set_policy(&self, policy: Box<dyn BalancePolicy>) {
        *self.policy.lock().await = policy;
    }

    pub async fn set_vchannel_count(&self, channel: &str, count: u32) {
        self.vchannel_counts
            .lock()
            .await
            .insert(channel.to_string(), count);
    }

    pub async fn current_view(&self) -> AssignmentView {
        self.core.lock().await.view()
    }

    pub async fn locate(&self, channel: &str) -> Option<(WorkerId, bool)> {
        let core = self.core.lock().await;
        core.channels
            .get(channel)
            .map(|meta| (meta.assignee, meta.state == ChannelState::Assigned))
    }

    /// Streams the current view, then a new one on every version bump,
    /// until `cancel` fires. An async channel stands in for the blocking
    /// callback a condition-variable `watch(subscriber)` would use.
    pub fn watch(self: &Arc<Self>, cancel: CancellationToken) -> mpsc::UnboundedReceiver<AssignmentView> {
        let (tx, rx) = mpsc::unbounded_channel();
        let this = self.clone();
        tokio::spawn(async move {
            let mut last_sent: Option<Version> = None;
            loop {
                let view = {
                    let core = this.core.lock().await;
                    core.view()
                };
                let should_send = last_sent.map_or(true, |last| view.version.is_newer_than(&last));
                if should_send {
                    last_sent = Some(view.version);
                    if tx.send(view).is_err() {
                        return;
                    }
                }
                tokio::select! {
                    _ = this.changed.notified() => {}
                    _ = cancel.cancelled() => return,
                }
            }
        });
        rx
    }

    /// Transitions each channel to `unavailable` and persists; a best-effort
    /// per-channel operation exactly like `assign()`'s failure semantics.
    pub async fn mark_unavailable(&self, channels: Vec<String>) -> CoordResult<()> {
        let mut core = self.core.lock().await;
        let mut any_changed = false;
        for name in channels {
            let Some(meta) = core.channels.get(&name) else {
                continue;
            };
            if meta.state == ChannelState::Unavailable {
                continue;
            }
            let mut next = meta.clone();
            next.mark_unavailable();
            match self.persist(Some(meta), &next).await {
                Ok(()) => {
                    core.channels.insert(name, next);
                    any_changed = true;
                }
                Err(e) => {
                    warn!(channel = %name, error = %e, "failed to persist mark_unavailable, leaving state unchanged");
                }
            }
        }
        if any_changed {
            core.version = core.version.bumped();
            drop(core);
            self.changed.notify_waiters();
        }
        Ok(())
    }

    /// Applies a batch of `(mode, node)` updates atomically from the
    /// subscriber's point of view: a single version bump covers every
    /// channel that actually changed in this call.
    pub async fn assign(&self, updates: HashMap<String, (AccessMode, WorkerId)>) -> CoordResult<()> {
        let mut core = self.core.lock().await;
        let mut any_changed = false;
        for (name, (mode, node_id)) in updates {
            let previous = core.channels.get(&name).cloned();
            let mut meta = previous.clone().unwrap_or_else(|| PChannelMeta::new(&name));
            if meta.matches(mode, node_id) {
                continue; // already at this (mode, assignee) and settled
            }
            meta.begin_assign(mode, node_id);
            match self.persist(previous.as_ref(), &meta).await {
                Ok(()) => {
                    core.channels.insert(name, meta);
                    any_changed = true;
                }
                Err(e) => {
                    warn!(channel = %name, error = %e, "failed to persist assignment, leaving channel unchanged");
                }
            }
        }
        if any_changed {
            core.version = core.version.bumped();
            drop(core);
            self.changed.notify_waiters();
        }
        Ok(())
    }

    /// Called by the assignment-recovery path once the target node has
    /// acknowledged ownership.
    pub async fn confirm(&self, channel: &str) -> CoordResult<()> {
        let mut core = self.core.lock().await;
        let Some(meta) = core.channels.get(channel) else {
            return Err(CoordError::validation(format!("unknown channel {channel}")));
        };
        let mut next = meta.clone();
        next.confirm();
        self.persist(Some(meta), &next).await?;
        core.channels.insert(channel.to_string(), next);
        core.version = core.version.bumped();
        drop(core);
        self.changed.notify_waiters();
        Ok(())
    }

    /// One-shot edge: once the streaming-enabled marker is persisted, every
    /// pending notifier fires and further registrations fire immediately.
    pub async fn register_streaming_enabled_notifier(&self, notifier: oneshot::Sender<()>) {
        if self.streaming_enabled.load(Ordering::Acquire) {
            let _ = notifier.send(());
            return;
        }
        self.streaming_notifiers.lock().await.push(notifier);
    }

    pub async fn enable_streaming(&self) -> CoordResult<()> {
        if self.streaming_enabled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.meta_store
            .put_cf(cf::STREAMING_VERSION, b"enabled".to_vec(), vec![1])
            .await?;
        for notifier in self.streaming_notifiers.lock().await.drain(..) {
            let _ = notifier.send(());
        }
        Ok(())
    }

    /// Forces an immediate balance pass; consumed by the background
    /// rebalance loop started via [`Self::start_rebalance_loop`].
    pub fn trigger(&self) {
        self.rebalance_requested.notify_one();
    }

    /// Persists `meta` guarded by a compare-and-swap against `previous`: if
    /// someone else wrote a different value for this channel since it was
    /// last read here, the write is rejected rather than silently
    /// clobbering it. `previous == None` means this is the channel's first
    /// write, so no precondition is attached.
    async fn persist(&self, previous: Option<&PChannelMeta>, meta: &PChannelMeta) -> CoordResult<()> {
        let key = meta.name.clone().into_bytes();
        let value = serde_json::to_vec(meta).map_err(|e| CoordError::meta_store(e))?;
        let mut txn = Transaction::default();
        if let Some(previous) = previous {
            let previous_value = serde_json::to_vec(previous).map_err(|e| CoordError::meta_store(e))?;
            txn.require_equal(cf::CHANNELS, key.clone(), previous_value);
        }
        txn.put(cf::CHANNELS, key, value);
        let applied = self.meta_store.txn(txn).await?;
        if !applied {
            return Err(CoordError::StaleState(format!(
                "channel {} was modified concurrently",
                meta.name
            )));
        }
        Ok(())
    }

    /// Runs one balance pass against the given node set: consults the
    /// pluggable policy, diffs the desired layout against the current one,
    /// and applies the result through `assign()`.
    pub async fn run_balance_pass(&self, nodes: &[WorkerId]) -> CoordResult<()> {
        let (channels, vchannel_counts) = {
            let core = self.core.lock().await;
            (core.channels.clone(), self.vchannel_counts.lock().await.clone())
        };
        let policy = self.policy.lock().await;
        let input = PolicyInput {
            channels: &channels,
            vchannel_counts: &vchannel_counts,
            nodes,
            rebalance_threshold: self.config.rebalance_threshold,
        };
        let desired = policy.desired_layout(&input);
        drop(policy);

        let streaming_enabled = self.streaming_enabled.load(Ordering::Acquire);
        let mode = if streaming_enabled {
            AccessMode::ReadWrite
        } else {
            AccessMode::ReadOnly
        };

        let mut updates = HashMap::new();
        for (name, node_id) in desired {
            let current = channels.get(&name);
            let needs_update = match current {
                Some(meta) => !meta.matches(mode, node_id),
                None => true,
            };
            if needs_update {
                updates.insert(name, (mode, node_id));
            }
        }
        if !updates.is_empty() {
            info!(count = updates.len(), "applying rebalance batch");
            self.assign(updates).await?;
        }
        Ok(())
    }

    /// Spawns the periodic + event-triggered rebalance loop: wakes on the
    /// check-interval ticker, an explicit `trigger()`, or cancellation.
    pub fn start_rebalance_loop(
        self: &Arc<Self>,
        registry: Arc<crate::registry::WorkerRegistry>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = this.rebalance_requested.notified() => {}
                    _ = cancel.cancelled() => {
                        info!("rebalance loop stopped");
                        return;
                    }
                }
                let nodes = registry.node_ids().await;
                if let Err(e) = this.run_balance_pass(&nodes).await {
                    warn!(error = %e, "balance pass failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStore;

    async fn new_test_balancer() -> Arc<ChannelBalancer> {
        ChannelBalancer::new(Arc::new(MemStore::new()), BalancerConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn first_time_channel_assignment_transitions_through_assigning_to_assigned() {
        let balancer = new_test_balancer().await;
        let mut updates = HashMap::new();
        updates.insert("c1".to_string(), (AccessMode::ReadWrite, 1));
        updates.insert("c2".to_string(), (AccessMode::ReadWrite, 1));
        balancer.assign(updates).await.unwrap();

        let view = balancer.current_view().await;
        assert_eq!(view.channels["c1"].state, ChannelState::Assigning);
        assert_eq!(view.channels["c1"].node_id, 1);

        balancer.confirm("c1").await.unwrap();
        balancer.confirm("c2").await.unwrap();

        let (node, ok) = balancer.locate("c1").await.unwrap();
        assert_eq!(node, 1);
        assert!(ok);
    }

    #[tokio::test]
    async fn assign_twice_is_a_no_op() {
        let balancer = new_test_balancer().await;
        let mut updates = HashMap::new();
        updates.insert("c1".to_string(), (AccessMode::ReadWrite, 1));
        balancer.assign(updates.clone()).await.unwrap();
        balancer.confirm("c1").await.unwrap();
        let version_after_confirm = balancer.current_view().await.version;

        balancer.assign(updates).await.unwrap();
        let version_after_replay = balancer.current_view().await.version;
        assert_eq!(version_after_confirm, version_after_replay);
    }

    #[tokio::test]
    async fn rebalance_on_node_join_moves_exactly_one_channel() {
        let balancer = new_test_balancer().await;
        let mut updates = HashMap::new();
        for c in ["c1", "c2", "c3"] {
            updates.insert(c.to_string(), (AccessMode::ReadWrite, 1));
        }
        balancer.assign(updates).await.unwrap();
        for c in ["c1", "c2", "c3"] {
            balancer.confirm(c).await.unwrap();
        }
        let before = balancer.current_view().await;

        balancer.run_balance_pass(&[1, 2]).await.unwrap();

        let after = balancer.current_view().await;
        assert_eq!(after.version.counter, before.version.counter + 1);
        let moved = after
            .channels
            .iter()
            .filter(|(name, a)| before.channels[*name].node_id != a.node_id)
            .count();
        assert_eq!(moved, 1);
    }

    #[tokio::test]
    async fn streaming_enabled_notifier_fires_once() {
        let balancer = new_test_balancer().await;
        let (tx1, rx1) = oneshot::channel();
        balancer.register_streaming_enabled_notifier(tx1).await;
        balancer.enable_streaming().await.unwrap();
        rx1.await.unwrap();

        let (tx2, rx2) = oneshot::channel();
        balancer.register_streaming_enabled_notifier(tx2).await;
        rx2.await.unwrap();
    }
}
