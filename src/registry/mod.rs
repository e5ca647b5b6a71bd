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

//! Worker Registry (C2): tracks live worker nodes and their free slot
//! counts. Node liveness is driven externally via a lease source; this
//! module only reacts to join/leave edges and answers snapshot queries.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use crate::model::WorkerId;

pub type WorkerRegistryRef = Arc<WorkerRegistry>;

#[derive(Debug, Clone)]
pub struct WorkerEntry {
    pub node_id: WorkerId,
    pub endpoint: String,
    pub available_slots: u32,
}

/// A snapshot copy the scheduler may mutate locally to reserve slots during
/// one dispatch pass, without racing with other passes or the registry's
/// authoritative view.
#[derive(Debug, Clone, Default)]
pub struct SlotSnapshot {
    pub slots: HashMap<WorkerId, u32>,
}

impl SlotSnapshot {
    pub fn is_empty_capacity(&self) -> bool {
        self.slots.values().all(|&s| s == 0)
    }
}

/// Edge-triggered notification of a worker becoming unreachable, consumed by
/// the scheduler to transition in-flight tasks on that node to `retry`.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Joined(WorkerId),
    Left(WorkerId),
}

struct RegistryCore {
    workers: HashMap<WorkerId, WorkerEntry>,
}

/// [`WorkerRegistry`] tracks `{node_id -> {available_slots, endpoint}}` and
/// hands out RPC client handles and slot snapshots: a thin outer type
/// guarding an inner struct behind a single `RwLock`.
pub struct WorkerRegistry {
    core: RwLock<RegistryCore>,
    events_tx: mpsc::UnboundedSender<RegistryEvent>,
}

impl WorkerRegistry {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            core: RwLock::new(RegistryCore {
                workers: HashMap::new(),
            }),
            events_tx,
        });
        (registry, events_rx)
    }

    /// A worker node joins or re-joins (endpoint/slot update) the registry.
    pub async fn on_node_join(&self, node_id: WorkerId, endpoint: String, available_slots: u32) {
        let mut core = self.core.write().await;
        let is_new = !core.workers.contains_key(&node_id);
        core.workers.insert(
            node_id,
            WorkerEntry {
                node_id,
                endpoint,
                available_slots,
            },
        );
        drop(core);
        if is_new {
            info!(node_id, "worker joined registry");
        }
        if self.events_tx.send(RegistryEvent::Joined(node_id)).is_err() {
            warn!("registry event channel has no receiver");
        }
    }

    /// Node lease expired or the node explicitly left; the registry removes it.
    pub async fn on_node_leave(&self, node_id: WorkerId) {
        let removed = self.core.write().await.workers.remove(&node_id).is_some();
        if removed {
            info!(node_id, "worker left registry");
            if self.events_tx.send(RegistryEvent::Left(node_id)).is_err() {
                warn!("registry event channel has no receiver");
            }
        }
    }

    pub async fn refresh_slots(&self, node_id: WorkerId, available_slots: u32) {
        if let Some(entry) = self.core.write().await.workers.get_mut(&node_id) {
            entry.available_slots = available_slots;
        }
    }

    /// Returns a snapshot copy, not a live reference, so the scheduler can
    /// reserve slots locally during one dispatch pass.
    pub async fn query_all_slots(&self) -> SlotSnapshot {
        let core = self.core.read().await;
        SlotSnapshot {
            slots: core
                .workers
                .values()
                .map(|w| (w.node_id, w.available_slots))
                .collect(),
        }
    }

    /// Returns `true` if the node is still registered; the scheduler treats
    /// `false` on a running task's assigned node as a worker-lost signal.
    pub async fn get_client(&self, node_id: WorkerId) -> bool {
        self.core.read().await.workers.contains_key(&node_id)
    }

    pub async fn node_ids(&self) -> Vec<WorkerId> {
        self.core.read().await.workers.keys().copied().collect()
    }

    pub async fn node_count(&self) -> usize {
        self.core.read().await.workers.len()
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_leave_updates_slots() {
        let (registry, mut events) = WorkerRegistry::new();
        registry.on_node_join(1, "127.0.0.1:7000".to_string(), 10).await;
        assert_eq!(registry.node_count().await, 1);
        let snap = registry.query_all_slots().await;
        assert_eq!(snap.slots.get(&1), Some(&10));
        assert!(matches!(events.recv().await, Some(RegistryEvent::Joined(1))));

        registry.on_node_leave(1).await;
        assert_eq!(registry.node_count().await, 0);
        assert!(!registry.get_client(1).await);
        assert!(matches!(events.recv().await, Some(RegistryEvent::Left(1))));
    }
}
