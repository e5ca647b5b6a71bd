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

//! Default session/lease source for deployments with no external lease
//! service of their own: a worker must heartbeat within `ttl` of its last
//! one or the checker evicts it, the same heartbeat-timeout pattern used for
//! compute node liveness elsewhere in this kind of control plane. An
//! external lease mechanism (an etcd lease watch, a Raft-backed session) can
//! bypass this entirely and call [`WorkerRegistry::on_node_join`]/
//! [`WorkerRegistry::on_node_leave`] directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::model::WorkerId;
use crate::registry::WorkerRegistry;

pub struct LeaseTracker {
    registry: Arc<WorkerRegistry>,
    ttl: Duration,
    expire_at: Mutex<HashMap<WorkerId, Instant>>,
}

impl LeaseTracker {
    pub fn new(registry: Arc<WorkerRegistry>, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry,
            ttl,
            expire_at: Mutex::new(HashMap::new()),
        })
    }

    /// Registers (or refreshes) a node's lease, joining it in the registry
    /// if this is its first heartbeat.
    pub async fn heartbeat(&self, node_id: WorkerId, endpoint: String, available_slots: u32) {
        self.registry.on_node_join(node_id, endpoint, available_slots).await;
        self.expire_at
            .lock()
            .await
            .insert(node_id, Instant::now() + self.ttl);
    }

    /// Spawns the periodic expiry sweep; any node whose lease lapsed since
    /// the last check is removed from the registry.
    pub fn start_checker(self: &Arc<Self>, check_interval: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel.cancelled() => {
                        info!("lease checker stopped");
                        return;
                    }
                }
                let now = Instant::now();
                let expired: Vec<WorkerId> = this
                    .expire_at
                    .lock()
                    .await
                    .iter()
                    .filter(|(_, expiry)| **expiry < now)
                    .map(|(id, _)| *id)
                    .collect();
                for node_id in expired {
                    this.expire_at.lock().await.remove(&node_id);
                    this.registry.on_node_leave(node_id).await;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreheartbeaten_node_is_evicted_after_ttl() {
        let (registry, _events) = WorkerRegistry::new();
        let tracker = LeaseTracker::new(registry.clone(), Duration::from_millis(20));
        tracker.heartbeat(1, "127.0.0.1:1".to_string(), 4).await;
        assert_eq!(registry.node_count().await, 1);

        let checker = tracker.start_checker(Duration::from_millis(10), CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(registry.node_count().await, 0);
        checker.abort();
    }
}
