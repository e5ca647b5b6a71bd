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

//! Control-plane core of a distributed streaming platform: maintains the
//! channel-to-node assignment map, streams it to subscribers, and schedules
//! index/analyze/statistics jobs onto a worker fleet with bounded slot
//! capacity. See each module for the corresponding component.

pub mod balancer;
pub mod config;
pub mod discovery;
pub mod error;
pub mod gc;
pub mod lease;
pub mod model;
pub mod registry;
pub mod scheduler;
pub mod storage;

pub use config::Config;
pub use error::{CoordError, CoordResult};

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use balancer::{ChannelBalancer, ChannelBalancerRef};
use gc::{CollectorObjectStore, GcService, GcServiceRef};
use registry::WorkerRegistry;
use scheduler::rpc::WorkerRpcClient;
use scheduler::{Scheduler, SchedulerMetrics, SchedulerRef};
use storage::MetaStore;

/// Initializes a `tracing` subscriber from `RUST_LOG`, defaulting to `info`.
/// Call once from the hosting binary's `main`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Wires the four control-plane components around a shared metadata store,
/// the way a server binary assembles them on startup: `ChannelBalancer` (C3)
/// and `WorkerRegistry` (C2) for assignment, `Scheduler` (C5) for task
/// dispatch, `GcService` bundled onto the scheduler's lifecycle.
pub struct Coordinator {
    pub balancer: ChannelBalancerRef,
    pub registry: Arc<WorkerRegistry>,
    pub scheduler: SchedulerRef,
    pub gc: GcServiceRef,
}

/// Join handles for every background loop a running [`Coordinator`] owns;
/// dropping this without awaiting is fine, the loops keep running until
/// their `CancellationToken` fires.
pub struct CoordinatorHandles {
    pub rebalance_loop: tokio::task::JoinHandle<()>,
    pub scheduler_dispatch: tokio::task::JoinHandle<()>,
    pub scheduler_poll: tokio::task::JoinHandle<()>,
    pub gc_segment_loop: tokio::task::JoinHandle<()>,
    pub gc_scan_loop: tokio::task::JoinHandle<()>,
}

impl Coordinator {
    pub async fn new(
        meta_store: Arc<dyn MetaStore>,
        object_store: Arc<dyn CollectorObjectStore>,
        rpc: Arc<dyn WorkerRpcClient>,
        metrics_registry: &prometheus::Registry,
        config: Config,
    ) -> CoordResult<Arc<Self>> {
        let balancer = ChannelBalancer::new(meta_store.clone(), config.balancer).await?;
        let (registry, _worker_events) = WorkerRegistry::new();
        let metrics = Arc::new(SchedulerMetrics::new(metrics_registry));
        let scheduler = Scheduler::new(
            meta_store.clone(),
            registry.clone(),
            rpc,
            scheduler::task_kind::default_hooks(),
            config.scheduler,
            metrics,
        )
        .await?;
        let gc = GcService::new(meta_store, object_store, config.gc);
        Ok(Arc::new(Self {
            balancer,
            registry,
            scheduler,
            gc,
        }))
    }

    /// Used by tests and local experimentation: an in-memory metadata store,
    /// an in-memory object store, and a mock RPC client, all with a fresh
    /// `prometheus::Registry`.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn for_test() -> CoordResult<Arc<Self>> {
        Self::new(
            Arc::new(storage::MemStore::new()),
            Arc::new(gc::object_store::mem::MemObjectStore::new()),
            Arc::new(scheduler::rpc::mock::MockWorkerRpcClient::new()),
            &prometheus::Registry::new(),
            Config::default(),
        )
        .await
    }

    /// Spawns every background loop; the returned handles keep running
    /// until `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> CoordinatorHandles {
        let rebalance_loop = self.balancer.start_rebalance_loop(self.registry.clone(), cancel.clone());
        let (scheduler_dispatch, scheduler_poll) = self.scheduler.start(cancel.clone());
        let (gc_segment_loop, gc_scan_loop) = self.gc.start(cancel);
        CoordinatorHandles {
            rebalance_loop,
            scheduler_dispatch,
            scheduler_poll,
            gc_segment_loop,
            gc_scan_loop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{AccessMode, TaskKind};

    #[tokio::test]
    async fn coordinator_wires_up_and_serves_a_channel_assignment() {
        let coordinator = Coordinator::for_test().await.unwrap();
        coordinator.registry.on_node_join(1, "127.0.0.1:1".to_string(), 8).await;

        let mut updates = std::collections::HashMap::new();
        updates.insert("c1".to_string(), (AccessMode::ReadWrite, 1));
        coordinator.balancer.assign(updates).await.unwrap();
        coordinator.balancer.confirm("c1").await.unwrap();

        let (node, ok) = coordinator.balancer.locate("c1").await.unwrap();
        assert_eq!(node, 1);
        assert!(ok);
    }

    #[tokio::test]
    async fn coordinator_submits_and_tracks_a_task() {
        let coordinator = Coordinator::for_test().await.unwrap();
        let task_id = coordinator
            .scheduler
            .submit(TaskKind::Analyze, "tenant", 1, vec![])
            .await
            .unwrap();
        assert!(coordinator.scheduler.query_task(task_id).await.is_some());
    }
}
