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

//! Per-kind task behavior: task kinds are modeled as a tagged variant with
//! per-kind hooks, not an inheritance hierarchy. `TaskHooks` is the
//! interface trait; [`IndexBuildHooks`], [`AnalyzeHooks`] and
//! [`StatisticsHooks`] are its three implementations.

use async_trait::async_trait;

use crate::error::CoordResult;
use crate::model::{TaskKind, TaskRecord};
use crate::scheduler::rpc::{RpcJobStatus, WorkerRpcClient};
use crate::storage::{cf, MetaStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreCheckOutcome {
    Proceed,
    /// The task needs no worker-side work at all (e.g. a flat index build);
    /// `process_init` finalizes it as finished without ever dispatching.
    Skip,
}

#[async_trait]
pub trait TaskHooks: Send + Sync {
    fn kind(&self) -> TaskKind;

    async fn pre_check(&self, task: &TaskRecord) -> CoordResult<PreCheckOutcome>;

    /// Bumps `task.attempt` and persists it, fencing stale worker responses
    /// from a previous dispatch attempt.
    async fn update_version(&self, meta_store: &dyn MetaStore, task: &mut TaskRecord) -> CoordResult<()> {
        task.attempt += 1;
        persist(meta_store, task).await
    }

    async fn assign_task(&self, rpc: &dyn WorkerRpcClient, task: &TaskRecord) -> CoordResult<()> {
        rpc.create_job(task.node_id, task).await
    }

    async fn query_result(&self, rpc: &dyn WorkerRpcClient, task: &TaskRecord) -> CoordResult<RpcJobStatus> {
        rpc.query_job(task.node_id, task.task_id).await
    }

    async fn drop_task_on_worker(&self, rpc: &dyn WorkerRpcClient, task: &TaskRecord) {
        let _ = rpc.drop_job(task.node_id, task.task_id).await;
    }

    /// Clears whatever a previous attempt left behind before the task
    /// re-enters `init`. Default is a no-op; kinds with partial on-worker
    /// state override this.
    fn reset(&self, _task: &mut TaskRecord) {}

    async fn set_job_info(&self, meta_store: &dyn MetaStore, task: &TaskRecord) -> CoordResult<()> {
        persist(meta_store, task).await
    }
}

async fn persist(meta_store: &dyn MetaStore, task: &TaskRecord) -> CoordResult<()> {
    let value = serde_json::to_vec(task).map_err(crate::error::CoordError::meta_store)?;
    meta_store
        .put_cf(cf::TASKS, task.task_id.to_string().into_bytes(), value)
        .await
}

/// Index builds on an empty payload are flat indexes: no worker-side build
/// is needed at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct IndexBuildHooks;

#[async_trait]
impl TaskHooks for IndexBuildHooks {
    fn kind(&self) -> TaskKind {
        TaskKind::IndexBuild
    }

    async fn pre_check(&self, task: &TaskRecord) -> CoordResult<PreCheckOutcome> {
        if task.payload.is_empty() {
            Ok(PreCheckOutcome::Skip)
        } else {
            Ok(PreCheckOutcome::Proceed)
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AnalyzeHooks;

#[async_trait]
impl TaskHooks for AnalyzeHooks {
    fn kind(&self) -> TaskKind {
        TaskKind::Analyze
    }

    async fn pre_check(&self, _task: &TaskRecord) -> CoordResult<PreCheckOutcome> {
        Ok(PreCheckOutcome::Proceed)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StatisticsHooks;

#[async_trait]
impl TaskHooks for StatisticsHooks {
    fn kind(&self) -> TaskKind {
        TaskKind::Statistics
    }

    async fn pre_check(&self, _task: &TaskRecord) -> CoordResult<PreCheckOutcome> {
        Ok(PreCheckOutcome::Proceed)
    }
}

pub fn default_hooks() -> std::collections::HashMap<TaskKind, Box<dyn TaskHooks>> {
    let mut map: std::collections::HashMap<TaskKind, Box<dyn TaskHooks>> = std::collections::HashMap::new();
    map.insert(TaskKind::IndexBuild, Box::new(IndexBuildHooks));
    map.insert(TaskKind::Analyze, Box::new(AnalyzeHooks));
    map.insert(TaskKind::Statistics, Box::new(StatisticsHooks));
    map
}
