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

//! Worker RPC surface consumed by the scheduler's `assign_task`/
//! `query_result` hooks. The core crate talks to a `dyn WorkerRpcClient`
//! rather than a concrete transport, the same way compute-node control
//! flows are driven through a client trait instead of hand-rolled sockets.

use async_trait::async_trait;

use crate::error::CoordResult;
use crate::model::{TaskRecord, WorkerId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcJobStatus {
    Running,
    Finished,
    Failed(String),
}

#[async_trait]
pub trait WorkerRpcClient: Send + Sync {
    /// Whether a usable RPC channel exists for `node_id` right now.
    async fn is_available(&self, node_id: WorkerId) -> bool;

    async fn create_job(&self, node_id: WorkerId, task: &TaskRecord) -> CoordResult<()>;

    async fn query_job(&self, node_id: WorkerId, task_id: crate::model::TaskId) -> CoordResult<RpcJobStatus>;

    /// Best-effort cleanup; callers log but do not fail on error.
    async fn drop_job(&self, node_id: WorkerId, task_id: crate::model::TaskId) -> CoordResult<()>;
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;
    use crate::model::TaskId;

    #[derive(Default)]
    pub struct MockWorkerRpcClient {
        available: Mutex<std::collections::HashSet<WorkerId>>,
        statuses: Mutex<HashMap<(WorkerId, TaskId), RpcJobStatus>>,
        create_failures: Mutex<std::collections::HashSet<(WorkerId, TaskId)>>,
    }

    impl MockWorkerRpcClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_available(&self, node_id: WorkerId, available: bool) {
            let mut set = self.available.lock();
            if available {
                set.insert(node_id);
            } else {
                set.remove(&node_id);
            }
        }

        pub fn set_status(&self, node_id: WorkerId, task_id: TaskId, status: RpcJobStatus) {
            self.statuses.lock().insert((node_id, task_id), status);
        }

        pub fn fail_create(&self, node_id: WorkerId, task_id: TaskId) {
            self.create_failures.lock().insert((node_id, task_id));
        }
    }

    #[async_trait]
    impl WorkerRpcClient for MockWorkerRpcClient {
        async fn is_available(&self, node_id: WorkerId) -> bool {
            self.available.lock().contains(&node_id)
        }

        async fn create_job(&self, node_id: WorkerId, task: &TaskRecord) -> CoordResult<()> {
            if self.create_failures.lock().contains(&(node_id, task.task_id)) {
                return Err(crate::error::CoordError::rpc(anyhow::anyhow!(
                    "mock create_job failure for task {}",
                    task.task_id
                )));
            }
            self.statuses
                .lock()
                .entry((node_id, task.task_id))
                .or_insert(RpcJobStatus::Running);
            Ok(())
        }

        async fn query_job(&self, node_id: WorkerId, task_id: TaskId) -> CoordResult<RpcJobStatus> {
            Ok(self
                .statuses
                .lock()
                .get(&(node_id, task_id))
                .cloned()
                .unwrap_or(RpcJobStatus::Running))
        }

        async fn drop_job(&self, node_id: WorkerId, task_id: TaskId) -> CoordResult<()> {
            self.statuses.lock().remove(&(node_id, task_id));
            Ok(())
        }
    }
}
