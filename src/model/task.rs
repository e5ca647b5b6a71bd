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

use serde::{Deserialize, Serialize};

use crate::model::channel::WorkerId;

pub type TaskId = u64;

pub const UNASSIGNED_NODE: WorkerId = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    IndexBuild,
    Analyze,
    Statistics,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::IndexBuild => "index_build",
            TaskKind::Analyze => "analyze",
            TaskKind::Statistics => "statistics",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    None,
    Init,
    InProgress,
    Retry,
    Finished,
    Failed,
}

/// One unit of asynchronous work dispatched to a worker node.
///
/// `fairness_key` identifies the tenant/collection the fair-share queue
/// partitions on; `queued_at`/`started_at`/`finished_at` are millisecond
/// timestamps used for queue/run latency metrics and the slow-threshold log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub fairness_key: String,
    pub node_id: WorkerId,
    pub slot_cost: u32,
    pub state: TaskState,
    pub fail_reason: Option<String>,
    pub queued_at: u64,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
    /// Bumped by `update_version` on every dispatch attempt, used to fence
    /// stale worker responses from a previous attempt.
    pub attempt: u32,
    pub payload: Vec<u8>,
}

impl TaskRecord {
    pub fn new(task_id: TaskId, kind: TaskKind, fairness_key: impl Into<String>, slot_cost: u32, payload: Vec<u8>, now_ms: u64) -> Self {
        Self {
            task_id,
            kind,
            fairness_key: fairness_key.into(),
            node_id: UNASSIGNED_NODE,
            slot_cost,
            state: TaskState::Init,
            fail_reason: None,
            queued_at: now_ms,
            started_at: None,
            finished_at: None,
            attempt: 0,
            payload,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, TaskState::Finished | TaskState::Failed)
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.state = TaskState::Failed;
        self.fail_reason = Some(reason.into());
    }
}
