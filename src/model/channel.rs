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

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub type WorkerId = u64;
pub type Term = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    Uninitialized,
    Assigning,
    Assigned,
    Unavailable,
}

/// One entry of a channel's assignment history, kept for fencing and
/// diagnostics until the channel transitions to `Assigned`, at which point
/// the history is cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub term: Term,
    pub node_id: WorkerId,
    pub mode: AccessMode,
}

/// Persisted and in-memory representation of a physical channel.
///
/// Invariants enforced by [`crate::balancer::ChannelBalancer`], not by this
/// type itself (the type is a plain record, mutated only through the
/// balancer per the "no cyclic ownership" design note):
/// - `term` is strictly greater than every entry in `history`.
/// - at most one node holds `state == Assigned` for a given channel at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PChannelMeta {
    pub name: String,
    pub term: Term,
    pub mode: AccessMode,
    pub assignee: WorkerId,
    pub state: ChannelState,
    pub history: Vec<HistoryEntry>,
    pub last_assigned_at: u64,
}

impl PChannelMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            term: 0,
            mode: AccessMode::ReadOnly,
            assignee: 0,
            state: ChannelState::Uninitialized,
            history: Vec::new(),
            last_assigned_at: 0,
        }
    }

    pub fn is_assigned_to(&self, node_id: WorkerId) -> bool {
        self.state == ChannelState::Assigned && self.assignee == node_id
    }

    /// Whether `(mode, node)` already matches the current assignment and the
    /// channel is settled, in which case `assign()` must treat it as a no-op.
    pub fn matches(&self, mode: AccessMode, node_id: WorkerId) -> bool {
        self.state == ChannelState::Assigned && self.mode == mode && self.assignee == node_id
    }

    /// Appends the current (term, assignee, mode) to history, bumps the term,
    /// and applies the new target, transitioning to `Assigning`. Caller is
    /// responsible for persisting before this becomes visible to watchers.
    pub fn begin_assign(&mut self, mode: AccessMode, node_id: WorkerId) {
        if self.state != ChannelState::Uninitialized {
            self.history.push(HistoryEntry {
                term: self.term,
                node_id: self.assignee,
                mode: self.mode,
            });
        }
        self.term += 1;
        self.mode = mode;
        self.assignee = node_id;
        self.state = ChannelState::Assigning;
    }

    pub fn confirm(&mut self) {
        self.history.clear();
        self.state = ChannelState::Assigned;
        self.last_assigned_at = now_secs();
    }

    pub fn mark_unavailable(&mut self) {
        self.state = ChannelState::Unavailable;
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock may have gone backwards")
        .as_secs()
}
