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

/// Version pair for an [`crate::balancer::AssignmentView`]: `epoch` is the
/// coordinator incarnation identity, `counter` advances on every mutation
/// within that incarnation. Views compare by pair equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub epoch: u64,
    pub counter: u64,
}

impl Version {
    pub fn initial(epoch: u64) -> Self {
        Self { epoch, counter: 0 }
    }

    pub fn bumped(self) -> Self {
        Self {
            epoch: self.epoch,
            counter: self.counter + 1,
        }
    }

    /// A subscriber only receives a view whose pair differs from the last it saw.
    pub fn is_newer_than(&self, other: &Version) -> bool {
        self.epoch != other.epoch || self.counter > other.counter
    }
}
