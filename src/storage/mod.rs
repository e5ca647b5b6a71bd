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

//! Metadata Store Gateway (C1): the only durable dependency of the core.
//! Abstracts a strongly-consistent key-value store with atomic put/get/
//! prefix-list/delete, column-family namespacing, and optimistic
//! transactions.

mod etcd;
mod mem;

pub use etcd::EtcdMetaStore;
pub use mem::MemStore;

use async_trait::async_trait;

use crate::error::{CoordError, CoordResult};

/// Column families used for the persisted state layout.
pub mod cf {
    pub const CHANNELS: &str = "channels";
    pub const STREAMING_VERSION: &str = "streaming_version";
    pub const TASKS: &str = "tasks";
    pub const CHECKPOINTS: &str = "checkpoints";
    pub const SEGMENTS: &str = "segments";
    pub const INDEX_BUILDS: &str = "index_builds";
}

pub type Key = Vec<u8>;
pub type Value = Vec<u8>;

#[derive(Debug, Clone)]
pub enum Precondition {
    KeyExists { cf: String, key: Key },
    KeyEqual { cf: String, key: Key, value: Value },
}

#[derive(Debug, Clone)]
pub enum Operation {
    Put { cf: String, key: Key, value: Value },
    Delete { cf: String, key: Key },
}

/// A batch of preconditions checked atomically against the current state
/// before all operations are applied, also atomically. Used by the
/// Balancer's `persist` to compare-and-swap each channel against the value
/// it last read: `assign`, `mark_unavailable`, and `confirm` each build a
/// single-channel transaction, so one channel losing the race doesn't roll
/// back a sibling's already-applied write in the same batch.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    preconditions: Vec<Precondition>,
    operations: Vec<Operation>,
}

impl Transaction {
    pub fn put(&mut self, cf: &str, key: Key, value: Value) {
        self.operations.push(Operation::Put {
            cf: cf.to_string(),
            key,
            value,
        });
    }

    pub fn delete(&mut self, cf: &str, key: Key) {
        self.operations.push(Operation::Delete {
            cf: cf.to_string(),
            key,
        });
    }

    pub fn require_equal(&mut self, cf: &str, key: Key, value: Value) {
        self.preconditions.push(Precondition::KeyEqual {
            cf: cf.to_string(),
            key,
            value,
        });
    }

    pub fn into_parts(self) -> (Vec<Precondition>, Vec<Operation>) {
        (self.preconditions, self.operations)
    }
}

/// The only durable dependency of the whole core. Keyed by byte strings
/// inside a column family, with at-least-once put/delete semantics: callers
/// are expected to make operations idempotent by key.
#[async_trait]
pub trait MetaStore: Send + Sync + 'static {
    async fn get_cf(&self, cf: &str, key: &[u8]) -> CoordResult<Value>;
    async fn list_cf(&self, cf: &str) -> CoordResult<Vec<(Key, Value)>>;
    async fn put_cf(&self, cf: &str, key: Key, value: Value) -> CoordResult<()>;
    async fn delete_cf(&self, cf: &str, key: &[u8]) -> CoordResult<()>;
    async fn txn(&self, txn: Transaction) -> CoordResult<bool>;
}

pub(crate) fn not_found(cf: &str, key: &[u8]) -> CoordError {
    CoordError::meta_store(anyhow::anyhow!(
        "key not found in cf {cf}: {}",
        hex::encode(key)
    ))
}
