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

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{not_found, Key, MetaStore, Operation, Precondition, Transaction, Value};
use crate::error::CoordResult;

/// In-process implementation of [`MetaStore`] used by every test in this
/// crate, and a legitimate standalone-mode backend for a single coordinator
/// instance with no external dependency.
#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<RwLock<BTreeMap<(String, Key), Value>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetaStore for MemStore {
    async fn get_cf(&self, cf: &str, key: &[u8]) -> CoordResult<Value> {
        self.inner
            .read()
            .get(&(cf.to_string(), key.to_vec()))
            .cloned()
            .ok_or_else(|| not_found(cf, key))
    }

    async fn list_cf(&self, cf: &str) -> CoordResult<Vec<(Key, Value)>> {
        Ok(self
            .inner
            .read()
            .iter()
            .filter(|((c, _), _)| c == cf)
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn put_cf(&self, cf: &str, key: Key, value: Value) -> CoordResult<()> {
        self.inner.write().insert((cf.to_string(), key), value);
        Ok(())
    }

    async fn delete_cf(&self, cf: &str, key: &[u8]) -> CoordResult<()> {
        self.inner.write().remove(&(cf.to_string(), key.to_vec()));
        Ok(())
    }

    async fn txn(&self, txn: Transaction) -> CoordResult<bool> {
        let (preconditions, operations) = txn.into_parts();
        let mut guard = self.inner.write();
        for cond in &preconditions {
            let satisfied = match cond {
                Precondition::KeyExists { cf, key } => {
                    guard.contains_key(&(cf.clone(), key.clone()))
                }
                Precondition::KeyEqual { cf, key, value } => guard
                    .get(&(cf.clone(), key.clone()))
                    .map(|v| v == value)
                    .unwrap_or(false),
            };
            if !satisfied {
                return Ok(false);
            }
        }
        for op in operations {
            match op {
                Operation::Put { cf, key, value } => {
                    guard.insert((cf, key), value);
                }
                Operation::Delete { cf, key } => {
                    guard.remove(&(cf, key));
                }
            }
        }
        Ok(true)
    }
}
