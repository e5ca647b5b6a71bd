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

//! The narrow slice of object-store functionality the garbage collector
//! needs: list, delete, and metadata (for modification-time-based staleness
//! checks). The wire protocol and backend implementations (S3, local disk,
//! opendal) are out of scope here; this crate only ever talks to
//! `dyn CollectorObjectStore`.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::error::CoordResult;

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub key: String,
    pub last_modified_secs: u64,
}

#[async_trait]
pub trait CollectorObjectStore: Send + Sync {
    async fn list(&self, prefix: &str) -> CoordResult<Vec<ObjectInfo>>;

    async fn delete(&self, key: &str) -> CoordResult<()>;

    /// Deletes every key in `keys`, bounded to `concurrency` in-flight
    /// requests at a time. The default implementation is adequate for every
    /// backend; override only if a backend offers a cheaper native
    /// batch-delete.
    async fn delete_many(&self, keys: &[String], concurrency: usize) -> CoordResult<()> {
        let results: Vec<CoordResult<()>> = stream::iter(keys.iter())
            .map(|key| self.delete(key))
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;
        results.into_iter().collect::<CoordResult<Vec<()>>>()?;
        Ok(())
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod mem {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;

    /// In-memory `CollectorObjectStore` used by every GC test in this crate.
    #[derive(Default)]
    pub struct MemObjectStore {
        objects: Mutex<HashMap<String, u64>>,
    }

    impl MemObjectStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn put(&self, key: impl Into<String>, last_modified_secs: u64) {
            self.objects.lock().insert(key.into(), last_modified_secs);
        }

        pub fn contains(&self, key: &str) -> bool {
            self.objects.lock().contains_key(key)
        }

        pub fn len(&self) -> usize {
            self.objects.lock().len()
        }
    }

    #[async_trait]
    impl CollectorObjectStore for MemObjectStore {
        async fn list(&self, prefix: &str) -> CoordResult<Vec<ObjectInfo>> {
            Ok(self
                .objects
                .lock()
                .iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .map(|(key, ts)| ObjectInfo {
                    key: key.clone(),
                    last_modified_secs: *ts,
                })
                .collect())
        }

        async fn delete(&self, key: &str) -> CoordResult<()> {
            self.objects.lock().remove(key);
            Ok(())
        }
    }
}
