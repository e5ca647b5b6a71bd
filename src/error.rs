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

use thiserror::Error;
pub use thiserror_ext::AsReport;

pub type CoordResult<T> = std::result::Result<T, CoordError>;

/// Error taxonomy for the coordinator core.
///
/// Variants are grouped by policy: transient I/O is retried by the caller,
/// stale-state conflicts are reapplied at the next tick, validation errors
/// are surfaced synchronously, and unrecoverable errors are logged and the
/// offending entity is skipped.
#[derive(Error, Debug)]
pub enum CoordError {
    #[error("meta store error: {0}")]
    MetaStore(#[source] anyhow::Error),

    #[error("worker rpc error: {0}")]
    Rpc(#[source] anyhow::Error),

    #[error("worker {0} not found in registry")]
    WorkerNotFound(u64),

    #[error("stale-state conflict on {0}, retry at next tick")]
    StaleState(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl CoordError {
    pub fn meta_store(e: impl Into<anyhow::Error>) -> Self {
        Self::MetaStore(e.into())
    }

    pub fn rpc(e: impl Into<anyhow::Error>) -> Self {
        Self::Rpc(e.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unrecoverable(msg: impl Into<String>) -> Self {
        Self::Unrecoverable(msg.into())
    }

    /// Transient errors are the ones whose policy is "retry with backoff",
    /// as opposed to validation/unrecoverable errors which must not be retried blindly.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::MetaStore(_) | Self::Rpc(_) | Self::StaleState(_))
    }
}
