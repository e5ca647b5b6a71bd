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

//! Garbage collector bundled with the scheduler's lifecycle: segment GC
//! gated on compaction successors and checkpoint position, a file-prefix
//! scan for orphaned log files, and index-file recycling by build id.

pub mod object_store;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use self::object_store::{CollectorObjectStore, ObjectInfo};

use crate::config::GcConfig;
use crate::error::{CoordError, CoordResult};
use crate::storage::{cf, MetaStore};

pub type GcServiceRef = Arc<GcService>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub segment_id: String,
    pub channel: String,
    pub dropped: bool,
    /// Set when `dropped` first becomes true; gates reclaim behind
    /// `gc.drop_tolerance` regardless of how quickly the checkpoint catches up.
    pub dropped_at: Option<u64>,
    /// Segments produced by compacting this one away; GC waits for all of
    /// them to be indexed before reclaiming the source.
    pub successors: Vec<String>,
    pub dml_position: u64,
    pub log_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelCheckpoint {
    pub channel: String,
    pub checkpoint_ts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexBuildMeta {
    pub build_id: String,
    pub file_keys: Vec<String>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock may have gone backwards")
        .as_secs()
}

pub struct GcService {
    meta_store: Arc<dyn MetaStore>,
    object_store: Arc<dyn CollectorObjectStore>,
    config: GcConfig,
    paused_until: Mutex<Option<Instant>>,
}

impl GcService {
    pub fn new(meta_store: Arc<dyn MetaStore>, object_store: Arc<dyn CollectorObjectStore>, config: GcConfig) -> Arc<Self> {
        Arc::new(Self {
            meta_store,
            object_store,
            config,
            paused_until: Mutex::new(None),
        })
    }

    /// Suspends every pass for `duration`; a concurrently in-flight pass
    /// still runs to completion.
    pub async fn pause(&self, duration: Duration) {
        *self.paused_until.lock().await = Some(Instant::now() + duration);
        info!(?duration, "gc paused");
    }

    pub async fn resume(&self) {
        *self.paused_until.lock().await = None;
        info!("gc resumed");
    }

    async fn is_paused(&self) -> bool {
        matches!(*self.paused_until.lock().await, Some(until) if Instant::now() < until)
    }

    async fn segments(&self) -> CoordResult<Vec<(Vec<u8>, SegmentMeta)>> {
        let rows = self.meta_store.list_cf(cf::SEGMENTS).await?;
        Ok(rows
            .into_iter()
            .filter_map(|(key, value)| serde_json::from_slice::<SegmentMeta>(&value).ok().map(|s| (key, s)))
            .collect())
    }

    async fn successors_fully_indexed(&self, successors: &[String]) -> bool {
        for successor in successors {
            if self
                .meta_store
                .get_cf(cf::INDEX_BUILDS, successor.as_bytes())
                .await
                .is_err()
            {
                return false;
            }
        }
        true
    }

    /// For each `dropped` segment whose successors are all indexed, whose
    /// channel's checkpoint has passed its DML position, and for which
    /// `gc.drop_tolerance` has elapsed since it was dropped, deletes its log
    /// files and drops the metadata record. Returns the number reclaimed.
    pub async fn run_segment_gc_pass(&self) -> CoordResult<usize> {
        if self.is_paused().await {
            return Ok(0);
        }
        let now = now_secs();
        let mut reclaimed = 0;
        for (key, segment) in self.segments().await? {
            if !segment.dropped {
                continue;
            }
            let dropped_long_enough = segment
                .dropped_at
                .is_some_and(|ts| now.saturating_sub(ts) >= self.config.drop_tolerance.as_secs());
            if !dropped_long_enough {
                continue;
            }
            if !self.successors_fully_indexed(&segment.successors).await {
                continue;
            }
            let checkpoint = match self.meta_store.get_cf(cf::CHECKPOINTS, segment.channel.as_bytes()).await {
                Ok(value) => serde_json::from_slice::<ChannelCheckpoint>(&value).map_err(CoordError::meta_store)?,
                Err(_) => continue, // no checkpoint yet: can't prove the gate, wait.
            };
            if checkpoint.checkpoint_ts < segment.dml_position {
                continue;
            }
            self.object_store
                .delete_many(&segment.log_paths, self.config.remove_concurrency)
                .await?;
            self.meta_store.delete_cf(cf::SEGMENTS, &key).await?;
            reclaimed += 1;
            self.maybe_drop_channel_checkpoint(&segment.channel).await?;
        }
        Ok(reclaimed)
    }

    async fn maybe_drop_channel_checkpoint(&self, channel: &str) -> CoordResult<()> {
        let has_remaining_segments = self
            .segments()
            .await?
            .iter()
            .any(|(_, s)| s.channel == channel);
        if has_remaining_segments {
            return Ok(());
        }
        let channel_exists = self.meta_store.get_cf(cf::CHANNELS, channel.as_bytes()).await.is_ok();
        if !channel_exists {
            self.meta_store.delete_cf(cf::CHECKPOINTS, channel.as_bytes()).await?;
        }
        Ok(())
    }

    /// Deletes log files older than `missing_tolerance` that no segment
    /// metadata references, rate-limited to `remove_concurrency`.
    pub async fn run_file_prefix_scan(&self) -> CoordResult<usize> {
        if self.is_paused().await {
            return Ok(0);
        }
        let now = now_secs();
        let files = self.object_store.list(&self.config.log_prefix).await?;
        let segments = self.segments().await?;
        let mut stale = Vec::new();
        for file in files {
            let age = now.saturating_sub(file.last_modified_secs);
            if age <= self.config.missing_tolerance.as_secs() {
                continue;
            }
            let referenced = segments.iter().any(|(_, s)| s.log_paths.contains(&file.key));
            if !referenced {
                stale.push(file.key);
            }
        }
        let count = stale.len();
        self.object_store.delete_many(&stale, self.config.remove_concurrency).await?;
        Ok(count)
    }

    /// Recycles the index-file prefix one directory level at a time: whole
    /// build-id subtrees with no metadata record are dropped entirely;
    /// otherwise any file not in the meta's file-key set is pruned.
    pub async fn run_index_recycle_pass(&self) -> CoordResult<usize> {
        if self.is_paused().await {
            return Ok(0);
        }
        let files = self.object_store.list(&self.config.index_prefix).await?;
        let mut by_build_id: HashMap<String, Vec<String>> = HashMap::new();
        for file in files {
            let rest = file.key.strip_prefix(self.config.index_prefix.as_str()).unwrap_or(&file.key);
            let Some(build_id) = rest.split('/').next().filter(|s| !s.is_empty()) else {
                continue;
            };
            by_build_id.entry(build_id.to_string()).or_default().push(file.key);
        }

        let mut removed = 0;
        for (build_id, keys) in by_build_id {
            match self.meta_store.get_cf(cf::INDEX_BUILDS, build_id.as_bytes()).await {
                Err(_) => {
                    removed += keys.len();
                    self.object_store.delete_many(&keys, self.config.remove_concurrency).await?;
                }
                Ok(value) => {
                    let meta: IndexBuildMeta = serde_json::from_slice(&value).map_err(CoordError::meta_store)?;
                    let known: HashSet<&String> = meta.file_keys.iter().collect();
                    let orphaned: Vec<String> = keys.into_iter().filter(|k| !known.contains(k)).collect();
                    removed += orphaned.len();
                    self.object_store
                        .delete_many(&orphaned, self.config.remove_concurrency)
                        .await?;
                }
            }
        }
        Ok(removed)
    }

    /// Spawns the segment-GC loop (on `check_interval`) and the heavier
    /// file-scan + index-recycle loop (on `scan_interval`), both stopping
    /// when `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let segment_loop = {
            let this = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if !this.config.enabled {
                    return;
                }
                let mut ticker = tokio::time::interval(this.config.check_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = cancel.cancelled() => {
                            info!("segment gc loop stopped");
                            return;
                        }
                    }
                    match this.run_segment_gc_pass().await {
                        Ok(n) if n > 0 => info!(reclaimed = n, "segment gc pass complete"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "segment gc pass failed"),
                    }
                }
            })
        };
        let scan_loop = {
            let this = self.clone();
            tokio::spawn(async move {
                if !this.config.enabled {
                    return;
                }
                let mut ticker = tokio::time::interval(this.config.scan_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = cancel.cancelled() => {
                            info!("file scan / index recycle loop stopped");
                            return;
                        }
                    }
                    if let Err(e) = this.run_file_prefix_scan().await {
                        warn!(error = %e, "file prefix scan failed");
                    }
                    if let Err(e) = this.run_index_recycle_pass().await {
                        warn!(error = %e, "index recycle pass failed");
                    }
                }
            })
        };
        (segment_loop, scan_loop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::object_store::mem::MemObjectStore;
    use crate::storage::MemStore;

    async fn put_segment(meta_store: &MemStore, segment: &SegmentMeta) {
        let value = serde_json::to_vec(segment).unwrap();
        meta_store
            .put_cf(cf::SEGMENTS, segment.segment_id.clone().into_bytes(), value)
            .await
            .unwrap();
    }

    async fn put_checkpoint(meta_store: &MemStore, channel: &str, ts: u64) {
        let checkpoint = ChannelCheckpoint {
            channel: channel.to_string(),
            checkpoint_ts: ts,
        };
        let value = serde_json::to_vec(&checkpoint).unwrap();
        meta_store
            .put_cf(cf::CHECKPOINTS, channel.as_bytes().to_vec(), value)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn segment_gc_reclaims_once_checkpoint_and_successors_clear() {
        let meta_store = Arc::new(MemStore::new());
        let object_store = Arc::new(MemObjectStore::new());
        object_store.put("logs/seg1/a.log", 0);
        object_store.put("logs/seg1/b.log", 0);

        put_segment(
            &meta_store,
            &SegmentMeta {
                segment_id: "seg1".to_string(),
                channel: "c1".to_string(),
                dropped: true,
                dropped_at: Some(0),
                successors: vec!["seg2".to_string()],
                dml_position: 100,
                log_paths: vec!["logs/seg1/a.log".to_string(), "logs/seg1/b.log".to_string()],
            },
        )
        .await;

        let gc = GcService::new(meta_store.clone(), object_store.clone(), GcConfig::default());

        // successor not indexed yet and checkpoint absent: nothing reclaimed.
        assert_eq!(gc.run_segment_gc_pass().await.unwrap(), 0);
        assert_eq!(object_store.len(), 2);

        let index_meta = IndexBuildMeta {
            build_id: "seg2".to_string(),
            file_keys: vec![],
        };
        meta_store
            .put_cf(cf::INDEX_BUILDS, b"seg2".to_vec(), serde_json::to_vec(&index_meta).unwrap())
            .await
            .unwrap();
        put_checkpoint(&meta_store, "c1", 50).await;

        // checkpoint hasn't caught up to dml_position yet.
        assert_eq!(gc.run_segment_gc_pass().await.unwrap(), 0);

        put_checkpoint(&meta_store, "c1", 150).await;
        assert_eq!(gc.run_segment_gc_pass().await.unwrap(), 1);
        assert_eq!(object_store.len(), 0);
        assert!(meta_store.get_cf(cf::SEGMENTS, b"seg1").await.is_err());
    }

    #[tokio::test]
    async fn file_prefix_scan_deletes_only_stale_unreferenced_files() {
        let meta_store = Arc::new(MemStore::new());
        let object_store = Arc::new(MemObjectStore::new());
        object_store.put("logs/referenced.log", 0);
        object_store.put("logs/stale_orphan.log", 0);
        object_store.put("logs/fresh_orphan.log", now_secs());

        put_segment(
            &meta_store,
            &SegmentMeta {
                segment_id: "seg1".to_string(),
                channel: "c1".to_string(),
                dropped: false,
                dropped_at: None,
                successors: vec![],
                dml_position: 0,
                log_paths: vec!["logs/referenced.log".to_string()],
            },
        )
        .await;

        let mut config = GcConfig::default();
        config.missing_tolerance = Duration::from_secs(0);
        let gc = GcService::new(meta_store, object_store.clone(), config);

        let removed = gc.run_file_prefix_scan().await.unwrap();
        assert_eq!(removed, 1);
        assert!(object_store.contains("logs/referenced.log"));
        assert!(!object_store.contains("logs/stale_orphan.log"));
    }

    #[tokio::test]
    async fn segment_gc_withholds_reclaim_until_drop_tolerance_elapses() {
        let meta_store = Arc::new(MemStore::new());
        let object_store = Arc::new(MemObjectStore::new());
        object_store.put("logs/seg1/a.log", 0);

        put_segment(
            &meta_store,
            &SegmentMeta {
                segment_id: "seg1".to_string(),
                channel: "c1".to_string(),
                dropped: true,
                dropped_at: Some(now_secs()),
                successors: vec![],
                dml_position: 0,
                log_paths: vec!["logs/seg1/a.log".to_string()],
            },
        )
        .await;
        put_checkpoint(&meta_store, "c1", 100).await;

        let mut config = GcConfig::default();
        config.drop_tolerance = Duration::from_secs(3 * 60 * 60);
        let gc = GcService::new(meta_store.clone(), object_store.clone(), config);

        // successors and checkpoint both clear, but the segment was only just
        // dropped: drop_tolerance withholds the reclaim.
        assert_eq!(gc.run_segment_gc_pass().await.unwrap(), 0);
        assert!(object_store.contains("logs/seg1/a.log"));
    }

    #[tokio::test]
    async fn index_recycle_drops_unknown_build_and_orphan_files() {
        let meta_store = Arc::new(MemStore::new());
        let object_store = Arc::new(MemObjectStore::new());
        object_store.put("index/build-a/0.idx", 0);
        object_store.put("index/build-a/1.idx", 0);
        object_store.put("index/build-b/0.idx", 0);

        let meta = IndexBuildMeta {
            build_id: "build-a".to_string(),
            file_keys: vec!["index/build-a/0.idx".to_string()],
        };
        meta_store
            .put_cf(cf::INDEX_BUILDS, b"build-a".to_vec(), serde_json::to_vec(&meta).unwrap())
            .await
            .unwrap();

        let gc = GcService::new(meta_store, object_store.clone(), GcConfig::default());
        let removed = gc.run_index_recycle_pass().await.unwrap();

        assert_eq!(removed, 2); // build-a/1.idx orphan + whole unknown build-b
        assert!(object_store.contains("index/build-a/0.idx"));
        assert!(!object_store.contains("index/build-a/1.idx"));
        assert!(!object_store.contains("index/build-b/0.idx"));
    }

    #[tokio::test]
    async fn pause_suppresses_passes_until_resumed() {
        let meta_store = Arc::new(MemStore::new());
        let object_store = Arc::new(MemObjectStore::new());
        object_store.put("logs/stale.log", 0);
        let mut config = GcConfig::default();
        config.missing_tolerance = Duration::from_secs(0);
        let gc = GcService::new(meta_store, object_store.clone(), config);

        gc.pause(Duration::from_secs(60)).await;
        assert_eq!(gc.run_file_prefix_scan().await.unwrap(), 0);
        assert!(object_store.contains("logs/stale.log"));

        gc.resume().await;
        assert_eq!(gc.run_file_prefix_scan().await.unwrap(), 1);
    }
}
