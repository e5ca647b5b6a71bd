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

//! Fair-share pending queue. Tasks are partitioned by `fairness_key`; `pop`
//! favors whichever partition currently has the fewest running tasks,
//! falling back to oldest-enqueue-time on ties.

use std::collections::{HashMap, VecDeque};

use crate::model::{TaskId, TaskRecord};

struct Entry {
    seq: u64,
    record: TaskRecord,
}

#[derive(Default)]
pub struct FairQueue {
    partitions: HashMap<String, VecDeque<Entry>>,
    next_seq: u64,
}

impl FairQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: TaskRecord) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.partitions
            .entry(record.fairness_key.clone())
            .or_default()
            .push_back(Entry { seq, record });
    }

    /// Re-inserts a task at the front of its partition, as if it had never
    /// left (used when a dispatch attempt can't proceed and must re-queue
    /// without losing its place in line).
    pub fn push_front(&mut self, record: TaskRecord) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.partitions
            .entry(record.fairness_key.clone())
            .or_default()
            .push_front(Entry { seq, record });
    }

    /// Picks the non-empty partition with the lowest `running_counts` entry
    /// (absent entries count as zero), breaking ties by the oldest queued
    /// task across the tied partitions.
    pub fn pop(&mut self, running_counts: &HashMap<String, usize>) -> Option<TaskRecord> {
        let mut best_key: Option<&String> = None;
        let mut best_running = usize::MAX;
        let mut best_seq = u64::MAX;
        for (key, entries) in self.partitions.iter() {
            let Some(front) = entries.front() else {
                continue;
            };
            let running = running_counts.get(key).copied().unwrap_or(0);
            if running < best_running || (running == best_running && front.seq < best_seq) {
                best_running = running;
                best_seq = front.seq;
                best_key = Some(key);
            }
        }
        let key = best_key?.clone();
        self.partitions
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .map(|entry| entry.record)
    }

    /// Removes a specific pending task (used by `abort`), returning it if present.
    pub fn remove(&mut self, task_id: TaskId) -> Option<TaskRecord> {
        for entries in self.partitions.values_mut() {
            if let Some(pos) = entries.iter().position(|e| e.record.task_id == task_id) {
                return entries.remove(pos).map(|e| e.record);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.partitions.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskKind;

    fn task(id: TaskId, key: &str) -> TaskRecord {
        TaskRecord::new(id, TaskKind::IndexBuild, key, 1, vec![], id)
    }

    #[test]
    fn pop_prefers_least_busy_partition() {
        let mut q = FairQueue::new();
        q.push(task(1, "a"));
        q.push(task(2, "b"));
        let mut running = HashMap::new();
        running.insert("a".to_string(), 3);
        running.insert("b".to_string(), 0);
        let popped = q.pop(&running).unwrap();
        assert_eq!(popped.task_id, 2);
    }

    #[test]
    fn ties_break_by_oldest_enqueue() {
        let mut q = FairQueue::new();
        q.push(task(1, "a"));
        q.push(task(2, "b"));
        let popped = q.pop(&HashMap::new()).unwrap();
        assert_eq!(popped.task_id, 1);
    }

    #[test]
    fn remove_pulls_task_out_of_its_partition() {
        let mut q = FairQueue::new();
        q.push(task(1, "a"));
        q.push(task(2, "a"));
        let removed = q.remove(1).unwrap();
        assert_eq!(removed.task_id, 1);
        assert_eq!(q.len(), 1);
        assert!(q.remove(1).is_none());
    }
}
