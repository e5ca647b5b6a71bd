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

//! Assignment Discovery (C4): streams the Balancer's current view to a
//! subscribed client, following up with version-gated deltas. Adapted from
//! a barrier-ordered broadcast notification loop to a diff-computing one.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::balancer::{AssignmentView, ChannelAssignment, ChannelBalancerRef};
use crate::model::Version;

/// `{version, added, changed, removed}` — the frame shape a discovery stream sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaFrame {
    pub version: Version,
    pub added: HashMap<String, ChannelAssignment>,
    pub changed: HashMap<String, ChannelAssignment>,
    pub removed: Vec<String>,
}

impl DeltaFrame {
    fn full(view: &AssignmentView) -> Self {
        Self {
            version: view.version,
            added: view.channels.clone(),
            changed: HashMap::new(),
            removed: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Computes `current` relative to `previous`: channels absent from
/// `previous` are `added`, channels present in both with a different
/// assignment are `changed`, channels absent from `current` are `removed`.
fn diff(previous: Option<&AssignmentView>, current: &AssignmentView) -> DeltaFrame {
    let Some(previous) = previous else {
        return DeltaFrame::full(current);
    };
    let mut added = HashMap::new();
    let mut changed = HashMap::new();
    for (name, assignment) in &current.channels {
        match previous.channels.get(name) {
            None => {
                added.insert(name.clone(), assignment.clone());
            }
            Some(prev) if prev != assignment => {
                changed.insert(name.clone(), assignment.clone());
            }
            Some(_) => {}
        }
    }
    let removed = previous
        .channels
        .keys()
        .filter(|name| !current.channels.contains_key(*name))
        .cloned()
        .collect();
    DeltaFrame {
        version: current.version,
        added,
        changed,
        removed,
    }
}

/// Subscribes to the Balancer's watch and streams `DeltaFrame`s: a full
/// initial view, then deltas on every subsequent version change, until
/// `cancel` fires or the receiver is dropped.
///
/// `acks` lets the client report the last version it has durably observed;
/// discovery uses it only to stop emitting once a client has gone away in
/// all but name (the channel close races ahead of `cancel`), not to replay
/// history — every frame is computed fresh against the last frame actually sent.
pub fn stream(
    balancer: ChannelBalancerRef,
    mut acks: mpsc::UnboundedReceiver<Version>,
    cancel: CancellationToken,
) -> mpsc::UnboundedReceiver<DeltaFrame> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut views = balancer.watch(cancel.clone());
        let mut last_sent: Option<AssignmentView> = None;
        let mut is_first = true;
        loop {
            tokio::select! {
                view = views.recv() => {
                    let Some(view) = view else {
                        info!("balancer watch ended, terminating discovery stream");
                        return;
                    };
                    let frame = diff(last_sent.as_ref(), &view);
                    last_sent = Some(view);
                    if is_first || !frame.is_empty() {
                        is_first = false;
                        if tx.send(frame).is_err() {
                            return;
                        }
                    }
                }
                ack = acks.recv() => {
                    if ack.is_none() {
                        // Client's ack channel closed; keep streaming until
                        // `cancel` fires explicitly — disconnection and
                        // acknowledgement are separate signals.
                        continue;
                    }
                }
                _ = cancel.cancelled() => {
                    info!("discovery stream cancelled");
                    return;
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AccessMode;
    use crate::model::ChannelState;

    fn assignment(node_id: u64) -> ChannelAssignment {
        ChannelAssignment {
            node_id,
            mode: AccessMode::ReadWrite,
            state: ChannelState::Assigned,
        }
    }

    #[test]
    fn first_diff_is_a_full_add() {
        let mut channels = HashMap::new();
        channels.insert("c1".to_string(), assignment(1));
        let view = AssignmentView {
            version: Version::initial(1).bumped(),
            channels,
        };
        let frame = diff(None, &view);
        assert_eq!(frame.added.len(), 1);
        assert!(frame.changed.is_empty());
        assert!(frame.removed.is_empty());
    }

    #[test]
    fn subsequent_diff_detects_added_changed_and_removed() {
        let mut before = HashMap::new();
        before.insert("c1".to_string(), assignment(1));
        before.insert("c2".to_string(), assignment(1));
        let previous = AssignmentView {
            version: Version::initial(1),
            channels: before,
        };

        let mut after = HashMap::new();
        after.insert("c1".to_string(), assignment(1)); // unchanged
        after.insert("c2".to_string(), assignment(2)); // changed
        after.insert("c3".to_string(), assignment(3)); // added
        let current = AssignmentView {
            version: Version::initial(1).bumped(),
            channels: after,
        };

        let frame = diff(Some(&previous), &current);
        assert_eq!(frame.added.len(), 1);
        assert!(frame.added.contains_key("c3"));
        assert_eq!(frame.changed.len(), 1);
        assert!(frame.changed.contains_key("c2"));
        assert!(frame.removed.is_empty());
    }

    #[test]
    fn channel_dropped_from_view_is_reported_removed() {
        let mut before = HashMap::new();
        before.insert("c1".to_string(), assignment(1));
        let previous = AssignmentView {
            version: Version::initial(1),
            channels: before,
        };
        let current = AssignmentView {
            version: Version::initial(1).bumped(),
            channels: HashMap::new(),
        };
        let frame = diff(Some(&previous), &current);
        assert_eq!(frame.removed, vec!["c1".to_string()]);
    }
}
