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

//! Cross-module coverage for the Balancer and Discovery stream talking to
//! each other through a shared `ChannelBalancer`, the way a real client
//! would observe the two.

use std::collections::HashMap;
use std::time::Duration;

use streaming_coord_core::balancer::ChannelBalancer;
use streaming_coord_core::discovery;
use streaming_coord_core::model::AccessMode;
use streaming_coord_core::storage::MemStore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use std::sync::Arc;

#[tokio::test]
async fn first_time_assignment_is_observed_as_a_full_add() {
    let meta_store = Arc::new(MemStore::new());
    let balancer = ChannelBalancer::new(meta_store, Default::default()).await.unwrap();

    let (_ack_tx, ack_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let mut deltas = discovery::stream(balancer.clone(), ack_rx, cancel.clone());

    let mut updates = HashMap::new();
    updates.insert("c1".to_string(), (AccessMode::ReadWrite, 1));
    balancer.assign(updates).await.unwrap();
    balancer.confirm("c1").await.unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(1), deltas.recv())
        .await
        .expect("discovery stream should emit a frame")
        .expect("channel should stay open");
    assert!(frame.added.contains_key("c1"));
    assert!(frame.changed.is_empty());
    assert!(frame.removed.is_empty());

    let (node, confirmed) = balancer.locate("c1").await.unwrap();
    assert_eq!(node, 1);
    assert!(confirmed);

    cancel.cancel();
}

#[tokio::test]
async fn node_loss_triggers_a_changed_delta_on_reassignment() {
    let meta_store = Arc::new(MemStore::new());
    let balancer = ChannelBalancer::new(meta_store, Default::default()).await.unwrap();

    let mut updates = HashMap::new();
    updates.insert("c1".to_string(), (AccessMode::ReadWrite, 1));
    balancer.assign(updates).await.unwrap();
    balancer.confirm("c1").await.unwrap();

    let (_ack_tx, ack_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let mut deltas = discovery::stream(balancer.clone(), ack_rx, cancel.clone());
    // Drain the initial full-add frame before triggering the reassignment.
    let _ = tokio::time::timeout(Duration::from_secs(1), deltas.recv()).await.unwrap();

    balancer.mark_unavailable(vec!["c1".to_string()]).await.unwrap();
    let mut reassign = HashMap::new();
    reassign.insert("c1".to_string(), (AccessMode::ReadWrite, 2));
    balancer.assign(reassign).await.unwrap();
    balancer.confirm("c1").await.unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(1), deltas.recv())
        .await
        .expect("discovery stream should emit the reassignment")
        .expect("channel should stay open");
    assert!(frame.changed.contains_key("c1") || frame.added.contains_key("c1"));

    let (node, _) = balancer.locate("c1").await.unwrap();
    assert_eq!(node, 2);

    cancel.cancel();
}

#[tokio::test]
async fn assigning_the_same_layout_twice_is_a_no_op() {
    let meta_store = Arc::new(MemStore::new());
    let balancer = ChannelBalancer::new(meta_store, Default::default()).await.unwrap();

    let mut updates = HashMap::new();
    updates.insert("c1".to_string(), (AccessMode::ReadWrite, 1));
    balancer.assign(updates.clone()).await.unwrap();
    balancer.confirm("c1").await.unwrap();
    let (version_before, _) = {
        let view = balancer.current_view().await;
        (view.version, ())
    };

    balancer.assign(updates).await.unwrap();
    let view_after = balancer.current_view().await;
    assert_eq!(view_after.version, version_before);
}
