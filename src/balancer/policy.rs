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

//! Pluggable balancing policy. The only shipped implementation is
//! `vchannel_fair` (the formulation is pinned in DESIGN.md): weight(node) is
//! the sum of vchannel counts of channels currently assigned to it, and the
//! policy greedily minimizes the maximum node weight (LPT bin-packing,
//! largest-weight-first), breaking ties by affinity then lowest node id, and
//! only produces a layout that differs from the current one when the
//! imbalance exceeds `rebalance_threshold` or some channel is unplaced.

use std::collections::HashMap;

use crate::model::{ChannelState, PChannelMeta, WorkerId};

pub struct PolicyInput<'a> {
    pub channels: &'a HashMap<String, PChannelMeta>,
    /// channel name -> number of vchannels (collections/partitions) riding it.
    /// Channels absent from this map are assumed to carry a single vchannel.
    pub vchannel_counts: &'a HashMap<String, u32>,
    pub nodes: &'a [WorkerId],
    pub rebalance_threshold: f64,
}

/// `(current_layout, node_set) -> desired_layout`.
pub trait BalancePolicy: Send + Sync {
    fn name(&self) -> &'static str;
    fn desired_layout(&self, input: &PolicyInput<'_>) -> HashMap<String, WorkerId>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct VchannelFairPolicy;

impl VchannelFairPolicy {
    fn weight_of(vchannel_counts: &HashMap<String, u32>, name: &str) -> u32 {
        *vchannel_counts.get(name).unwrap_or(&1)
    }

    /// Current per-node weight restricted to channels assigned to a node
    /// still present in `nodes`, and the set of channel names that are not
    /// currently placed on a live node and therefore must be placed.
    fn current_state(
        channels: &HashMap<String, PChannelMeta>,
        vchannel_counts: &HashMap<String, u32>,
        nodes: &[WorkerId],
    ) -> (HashMap<WorkerId, u32>, Vec<String>) {
        let mut weight: HashMap<WorkerId, u32> = nodes.iter().map(|n| (*n, 0)).collect();
        let mut unplaced = Vec::new();
        for (name, meta) in channels {
            let placed = matches!(meta.state, ChannelState::Assigned | ChannelState::Assigning)
                && nodes.contains(&meta.assignee);
            if placed {
                *weight.entry(meta.assignee).or_insert(0) +=
                    Self::weight_of(vchannel_counts, name);
            } else {
                unplaced.push(name.clone());
            }
        }
        (weight, unplaced)
    }

    fn imbalance_ratio(weight: &HashMap<WorkerId, u32>) -> f64 {
        let max = weight.values().copied().max().unwrap_or(0);
        let min = weight.values().copied().min().unwrap_or(0);
        if max == 0 {
            0.0
        } else {
            (max - min) as f64 / max as f64
        }
    }
}

impl BalancePolicy for VchannelFairPolicy {
    fn name(&self) -> &'static str {
        "vchannel_fair"
    }

    fn desired_layout(&self, input: &PolicyInput<'_>) -> HashMap<String, WorkerId> {
        if input.nodes.is_empty() {
            return HashMap::new();
        }

        let (weight, unplaced) =
            Self::current_state(input.channels, input.vchannel_counts, input.nodes);

        let needs_recompute =
            !unplaced.is_empty() || Self::imbalance_ratio(&weight) > input.rebalance_threshold;

        if !needs_recompute {
            // Stable: keep the current layout verbatim (no-op for the balancer's diff).
            return input
                .channels
                .iter()
                .filter(|(_, m)| {
                    matches!(m.state, ChannelState::Assigned | ChannelState::Assigning)
                        && input.nodes.contains(&m.assignee)
                })
                .map(|(name, m)| (name.clone(), m.assignee))
                .collect();
        }

        // Full LPT recompute: largest-weight-first, placing each channel on
        // the currently least-loaded node, with affinity then lowest-id
        // tie-break.
        let mut names: Vec<&String> = input.channels.keys().collect();
        names.sort_by(|a, b| {
            let wa = Self::weight_of(input.vchannel_counts, a);
            let wb = Self::weight_of(input.vchannel_counts, b);
            wb.cmp(&wa).then_with(|| a.cmp(b))
        });

        let mut running_weight: HashMap<WorkerId, u32> =
            input.nodes.iter().map(|n| (*n, 0)).collect();
        let mut layout = HashMap::new();

        for name in names {
            let meta = &input.channels[name];
            let w = Self::weight_of(input.vchannel_counts, name);
            let min_weight = running_weight.values().copied().min().unwrap_or(0);
            let tied: Vec<WorkerId> = input
                .nodes
                .iter()
                .copied()
                .filter(|n| running_weight.get(n).copied().unwrap_or(0) == min_weight)
                .collect();

            let target = if tied.contains(&meta.assignee) {
                meta.assignee
            } else {
                *tied.iter().min().expect("node set checked non-empty above")
            };

            *running_weight.entry(target).or_insert(0) += w;
            layout.insert(name.clone(), target);
        }

        layout
    }
}
