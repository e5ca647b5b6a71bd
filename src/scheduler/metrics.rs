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

//! Scheduler metrics, registered against a shared `prometheus::Registry`
//! the hosting process exposes on its metrics HTTP endpoint, rather than
//! printing counters ad hoc.

use prometheus::{exponential_buckets, HistogramVec, IntGaugeVec, Registry};

pub struct SchedulerMetrics {
    pub queue_latency_seconds: HistogramVec,
    pub run_latency_seconds: HistogramVec,
    pub in_flight: IntGaugeVec,
}

impl SchedulerMetrics {
    pub fn new(registry: &Registry) -> Self {
        let queue_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "coord_task_queue_latency_seconds",
                "time a task spent in the pending queue before dispatch",
            )
            .buckets(exponential_buckets(0.01, 2.0, 16).expect("static buckets are well-formed")),
            &["kind"],
        )
        .expect("metric registration is static and infallible at startup");

        let run_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "coord_task_run_latency_seconds",
                "time a task spent in-progress before finishing or failing",
            )
            .buckets(exponential_buckets(0.1, 2.0, 16).expect("static buckets are well-formed")),
            &["kind"],
        )
        .expect("metric registration is static and infallible at startup");

        let in_flight = IntGaugeVec::new(
            prometheus::Opts::new("coord_task_in_flight", "tasks currently in the running map, by kind"),
            &["kind"],
        )
        .expect("metric registration is static and infallible at startup");

        registry
            .register(Box::new(queue_latency_seconds.clone()))
            .expect("single registration per process");
        registry
            .register(Box::new(run_latency_seconds.clone()))
            .expect("single registration per process");
        registry
            .register(Box::new(in_flight.clone()))
            .expect("single registration per process");

        Self {
            queue_latency_seconds,
            run_latency_seconds,
            in_flight,
        }
    }

    pub fn for_test() -> Self {
        Self::new(&Registry::new())
    }
}
