// Copyright [2020] [Balaji Rajendran]
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
use log::info;
use weir_core::queue::queue::QueueKind;
use weir_core::utils::utils::init_all_utils;
mod options;
mod workload;
use options::options::Options;
use workload::workload::{log_report, run_drain_to_exhaustion, run_partitioned_throughput, BenchReport};

fn main() {
    let opt = Options::init();
    init_all_utils();
    info!(
        "running weir benchmark with {} producers and {} consumers",
        opt.producers, opt.consumers
    );
    let mut drain_runs = Vec::new();
    for &kind in QueueKind::all().iter() {
        info!("drain to exhaustion over the {} queue", kind.name());
        drain_runs.push(run_drain_to_exhaustion(kind, &opt));
    }
    let partition_runs = vec![
        run_partitioned_throughput(&opt, false),
        run_partitioned_throughput(&opt, true),
    ];
    let report = BenchReport {
        drain_runs,
        partition_runs,
    };
    if opt.json {
        println!("{}", serde_json::to_string_pretty(&report).unwrap());
    } else {
        log_report(&report);
    }
}
