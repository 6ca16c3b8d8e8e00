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
use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone)]
#[structopt(name = "weir-bench")]
pub struct Options {
    /// producers is the number of producer threads per run.
    #[structopt(long, default_value = "10")]
    pub producers: usize,
    /// consumers is the number of drain threads per run.
    #[structopt(long, default_value = "2")]
    pub consumers: usize,
    /// batches_per_producer is how many put_many calls each producer makes.
    #[structopt(long, default_value = "100")]
    pub batches_per_producer: usize,
    /// batch_len is the element count of one put_many call.
    #[structopt(long, default_value = "100")]
    pub batch_len: usize,
    /// max_batch_size bounds what one pop_many hands back.
    #[structopt(long, default_value = "1000")]
    pub max_batch_size: usize,
    /// measure_secs is the timed window of the partitioned queue run.
    #[structopt(long, default_value = "3")]
    pub measure_secs: u64,
    /// partition_workers is the drain worker count of the partitioned run,
    /// zero means one per core.
    #[structopt(long, default_value = "0")]
    pub partition_workers: usize,
    /// json dumps the report as json instead of logging tables.
    #[structopt(long)]
    pub json: bool,
}

impl Options {
    pub fn init() -> Options {
        Options::from_args()
    }
}
