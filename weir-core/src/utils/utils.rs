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
use flexi_logger::Logger;

pub fn init_all_utils() {
    Logger::with_env_or_str("info").start().unwrap();
}

/// group_digits formats a count with thousands separators for the benchmark
/// tables. 1234567 becomes 1,234,567.
pub fn group_digits(count: u64) -> String {
    let digits = count.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx != 0 && (digits.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    grouped
}

/// this mod contains test helper functions for the whole project level.
#[cfg(test)]
pub mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    /// wait_until spins on the given condition and panics if it does not turn
    /// true before the deadline. Used by tests that wait on worker threads.
    pub fn wait_until<F: FnMut() -> bool>(mut condition: F, deadline: Duration) {
        let start = Instant::now();
        while !condition() {
            if start.elapsed() > deadline {
                panic!("condition not reached within {:?}", deadline);
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_group_digits() {
        assert_eq!(super::group_digits(0), "0");
        assert_eq!(super::group_digits(999), "999");
        assert_eq!(super::group_digits(1000), "1,000");
        assert_eq!(super::group_digits(1234567), "1,234,567");
    }
}
