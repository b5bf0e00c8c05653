// Copyright (c) 2024 The MPOLIA Authors.
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

use std::cmp;
use std::time::Duration;

/// RTT estimation for a network path
/// See RFC 9001 Section 5
///
/// All accessors return zero until the first sample arrives; the rate
/// aggregation and the retransmission delay rely on the zero value to
/// tell unmeasured paths apart.
#[derive(Copy, Clone, Debug, Default)]
pub struct RttEstimator {
    /// The most recent RTT sample.
    latest_rtt: Duration,

    /// The smoothed RTT of the path is an exponentially weighted moving average
    /// of an endpoint's RTT samples
    smoothed_rtt: Option<Duration>,

    /// The mean deviation estimates the variation in the RTT samples.
    mean_deviation: Duration,

    /// The minimum RTT observed on the path, ignoring ack delay.
    min_rtt: Duration,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the current best RTT estimation, or zero when no sample
    /// has been taken yet.
    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt.unwrap_or(Duration::ZERO)
    }

    /// Return the latest rtt sample
    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    /// Return the Minimum RTT observed so far for this estimator.
    pub fn min_rtt(&self) -> Duration {
        self.min_rtt
    }

    /// Return the variation in the RTT samples using a mean variation.
    pub fn mean_deviation(&self) -> Duration {
        self.mean_deviation
    }

    /// Update estimator with the given RTT sample
    pub fn update(&mut self, ack_delay: Duration, rtt: Duration) {
        self.latest_rtt = rtt;

        if let Some(smoothed_rtt) = self.smoothed_rtt {
            self.min_rtt = cmp::min(self.min_rtt, self.latest_rtt);

            // The endpoint MUST NOT subtract the acknowledgment delay from the
            // RTT sample if the resulting value is smaller than the min_rtt.
            let adjusted_rtt = if self.min_rtt + ack_delay <= self.latest_rtt {
                self.latest_rtt - ack_delay
            } else {
                self.latest_rtt
            };

            let var_sample = if smoothed_rtt > adjusted_rtt {
                smoothed_rtt - adjusted_rtt
            } else {
                adjusted_rtt - smoothed_rtt
            };

            self.mean_deviation = (3 * self.mean_deviation + var_sample) / 4;
            self.smoothed_rtt = Some((7 * smoothed_rtt + adjusted_rtt) / 8);
        } else {
            self.smoothed_rtt = Some(self.latest_rtt);
            self.mean_deviation = self.latest_rtt / 2;
            self.min_rtt = self.latest_rtt;
        }
    }
}
