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

//! Hybrid slow start.
//!
//! Slow start can overshoot the ideal send rate and cause heavy packet
//! loss. Hybrid slow start inspects the minimum RTT of the first few
//! samples of each round; an increase over the session minimum is taken
//! as a sign that the bottleneck queue is filling, and slow start is
//! exited before loss occurs.

use std::time::Duration;

/// Number of RTT samples inspected at the start of each round.
const MIN_SAMPLES: u64 = 8;

/// Exponent of the divisor applied to the session minimum RTT when
/// deriving the delay increase threshold (right shift by 3, i.e. /8).
const DELAY_FACTOR_EXP: u32 = 3;

/// Delay increase detection only exits slow start above this congestion
/// window, in packets.
const LOW_WINDOW: u64 = 16;

/// Lower bound of the delay increase threshold, in microseconds.
const DELAY_MIN_THRESHOLD_US: u128 = 4000;

/// Upper bound of the delay increase threshold, in microseconds.
const DELAY_MAX_THRESHOLD_US: u128 = 16000;

/// Delay increase detector for slow start exit.
#[derive(Debug, Default)]
pub struct HybridSlowStart {
    /// Whether the current receive round has been started.
    started: bool,

    /// Whether a delay increase has been found.
    found: bool,

    /// Last packet number sent.
    last_sent_pkt_num: u64,

    /// End of the current receive round.
    end_pkt_num: Option<u64>,

    /// Number of RTT samples in the current round.
    rtt_sample_count: u64,

    /// The minimum RTT of the current round.
    current_min_rtt: Duration,
}

impl HybridSlowStart {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart the detection, e.g. after a retransmission timeout.
    pub fn restart(&mut self) {
        self.started = false;
        self.found = false;
    }

    pub fn on_packet_sent(&mut self, packet_number: u64) {
        self.last_sent_pkt_num = packet_number;
    }

    /// End the round when the final packet of the burst is received; the
    /// next incoming ACK starts a new one.
    pub fn on_packet_acked(&mut self, acked_packet_number: u64) {
        if self.is_end_of_round(acked_packet_number) {
            self.started = false;
        }
    }

    fn start_receive_round(&mut self, last_sent: u64) {
        self.end_pkt_num = Some(last_sent);
        self.current_min_rtt = Duration::ZERO;
        self.rtt_sample_count = 0;
        self.started = true;
    }

    fn is_end_of_round(&self, ack: u64) -> bool {
        match self.end_pkt_num {
            None => true,
            Some(num) => num <= ack,
        }
    }

    /// Check whether the delay increase warrants leaving slow start.
    ///
    /// Only the lowest RTT of each burst is compared against the session
    /// minimum, and only the first `MIN_SAMPLES` samples of the round
    /// are considered, so jitter within a burst does not trigger a
    /// premature exit. `congestion_window` is in packets.
    pub fn should_exit_slow_start(
        &mut self,
        latest_rtt: Duration,
        min_rtt: Duration,
        congestion_window: u64,
    ) -> bool {
        if !self.started {
            // Time to start the receive round.
            self.start_receive_round(self.last_sent_pkt_num);
        }

        if self.found {
            return true;
        }

        self.rtt_sample_count += 1;
        if self.rtt_sample_count <= MIN_SAMPLES
            && (self.current_min_rtt.is_zero() || self.current_min_rtt > latest_rtt)
        {
            self.current_min_rtt = latest_rtt;
        }

        // The check runs once per round, when the sample quorum is in.
        if self.rtt_sample_count == MIN_SAMPLES {
            let threshold_us = (min_rtt.as_micros() >> DELAY_FACTOR_EXP)
                .clamp(DELAY_MIN_THRESHOLD_US, DELAY_MAX_THRESHOLD_US);
            let threshold = Duration::from_micros(threshold_us as u64);

            if self.current_min_rtt > min_rtt + threshold {
                self.found = true;
            }
        }

        congestion_window >= LOW_WINDOW && self.found
    }
}
