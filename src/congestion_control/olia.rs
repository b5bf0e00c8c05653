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

//! OLIA: Opportunistic Linked Increases Algorithm.
//!
//! OLIA is the window coupling rule of Linux MPTCP. Each path keeps a
//! short history of bytes acked between losses and a rational coupling
//! coefficient epsilon; the window update is computed in fixed point so
//! that the growth matches the kernel implementation exactly.
//!
//! See <https://datatracker.ietf.org/doc/html/draft-khalili-mptcp-congestion-control>.

use std::cmp;

/// Fixed point shift for congestion window computations, in bits.
/// Scaling reduces the rounding error of the per-ACK increments.
pub(crate) const SCALE: u32 = 10;

/// Scale a value by the given fixed point shift.
pub(crate) fn olia_scale(val: u64, scale: u32) -> u64 {
    val << scale
}

/// Per-path OLIA state.
#[derive(Debug)]
pub struct Olia {
    /// Total bytes acked when the second to last loss occurred.
    loss1: u64,

    /// Total bytes acked when the last loss occurred.
    loss2: u64,

    /// Total bytes acked so far. Keeps accumulating across losses.
    loss3: u64,

    /// Numerator of the coupling coefficient epsilon: +1 when the path
    /// is in B\M (best quality but not largest window), -1 when it is
    /// in M (largest window), 0 otherwise.
    epsilon_num: i32,

    /// Denominator of the coupling coefficient epsilon. Always >= 1.
    epsilon_den: u32,

    /// Fractional congestion window accumulator, in units of 2^-SCALE
    /// packets. Saturates into a one packet window change.
    cwnd_cnt: i64,
}

impl Olia {
    pub fn new() -> Self {
        Self {
            loss1: 0,
            loss2: 0,
            loss3: 0,
            epsilon_num: 0,
            epsilon_den: 1,
            cwnd_cnt: 0,
        }
    }

    /// Account newly acked bytes since the last loss.
    pub fn on_packet_acked(&mut self, acked_bytes: u64) {
        self.loss3 += acked_bytes;
    }

    /// Rotate the loss history. The current counter is not reset; it
    /// keeps accumulating so the history holds cumulative marks.
    pub fn on_packet_lost(&mut self) {
        self.loss1 = self.loss2;
        self.loss2 = self.loss3;
    }

    /// Smoothed estimate of the bytes acked between two losses: the
    /// larger of the current inter-loss interval and the previous one.
    pub fn smoothed_bytes_between_losses(&self) -> u64 {
        cmp::max(self.loss3 - self.loss2, self.loss2 - self.loss1)
    }

    /// Return the state to its initial value.
    pub fn reset(&mut self) {
        self.loss1 = 0;
        self.loss2 = 0;
        self.loss3 = 0;
        self.epsilon_num = 0;
        self.epsilon_den = 1;
        self.cwnd_cnt = 0;
    }

    pub(crate) fn set_epsilon(&mut self, num: i32, den: u32) {
        self.epsilon_num = num;
        self.epsilon_den = cmp::max(den, 1);
    }

    pub fn epsilon_num(&self) -> i32 {
        self.epsilon_num
    }

    pub fn epsilon_den(&self) -> u32 {
        self.epsilon_den
    }

    /// Compute the congestion window after an ACK.
    ///
    /// `current_cwnd` is the window in packets, `rate` the squared
    /// aggregate rate over the coupled set, and `cwnd_scaled` the window
    /// shifted by `SCALE`. The increment accumulates in `cwnd_cnt` and
    /// saturates into a one packet change; the returned window moves by
    /// at most one packet and never drops below one. The caller is
    /// responsible for clamping against its min/max window.
    pub fn cwnd_after_ack(&mut self, current_cwnd: u64, rate: u64, cwnd_scaled: u64) -> u64 {
        let mut new_cwnd = current_cwnd;
        let epsilon_den = u64::from(self.epsilon_den);

        let mut inc_den = epsilon_den * current_cwnd * rate;
        if inc_den == 0 {
            inc_den = 1;
        }

        // Compute the increasing term, in fixed point to reduce the
        // rounding effect.
        if self.epsilon_num == -1 {
            if epsilon_den * cwnd_scaled * cwnd_scaled < rate {
                let inc_num = rate - epsilon_den * cwnd_scaled * cwnd_scaled;
                self.cwnd_cnt -= (olia_scale(inc_num, SCALE) / inc_den) as i64;
            } else {
                let inc_num = epsilon_den * cwnd_scaled * cwnd_scaled - rate;
                self.cwnd_cnt += (olia_scale(inc_num, SCALE) / inc_den) as i64;
            }
        } else {
            let inc_num = self.epsilon_num as u64 * rate + epsilon_den * cwnd_scaled * cwnd_scaled;
            self.cwnd_cnt += (olia_scale(inc_num, SCALE) / inc_den) as i64;
        }

        if self.cwnd_cnt >= (1 << SCALE) - 1 {
            new_cwnd += 1;
            self.cwnd_cnt = 0;
        } else if self.cwnd_cnt <= -(1 << SCALE) + 1 {
            new_cwnd = cmp::max(1, current_cwnd.saturating_sub(1));
            self.cwnd_cnt = 0;
        }

        new_cwnd
    }

    #[cfg(test)]
    pub(crate) fn cwnd_cnt(&self) -> i64 {
        self.cwnd_cnt
    }
}

impl Default for Olia {
    fn default() -> Self {
        Self::new()
    }
}
