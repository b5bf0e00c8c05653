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

//! Per-path OLIA sender.
//!
//! Each network path runs one `PathSender`: a Reno-style slow start and
//! recovery machine whose congestion avoidance growth is coupled to the
//! other paths of the connection through the OLIA rule. The coupling
//! reads the most recent window, RTT and loss history of every peer in
//! the coupled set; the set itself comes from shared bottleneck
//! detection.

use std::cmp;
use std::time::Duration;
use std::time::Instant;

use log::*;
use slab::Slab;

use super::hybrid_slow_start::HybridSlowStart;
use super::olia::olia_scale;
use super::olia::Olia;
use super::olia::SCALE;
use super::prr::PrrSender;
use super::sbd::SbdState;
use super::CongestionStats;
use crate::rtt::RttEstimator;
use crate::RecoveryConfig;
use crate::INF_DURATION;
use crate::MAX_BURST_PACKETS;

/// Multiplicative decrease factor of a single emulated Reno connection.
/// The effective factor after a loss is `(n - 1 + RENO_BETA) / n` for
/// `n` emulated connections.
const RENO_BETA: f32 = 0.7;

/// Olia sender configuration.
#[derive(Debug, Clone)]
pub struct OliaConfig {
    /// MSS in bytes, for packet/byte conversion.
    max_datagram_size: u64,

    /// Minimal congestion window in packets.
    min_congestion_window: u64,

    /// Initial congestion window in packets.
    initial_congestion_window: u64,

    /// Upper bound for the congestion window in packets, also the
    /// initial slow start threshold.
    initial_max_congestion_window: u64,

    /// Number of emulated Reno connections.
    num_connections: u32,

    /// Exit slow start with a large cutback of the congestion window.
    slow_start_large_reduction: bool,
}

impl OliaConfig {
    pub fn from(conf: &RecoveryConfig) -> Self {
        Self {
            max_datagram_size: conf.max_datagram_size as u64,
            min_congestion_window: conf.min_congestion_window,
            initial_congestion_window: conf.initial_congestion_window,
            initial_max_congestion_window: conf.initial_max_congestion_window,
            num_connections: cmp::max(conf.num_emulated_connections, 1),
            slow_start_large_reduction: conf.slow_start_large_reduction,
        }
    }
}

impl Default for OliaConfig {
    fn default() -> Self {
        Self::from(&RecoveryConfig::default())
    }
}

/// Congestion control state of one path.
pub struct PathSender {
    /// Configuration.
    config: OliaConfig,

    /// RTT estimator for this path.
    pub(crate) rtt: RttEstimator,

    /// Slow start exit detector.
    hystart: HybridSlowStart,

    /// Pacer for packets sent during loss recovery.
    prr: PrrSender,

    /// OLIA coupling state.
    pub(crate) olia: Olia,

    /// Shared bottleneck detection state.
    pub(crate) sbd: SbdState,

    /// Congestion statistics.
    stats: CongestionStats,

    /// Congestion window in packets.
    pub(crate) congestion_window: u64,

    /// Slow start threshold in packets.
    slowstart_threshold: u64,

    /// Minimum congestion window in packets.
    min_congestion_window: u64,

    /// Maximum congestion window in packets.
    max_congestion_window: u64,

    /// The largest packet number sent so far.
    largest_sent_pkt_num: u64,

    /// The largest packet number acked so far.
    largest_acked_pkt_num: u64,

    /// The largest packet number outstanding when the last window
    /// cutback occurred.
    largest_sent_at_last_cutback: u64,

    /// Whether the last loss event caused an exit from slow start.
    last_cutback_exited_slowstart: bool,

    /// When true, exit slow start with a large cutback of the
    /// congestion window.
    slow_start_large_reduction: bool,

    /// Number of emulated Reno connections.
    num_connections: u32,

    /// ACK counter from the Reno implementation, reset on loss.
    congestion_window_count: u64,
}

impl PathSender {
    pub fn new(config: OliaConfig) -> Self {
        let mss = config.max_datagram_size;
        Self {
            rtt: RttEstimator::new(),
            hystart: HybridSlowStart::new(),
            prr: PrrSender::new(mss),
            olia: Olia::new(),
            sbd: SbdState::new(),
            stats: CongestionStats::default(),
            congestion_window: config.initial_congestion_window,
            slowstart_threshold: config.initial_max_congestion_window,
            min_congestion_window: config.min_congestion_window,
            max_congestion_window: config.initial_max_congestion_window,
            largest_sent_pkt_num: 0,
            largest_acked_pkt_num: 0,
            largest_sent_at_last_cutback: 0,
            last_cutback_exited_slowstart: false,
            slow_start_large_reduction: config.slow_start_large_reduction,
            num_connections: config.num_connections,
            congestion_window_count: 0,
            config,
        }
    }

    pub fn name(&self) -> &str {
        "OLIA"
    }

    /// Callback after a packet was sent out. Returns whether the caller
    /// should count the packet against bytes in flight.
    pub fn on_packet_sent(
        &mut self,
        _now: Instant,
        _bytes_in_flight: u64,
        packet_number: u64,
        bytes: u64,
        is_retransmittable: bool,
    ) -> bool {
        if !is_retransmittable {
            return false;
        }
        if self.in_recovery() {
            // PRR is used when in recovery.
            self.prr.on_packet_sent(bytes);
        }
        self.largest_sent_pkt_num = packet_number;
        self.hystart.on_packet_sent(packet_number);
        true
    }

    /// Per-path bookkeeping for an acked packet. Returns false when the
    /// path is in recovery and the ACK went to PRR instead of window
    /// growth.
    pub(crate) fn begin_ack(&mut self, packet_number: u64, acked_bytes: u64) -> bool {
        self.stats.packets_acked_in_total += 1;
        self.stats.bytes_acked_in_total = self.stats.bytes_acked_in_total.saturating_add(acked_bytes);
        self.largest_acked_pkt_num = cmp::max(packet_number, self.largest_acked_pkt_num);

        if self.in_recovery() {
            self.prr.on_packet_acked(acked_bytes);
            return false;
        }
        self.olia.on_packet_acked(acked_bytes);
        true
    }

    /// Gates before any window growth, the OWD sample fold-in and the
    /// slow start increment. Returns true when the coupled OLIA branch
    /// still has to run.
    pub(crate) fn prepare_increase(&mut self, bytes_in_flight: u64, owd: Option<Duration>) -> bool {
        // Do not grow the window unless the sender actually uses it.
        if !self.is_cwnd_limited(bytes_in_flight) {
            return false;
        }
        if self.congestion_window >= self.max_congestion_window {
            return false;
        }
        if let Some(owd) = owd {
            self.sbd.record_owd(owd);
        }
        if self.in_slow_start() {
            // Exponential growth, one packet per ACK.
            self.congestion_window += 1;
            return false;
        }
        true
    }

    /// Apply the OLIA window update, with the aggregate rate already
    /// computed over the coupled set.
    pub(crate) fn apply_coupled_increase(&mut self, rate: u64) {
        let cwnd_scaled = olia_scale(self.congestion_window, SCALE);
        let cwnd = self
            .olia
            .cwnd_after_ack(self.congestion_window, rate, cwnd_scaled);
        self.congestion_window = cwnd.clamp(self.min_congestion_window, self.max_congestion_window);
    }

    /// Post-growth part of the ACK processing. Runs after the window
    /// update so a window that just left slow start is seen as such.
    pub(crate) fn end_ack(&mut self, packet_number: u64) {
        if self.in_slow_start() {
            self.hystart.on_packet_acked(packet_number);
        }
    }

    /// Process a lost packet.
    ///
    /// Losses at or below the last cutback belong to the previous loss
    /// epoch and only feed the slow start loss statistics.
    pub fn on_packet_lost(&mut self, packet_number: u64, lost_bytes: u64, bytes_in_flight: u64) {
        self.stats.packets_lost_in_total += 1;
        self.stats.bytes_lost_in_total = self.stats.bytes_lost_in_total.saturating_add(lost_bytes);

        if packet_number <= self.largest_sent_at_last_cutback {
            if self.last_cutback_exited_slowstart {
                self.stats.slowstart_packets_lost += 1;
                self.stats.slowstart_bytes_lost = self
                    .stats
                    .slowstart_bytes_lost
                    .saturating_add(lost_bytes);
                if self.slow_start_large_reduction {
                    let mss = self.config.max_datagram_size;
                    // One packet off the window for every MSS of bytes
                    // lost in the prior epoch.
                    if self.stats.slowstart_packets_lost == 1
                        || (self.stats.slowstart_bytes_lost / mss)
                            > (self.stats.slowstart_bytes_lost - lost_bytes) / mss
                    {
                        self.congestion_window = cmp::max(
                            self.congestion_window.saturating_sub(1),
                            self.min_congestion_window,
                        );
                    }
                    self.slowstart_threshold = self.congestion_window;
                }
            }
            return;
        }

        self.last_cutback_exited_slowstart = self.in_slow_start();
        if self.in_slow_start() {
            self.stats.slowstart_packets_lost += 1;
        }

        self.prr.on_packet_lost(bytes_in_flight);
        self.olia.on_packet_lost();

        if self.slow_start_large_reduction && self.in_slow_start() {
            self.congestion_window = self.congestion_window.saturating_sub(1);
        } else {
            self.congestion_window =
                (self.congestion_window as f32 * self.reno_beta()) as u64;
        }
        if self.congestion_window < self.min_congestion_window {
            self.congestion_window = self.min_congestion_window;
        }
        self.slowstart_threshold = self.congestion_window;
        self.largest_sent_at_last_cutback = self.largest_sent_pkt_num;
        // Reset the ACK count from congestion avoidance mode; counting
        // starts again out of recovery.
        self.congestion_window_count = 0;

        trace!(
            "{} cutback. cwnd={} ssthresh={} largest_sent_at_last_cutback={}",
            self.name(),
            self.congestion_window,
            self.slowstart_threshold,
            self.largest_sent_at_last_cutback,
        );
    }

    /// Process a retransmission timeout.
    pub fn on_retransmission_timeout(&mut self, packets_retransmitted: bool) {
        self.largest_sent_at_last_cutback = 0;
        if !packets_retransmitted {
            return;
        }
        self.hystart.restart();
        self.olia.reset();
        self.sbd.reset();
        self.slowstart_threshold = self.congestion_window / 2;
        self.congestion_window = self.min_congestion_window;

        trace!(
            "{} rto. cwnd={} ssthresh={}",
            self.name(),
            self.congestion_window,
            self.slowstart_threshold,
        );
    }

    /// Reset the sender after the connection migrated to another path.
    pub fn on_connection_migration(&mut self) {
        self.hystart.restart();
        self.prr = PrrSender::new(self.config.max_datagram_size);
        self.largest_sent_pkt_num = 0;
        self.largest_acked_pkt_num = 0;
        self.largest_sent_at_last_cutback = 0;
        self.last_cutback_exited_slowstart = false;
        self.olia.reset();
        self.sbd.reset();
        self.congestion_window_count = 0;
        self.congestion_window = self.config.initial_congestion_window;
        self.slowstart_threshold = self.config.initial_max_congestion_window;
        self.max_congestion_window = self.config.initial_max_congestion_window;
    }

    /// Whether the next packet may leave now, never (until the next
    /// ACK), or after the recovery pacer releases it.
    pub fn time_until_send(&self, _now: Instant, bytes_in_flight: u64) -> Duration {
        if self.in_recovery() {
            // PRR is used when in recovery.
            return self.prr.time_until_send(
                self.congestion_window(),
                bytes_in_flight,
                self.slow_start_threshold(),
            );
        }
        if self.congestion_window() > bytes_in_flight {
            return Duration::ZERO;
        }
        INF_DURATION
    }

    /// Congestion window in bytes.
    pub fn congestion_window(&self) -> u64 {
        self.congestion_window * self.config.max_datagram_size
    }

    /// Congestion window in packets.
    pub fn congestion_window_packets(&self) -> u64 {
        self.congestion_window
    }

    /// Slow start threshold in bytes.
    pub fn slow_start_threshold(&self) -> u64 {
        self.slowstart_threshold * self.config.max_datagram_size
    }

    /// Slow start threshold in packets.
    pub fn slowstart_threshold_packets(&self) -> u64 {
        self.slowstart_threshold
    }

    pub fn in_slow_start(&self) -> bool {
        self.congestion_window() < self.slow_start_threshold()
    }

    pub fn in_recovery(&self) -> bool {
        self.largest_acked_pkt_num <= self.largest_sent_at_last_cutback
            && self.largest_acked_pkt_num != 0
    }

    /// Whether the sender is close enough to its window for growth to be
    /// justified.
    pub fn is_cwnd_limited(&self, bytes_in_flight: u64) -> bool {
        let congestion_window = self.congestion_window();
        if bytes_in_flight >= congestion_window {
            return true;
        }
        let available_bytes = congestion_window - bytes_in_flight;
        let slow_start_limited = self.in_slow_start() && bytes_in_flight > congestion_window / 2;
        slow_start_limited || available_bytes <= MAX_BURST_PACKETS * self.config.max_datagram_size
    }

    /// Leave slow start by pulling the threshold down to the current
    /// window.
    pub fn exit_slowstart(&mut self) {
        self.slowstart_threshold = self.congestion_window;
    }

    /// Leave slow start early when the delay increase detector fires.
    pub fn maybe_exit_slow_start(&mut self) {
        if self.in_slow_start()
            && self.hystart.should_exit_slow_start(
                self.rtt.latest_rtt(),
                self.rtt.min_rtt(),
                self.congestion_window,
            )
        {
            self.exit_slowstart();
        }
    }

    /// The effective multiplier of an ensemble of `num_connections`
    /// Reno connections backing off on a single loss event.
    pub fn reno_beta(&self) -> f32 {
        (self.num_connections as f32 - 1.0 + RENO_BETA) / self.num_connections as f32
    }

    pub fn smoothed_rtt(&self) -> Duration {
        self.rtt.smoothed_rtt()
    }

    /// The RTO retransmission delay, or zero while the RTT is unmeasured.
    pub fn retransmission_delay(&self) -> Duration {
        if self.rtt.smoothed_rtt().is_zero() {
            return Duration::ZERO;
        }
        self.rtt.smoothed_rtt() + self.rtt.mean_deviation() * 4
    }

    /// Estimated bandwidth in bytes per second, or zero while the RTT is
    /// unmeasured.
    pub fn bandwidth_estimate(&self) -> u64 {
        let srtt = self.rtt.smoothed_rtt();
        if srtt.is_zero() {
            return 0;
        }
        (self.congestion_window() as f64 / srtt.as_secs_f64()) as u64
    }

    /// Feed an RTT sample from the ACK processing.
    pub fn update_rtt(&mut self, ack_delay: Duration, latest_rtt: Duration) {
        self.rtt.update(ack_delay, latest_rtt);
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Set the number of emulated Reno connections, floored at 1.
    pub fn set_num_emulated_connections(&mut self, n: u32) {
        self.num_connections = cmp::max(n, 1);
    }

    pub fn set_slow_start_large_reduction(&mut self, enabled: bool) {
        self.slow_start_large_reduction = enabled;
    }

    /// The slow start exit detector, exposed for inspection.
    pub fn hybrid_slow_start(&self) -> &HybridSlowStart {
        &self.hystart
    }

    /// The shared bottleneck detection state of this path.
    pub fn sbd(&self) -> &SbdState {
        &self.sbd
    }

    pub fn stats(&self) -> &CongestionStats {
        &self.stats
    }
}

impl std::fmt::Debug for PathSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ", self.name())?;
        write!(f, "cwnd={} ", self.congestion_window)?;
        write!(f, "ssthresh={} ", self.slowstart_threshold)?;
        write!(f, "largest_sent={} ", self.largest_sent_pkt_num)?;
        write!(f, "largest_acked={} ", self.largest_acked_pkt_num)?;
        write!(f, "cwnd_count={} ", self.congestion_window_count)?;
        write!(f, "eps={}/{} ", self.olia.epsilon_num(), self.olia.epsilon_den())?;
        write!(f, "srtt={:?}", self.rtt.smoothed_rtt())
    }
}

/// Largest congestion window over the given set, in packets.
pub(crate) fn max_cwnd_in(paths: &Slab<PathSender>, set: &[usize]) -> u64 {
    let mut best_cwnd = 0;
    for &id in set {
        if let Some(sender) = paths.get(id) {
            best_cwnd = cmp::max(best_cwnd, sender.congestion_window);
        }
    }
    best_cwnd
}

/// Squared smoothed RTT in nanoseconds, widened so the cross-multiplied
/// quality comparisons cannot overflow.
fn rtt_squared(rtt: &RttEstimator) -> u128 {
    let ns = rtt.smoothed_rtt().as_nanos();
    ns * ns
}

/// Aggregate rate of the coupled set, weighted by this path's RTT and
/// squared. Paths without an RTT sample are skipped; the lower bound of
/// one keeps the value usable as a divisor.
pub(crate) fn aggregate_rate(paths: &Slab<PathSender>, set: &[usize], path_rtt: Duration) -> u64 {
    let mut rate: u64 = 1;
    for &id in set {
        let sender = match paths.get(id) {
            Some(s) => s,
            None => continue,
        };
        let srtt = sender.rtt.smoothed_rtt();
        if srtt.is_zero() {
            continue;
        }
        let scaled_num =
            olia_scale(sender.congestion_window, SCALE) * path_rtt.as_nanos() as u64;
        rate += scaled_num / srtt.as_nanos() as u64;
    }
    rate.saturating_mul(rate)
}

/// Classify the coupled set into M (largest windows) and B\M (best
/// quality but not largest) and write the epsilon fraction into each
/// member's OLIA state.
pub(crate) fn assign_epsilon(paths: &mut Slab<PathSender>, set: &[usize]) {
    let max_cwnd = max_cwnd_in(paths, set);

    // Select the best path by bytes-per-RTT^2, cross-multiplied to avoid
    // division. best_rtt_sq starts at zero so the first member always
    // seeds the comparison.
    let mut best_rtt_sq: u128 = 0;
    let mut best_bytes: u64 = 0;
    for &id in set {
        let sender = match paths.get(id) {
            Some(s) => s,
            None => continue,
        };
        let rtt_sq = rtt_squared(&sender.rtt);
        let bytes = sender.olia.smoothed_bytes_between_losses();
        if bytes as u128 * best_rtt_sq >= best_bytes as u128 * rtt_sq {
            best_rtt_sq = rtt_sq;
            best_bytes = bytes;
        }
    }

    // Count the members of M and B\M.
    let mut m: u32 = 0;
    let mut b_not_m: u32 = 0;
    for &id in set {
        let sender = match paths.get(id) {
            Some(s) => s,
            None => continue,
        };
        if sender.congestion_window == max_cwnd {
            m += 1;
        } else {
            let rtt_sq = rtt_squared(&sender.rtt);
            let bytes = sender.olia.smoothed_bytes_between_losses();
            if bytes as u128 * best_rtt_sq >= best_bytes as u128 * rtt_sq {
                b_not_m += 1;
            }
        }
    }

    // Write epsilon: boosted for B\M, penalized for M, neutral for the
    // rest. Without any B\M member the whole set stays uncoupled.
    for &id in set {
        let sender = match paths.get_mut(id) {
            Some(s) => s,
            None => continue,
        };
        if b_not_m == 0 {
            sender.olia.set_epsilon(0, 1);
            continue;
        }
        let rtt_sq = rtt_squared(&sender.rtt);
        let bytes = sender.olia.smoothed_bytes_between_losses();
        if sender.congestion_window < max_cwnd
            && bytes as u128 * best_rtt_sq >= best_bytes as u128 * rtt_sq
        {
            sender
                .olia
                .set_epsilon(1, set.len() as u32 * b_not_m);
        } else if sender.congestion_window == max_cwnd {
            sender.olia.set_epsilon(-1, set.len() as u32 * m);
        } else {
            sender.olia.set_epsilon(0, 1);
        }
    }
}
