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

//! Shared bottleneck detection.
//!
//! Paths whose packets drain through the same bottleneck queue see
//! correlated one-way-delay behavior. Each epoch, the per-path OWD
//! samples are binned and condensed into skewness, variability, key
//! frequency and loss estimators; paths classified as congested are then
//! partitioned into groups believed to share a bottleneck, and the OLIA
//! window coupling is restricted to each group.
//!
//! The estimators follow the summary statistics of RFC 8382.

use std::cmp;
use std::time::Duration;

use rustc_hash::FxHashSet;
use slab::Slab;
use smallvec::SmallVec;

use super::olia_sender::PathSender;

/// Number of OWD bins accumulated per epoch.
pub(crate) const OWD_BINS: usize = 50;

/// Skewness threshold below which a path is classified as congested.
const C_S: f64 = -0.01;

/// Skewness threshold for paths that were congested in the previous
/// epoch (hysteresis).
const C_H: f64 = 0.3;

/// Bound on the skewness difference of grouped paths.
const P_S: f64 = 0.1;

/// Bound on the key frequency difference of grouped paths.
const P_F: f64 = 0.1;

/// Width of the variability band used by the key frequency estimator,
/// as a fraction of var_est.
const P_V: f64 = 0.7;

/// Relative bound on the mean absolute deviation difference of grouped
/// paths.
const P_MAD: f64 = 0.1;

/// Relative bound on the loss proportion difference of grouped paths.
const P_D: f64 = 0.1;

/// Loss proportion above which loss is significant, both for the
/// congested classification and for the grouping predicate.
const P_L: f64 = 0.1;

/// Per-path shared bottleneck detection state.
///
/// The OWD bins and the derived estimators live for one epoch; the
/// congested flag and the group survive until the next decision.
#[derive(Debug)]
pub struct SbdState {
    /// OWD samples of the current epoch, binned by the epoch clock.
    owd: [Vec<Duration>; OWD_BINS],

    /// Index of the bin currently receiving samples.
    current_bin: usize,

    /// Mean OWD of each populated bin, in bin order.
    owd_bin_mean: Vec<Duration>,

    /// Grand mean of the populated bin means.
    owd_base: Duration,

    /// Skewness estimate of the OWD distribution, in [-1, 1]. Values
    /// below zero indicate a filling queue.
    skew_est: f64,

    /// Mean absolute deviation of the samples around their bin mean.
    var_est: Duration,

    /// Frequency of owd_base crossings of the bin mean sequence.
    freq_est: f64,

    /// Packet loss proportion over the epoch.
    pac_est: f64,

    /// Lost packet count at epoch start and end.
    pkt_loss: [u64; 2],

    /// Acked packet count at epoch start and end.
    pkt_ack: [u64; 2],

    /// Congested flag, carried across epochs for hysteresis.
    congested: bool,

    /// Ids of the paths currently coupled with this one, including
    /// itself. Rebuilt by every decision; resolved against the live
    /// path table when used.
    group: FxHashSet<usize>,
}

impl SbdState {
    pub fn new() -> Self {
        Self {
            owd: std::array::from_fn(|_| Vec::new()),
            current_bin: 0,
            owd_bin_mean: Vec::new(),
            owd_base: Duration::ZERO,
            skew_est: 0.0,
            var_est: Duration::ZERO,
            freq_est: 0.0,
            pac_est: 0.0,
            pkt_loss: [0; 2],
            pkt_ack: [0; 2],
            congested: false,
            group: FxHashSet::default(),
        }
    }

    /// Fold a one-way-delay sample into the current bin. Non-positive
    /// samples are malformed and silently skipped.
    pub(crate) fn record_owd(&mut self, owd: Duration) {
        if owd > Duration::ZERO {
            self.owd[self.current_bin].push(owd);
        }
    }

    /// Advance the bin index. The index is owned by the epoch clock;
    /// a late tick parks on the last bin so samples are never dropped.
    pub(crate) fn advance_bin(&mut self) {
        if self.current_bin + 1 < OWD_BINS {
            self.current_bin += 1;
        }
    }

    pub(crate) fn snapshot_epoch_start(&mut self, acked_packets: u64, lost_packets: u64) {
        self.pkt_ack[0] = acked_packets;
        self.pkt_loss[0] = lost_packets;
    }

    pub(crate) fn snapshot_epoch_end(&mut self, acked_packets: u64, lost_packets: u64) {
        self.pkt_ack[1] = acked_packets;
        self.pkt_loss[1] = lost_packets;
    }

    /// Packets acked over the epoch.
    pub fn ack_delta(&self) -> u64 {
        self.pkt_ack[1].saturating_sub(self.pkt_ack[0])
    }

    /// Derive the epoch estimators from the binned samples.
    ///
    /// With no samples in the epoch every estimator stays zero.
    pub(crate) fn compute_estimates(&mut self) {
        let mut total_samples: u64 = 0;
        for bin in self.owd.iter() {
            if bin.is_empty() {
                continue;
            }
            let sum_ns: u64 = bin.iter().map(|v| v.as_nanos() as u64).sum();
            self.owd_bin_mean
                .push(Duration::from_nanos(sum_ns / bin.len() as u64));
            total_samples += bin.len() as u64;
        }
        if total_samples == 0 {
            return;
        }

        let base_ns: u64 = self
            .owd_bin_mean
            .iter()
            .map(|v| v.as_nanos() as u64)
            .sum::<u64>()
            / self.owd_bin_mean.len() as u64;
        self.owd_base = Duration::from_nanos(base_ns);

        // Skewness counts samples below/above the grand mean; the
        // variability is the mean absolute deviation around the sample's
        // own bin mean.
        let mut skew_base: i64 = 0;
        let mut var_base_ns: u64 = 0;
        let mut bin_idx = 0;
        for bin in self.owd.iter() {
            if bin.is_empty() {
                continue;
            }
            let bin_mean = self.owd_bin_mean[bin_idx];
            for &v in bin.iter() {
                let diff = if v > bin_mean {
                    v - bin_mean
                } else {
                    bin_mean - v
                };
                var_base_ns += diff.as_nanos() as u64;
                if v < self.owd_base {
                    skew_base += 1;
                } else if v > self.owd_base {
                    skew_base -= 1;
                }
            }
            bin_idx += 1;
        }
        self.skew_est = skew_base as f64 / total_samples as f64;
        self.var_est = Duration::from_nanos(var_base_ns / total_samples);

        let loss_delta = self.pkt_loss[1].saturating_sub(self.pkt_loss[0]);
        self.pac_est = loss_delta as f64 / cmp::max(1, self.ack_delta()) as f64;

        // Key frequency: count consecutive bin means that jump across
        // the +-P_V * var_est band around the grand mean.
        let band = P_V * self.var_est.as_nanos() as f64;
        let low = base_ns as f64 - band;
        let high = base_ns as f64 + band;
        let means = &self.owd_bin_mean;
        for j in 0..means.len().saturating_sub(1) {
            let a = means[j].as_nanos() as f64;
            let b = means[j + 1].as_nanos() as f64;
            if (a < low && b > high) || (b < low && a > high) {
                self.freq_est += 1.0 / means.len() as f64;
            }
        }
    }

    /// Drop everything accumulated for the finished epoch. The
    /// congested flag, the group and the counter snapshots survive.
    pub(crate) fn clear_epoch(&mut self) {
        for bin in self.owd.iter_mut() {
            bin.clear();
        }
        self.current_bin = 0;
        self.owd_bin_mean.clear();
        self.owd_base = Duration::ZERO;
        self.skew_est = 0.0;
        self.var_est = Duration::ZERO;
        self.freq_est = 0.0;
        self.pac_est = 0.0;
    }

    /// Return the state to its initial value, hysteresis and group
    /// included.
    pub(crate) fn reset(&mut self) {
        *self = SbdState::new();
    }

    pub fn skew_est(&self) -> f64 {
        self.skew_est
    }

    pub fn var_est(&self) -> Duration {
        self.var_est
    }

    pub fn freq_est(&self) -> f64 {
        self.freq_est
    }

    pub fn pac_est(&self) -> f64 {
        self.pac_est
    }

    pub fn congested(&self) -> bool {
        self.congested
    }

    pub fn group(&self) -> &FxHashSet<usize> {
        &self.group
    }

    pub(crate) fn clear_group(&mut self) {
        self.group.clear();
    }

    #[cfg(test)]
    pub(crate) fn seed_estimates(skew: f64, var: Duration, freq: f64, pac: f64) -> Self {
        let mut state = Self::new();
        state.skew_est = skew;
        state.var_est = var;
        state.freq_est = freq;
        state.pac_est = pac;
        state
    }

    #[cfg(test)]
    pub(crate) fn set_group(&mut self, ids: &[usize]) {
        self.group = ids.iter().copied().collect();
    }
}

impl Default for SbdState {
    fn default() -> Self {
        Self::new()
    }
}

/// Similarity predicate between two congested paths.
///
/// Reflexive and symmetric, but not transitive: the grouping below may
/// put two mutually incompatible paths in one group when a chain of
/// frontier members connects them.
fn compat(first: &SbdState, second: &SbdState) -> bool {
    let v = cmp::max(first.var_est, second.var_est).as_nanos() as f64;
    let ploss = first.pac_est.max(second.pac_est);

    if (first.freq_est - second.freq_est).abs() <= P_F
        && (first.skew_est - second.skew_est).abs() <= P_S
        && (first.var_est.as_nanos() as f64 - second.var_est.as_nanos() as f64).abs() <= P_MAD * v
    {
        if ploss > P_L {
            return (first.pac_est - second.pac_est).abs() <= P_D * ploss;
        }
        return true;
    }
    false
}

/// Run the per-epoch grouping decision over the path table.
///
/// Paths not classified as congested all land in one common group; the
/// congested ones are partitioned by `partition`.
pub(crate) fn update_groups(paths: &mut Slab<PathSender>) {
    let mut congested_ids: SmallVec<[usize; 8]> = SmallVec::new();
    let mut clear_ids: FxHashSet<usize> = FxHashSet::default();

    for (id, sender) in paths.iter_mut() {
        let sbd = &mut sender.sbd;
        let was_congested = sbd.congested;
        sbd.congested = sbd.skew_est < C_S
            || (sbd.skew_est < C_H && was_congested)
            || sbd.pac_est > P_L;
        sbd.group.clear();
        if sbd.congested {
            congested_ids.push(id);
        } else {
            clear_ids.insert(id);
        }
    }

    for (_, sender) in paths.iter_mut() {
        if !sender.sbd.congested {
            sender.sbd.group = clear_ids.clone();
        }
    }

    partition(paths, &congested_ids);
}

/// Partition the congested paths into shared bottleneck groups.
///
/// A breadth-first sweep seeded from each unvisited path; a peer joins
/// the group as soon as it is compatible with any frontier member, so
/// the groups are disjoint but members need not be pairwise compatible.
fn partition(paths: &mut Slab<PathSender>, congested: &[usize]) {
    let mut visited: FxHashSet<usize> = FxHashSet::default();

    for &seed in congested {
        if visited.contains(&seed) {
            continue;
        }
        visited.insert(seed);

        let mut queue: SmallVec<[usize; 8]> = SmallVec::new();
        queue.push(seed);
        let mut i = 0;
        while i < queue.len() {
            let p = queue[i];
            i += 1;
            for &q in congested {
                if visited.contains(&q) {
                    continue;
                }
                let similar = match (paths.get(p), paths.get(q)) {
                    (Some(a), Some(b)) => compat(&a.sbd, &b.sbd),
                    _ => false,
                };
                if similar {
                    visited.insert(q);
                    queue.push(q);
                }
            }
        }

        let group: FxHashSet<usize> = queue.iter().copied().collect();
        for &id in queue.iter() {
            if let Some(sender) = paths.get_mut(id) {
                sender.sbd.group = group.clone();
            }
        }
    }
}
