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

//! Multipath controller.
//!
//! The controller exclusively owns the per-path senders and is the entry
//! point for all transport events. The coupled part of the ACK
//! processing lives here because it reads the most recent window, RTT
//! and loss history of every peer in the coupled set. The controller
//! also drives the shared bottleneck detection clock: the external
//! scheduler calls `advance_sbd_bin` on a fixed cadence and
//! `advance_sbd_epoch` for each grouping decision.

use std::time::Duration;
use std::time::Instant;

use log::*;
use slab::Slab;
use smallvec::SmallVec;

use crate::congestion_control::aggregate_rate;
use crate::congestion_control::assign_epsilon;
use crate::congestion_control::sbd;
use crate::congestion_control::CouplingAlgorithm;
use crate::congestion_control::OliaConfig;
use crate::congestion_control::PathSender;
use crate::Config;
use crate::Error;
use crate::Result;

/// Column width of the diagnostic table.
const DUMP_COL_WIDTH: usize = 12;

/// Congestion controller for a multipath connection.
pub struct MultipathController {
    /// Path senders, keyed by path id.
    paths: Slab<PathSender>,

    /// Maximum number of concurrent paths.
    max_paths: usize,

    /// Coupled set selection strategy.
    coupling: CouplingAlgorithm,

    /// Template for new path senders.
    sender_config: OliaConfig,
}

impl MultipathController {
    pub fn new(conf: &Config) -> Self {
        Self {
            paths: Slab::with_capacity(conf.multipath.max_paths),
            max_paths: conf.multipath.max_paths,
            coupling: conf.multipath.coupling_algorithm,
            sender_config: OliaConfig::from(&conf.recovery),
        }
    }

    /// Register a new path and return its id.
    pub fn add_path(&mut self) -> Result<usize> {
        if self.paths.len() >= self.max_paths {
            return Err(Error::Done);
        }
        Ok(self
            .paths
            .insert(PathSender::new(self.sender_config.clone())))
    }

    /// Retire a path. Stale ids lingering in peer groups are filtered
    /// out whenever a group is resolved against the table.
    pub fn remove_path(&mut self, path_id: usize) -> Result<()> {
        self.paths
            .try_remove(path_id)
            .map(|_| ())
            .ok_or(Error::InternalError)
    }

    pub fn get(&self, path_id: usize) -> Result<&PathSender> {
        self.paths.get(path_id).ok_or(Error::InternalError)
    }

    pub fn get_mut(&mut self, path_id: usize) -> Result<&mut PathSender> {
        self.paths.get_mut(path_id).ok_or(Error::InternalError)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn iter(&self) -> slab::Iter<'_, PathSender> {
        self.paths.iter()
    }

    /// Callback after a packet was sent on the given path. Returns
    /// whether the caller should count the packet against bytes in
    /// flight.
    pub fn on_packet_sent(
        &mut self,
        path_id: usize,
        now: Instant,
        bytes_in_flight: u64,
        packet_number: u64,
        bytes: u64,
        is_retransmittable: bool,
    ) -> Result<bool> {
        Ok(self.get_mut(path_id)?.on_packet_sent(
            now,
            bytes_in_flight,
            packet_number,
            bytes,
            is_retransmittable,
        ))
    }

    /// Process an acked packet on the given path.
    ///
    /// Outside of recovery and slow start this runs the coupled window
    /// update: epsilon assignment and rate aggregation over the path's
    /// coupled set, then the OLIA increase. The slow start check for the
    /// exit detector runs after the window update, so a window that just
    /// dropped out of slow start is seen as such.
    pub fn on_packet_acked(
        &mut self,
        path_id: usize,
        packet_number: u64,
        acked_bytes: u64,
        bytes_in_flight: u64,
        owd: Option<Duration>,
    ) -> Result<()> {
        let needs_coupled_increase = {
            let sender = self.paths.get_mut(path_id).ok_or(Error::InternalError)?;
            if !sender.begin_ack(packet_number, acked_bytes) {
                // In recovery; the ACK went to PRR.
                return Ok(());
            }
            sender.prepare_increase(bytes_in_flight, owd)
        };

        if needs_coupled_increase {
            let set = self.coupled_set(path_id);
            assign_epsilon(&mut self.paths, &set);
            let path_rtt = self.get(path_id)?.smoothed_rtt();
            let rate = aggregate_rate(&self.paths, &set, path_rtt);
            self.get_mut(path_id)?.apply_coupled_increase(rate);
        }

        self.get_mut(path_id)?.end_ack(packet_number);
        Ok(())
    }

    /// Process a lost packet on the given path.
    pub fn on_packet_lost(
        &mut self,
        path_id: usize,
        packet_number: u64,
        lost_bytes: u64,
        bytes_in_flight: u64,
    ) -> Result<()> {
        self.get_mut(path_id)?
            .on_packet_lost(packet_number, lost_bytes, bytes_in_flight);
        Ok(())
    }

    /// Process a retransmission timeout on the given path.
    pub fn on_retransmission_timeout(
        &mut self,
        path_id: usize,
        packets_retransmitted: bool,
    ) -> Result<()> {
        self.get_mut(path_id)?
            .on_retransmission_timeout(packets_retransmitted);
        Ok(())
    }

    /// Reset the given path after a connection migration.
    pub fn on_connection_migration(&mut self, path_id: usize) -> Result<()> {
        self.get_mut(path_id)?.on_connection_migration();
        Ok(())
    }

    /// Whether the given path may send now.
    pub fn time_until_send(
        &self,
        path_id: usize,
        now: Instant,
        bytes_in_flight: u64,
    ) -> Result<Duration> {
        Ok(self.get(path_id)?.time_until_send(now, bytes_in_flight))
    }

    /// Feed an RTT sample for the given path.
    pub fn update_rtt(
        &mut self,
        path_id: usize,
        ack_delay: Duration,
        latest_rtt: Duration,
    ) -> Result<()> {
        self.get_mut(path_id)?.update_rtt(ack_delay, latest_rtt);
        Ok(())
    }

    /// The ids of the paths whose windows the given path couples
    /// against, in id order.
    fn coupled_set(&self, path_id: usize) -> SmallVec<[usize; 8]> {
        if self.coupling == CouplingAlgorithm::SharedBottleneck {
            if let Some(sender) = self.paths.get(path_id) {
                let group = sender.sbd().group();
                if !group.is_empty() {
                    let mut set: SmallVec<[usize; 8]> = group
                        .iter()
                        .copied()
                        .filter(|id| self.paths.contains(*id))
                        .collect();
                    set.sort_unstable();
                    return set;
                }
            }
        }
        self.paths.iter().map(|(id, _)| id).collect()
    }

    /// Bump every path's OWD bin index. Driven by the external epoch
    /// clock between decisions.
    pub fn advance_sbd_bin(&mut self) {
        for (_, sender) in self.paths.iter_mut() {
            sender.sbd.advance_bin();
        }
    }

    /// Run the per-epoch SBD decision: derive the estimators, split the
    /// paths into congested and clear, partition the congested subset,
    /// and open the next epoch. Returns the diagnostic table.
    pub fn advance_sbd_epoch(&mut self) -> String {
        for (_, sender) in self.paths.iter_mut() {
            let acked = sender.stats().packets_acked_in_total;
            let lost = sender.stats().packets_lost_in_total;
            sender.sbd.snapshot_epoch_end(acked, lost);
            sender.sbd.compute_estimates();
        }

        sbd::update_groups(&mut self.paths);

        let dump = self.sbd_dump();
        debug!("sbd decision\n{}", dump);

        for (_, sender) in self.paths.iter_mut() {
            sender.sbd.clear_epoch();
            let acked = sender.stats().packets_acked_in_total;
            let lost = sender.stats().packets_lost_in_total;
            sender.sbd.snapshot_epoch_start(acked, lost);
        }

        dump
    }

    /// Reset every path's coupling group, e.g. on a topology change.
    pub fn clear_groups(&mut self) {
        for (_, sender) in self.paths.iter_mut() {
            sender.sbd.clear_group();
        }
    }

    /// Fixed width diagnostic table of the latest SBD decision, one
    /// column per path in ascending id order.
    fn sbd_dump(&self) -> String {
        let mut rows: [(&str, Vec<String>); 7] = [
            ("pathid", Vec::new()),
            ("skew_est", Vec::new()),
            ("var_est", Vec::new()),
            ("freq_est", Vec::new()),
            ("pac_loss", Vec::new()),
            ("set", Vec::new()),
            ("packet", Vec::new()),
        ];

        for (id, sender) in self.paths.iter() {
            let sbd = sender.sbd();
            rows[0].1.push(format!("{}", id));
            rows[1].1.push(format!("{:.4}", sbd.skew_est()));
            rows[2].1.push(format!("{:?}", sbd.var_est()));
            rows[3].1.push(format!("{:.4}", sbd.freq_est()));
            rows[4].1.push(format!("{:.6}", sbd.pac_est()));
            rows[5].1.push(format!("{}", sbd.group().len()));
            rows[6].1.push(format!("{}", sbd.ack_delta()));
        }

        let mut out = String::new();
        for (label, cells) in rows.iter() {
            out.push_str(&format!("{:<width$}", label, width = DUMP_COL_WIDTH));
            for cell in cells.iter() {
                out.push_str(&format!("{:<width$}", cell, width = DUMP_COL_WIDTH));
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion_control::SbdState;

    const MSS: u64 = 1200;

    fn new_controller(num_paths: usize) -> MultipathController {
        let conf = Config::new();
        let mut controller = MultipathController::new(&conf);
        for _ in 0..num_paths {
            controller.add_path().unwrap();
        }
        controller
    }

    /// Put a path into congestion avoidance with the given window and a
    /// measured RTT and loss history.
    fn seed_path(
        controller: &mut MultipathController,
        path_id: usize,
        cwnd: u64,
        srtt_ms: u64,
        bytes_between_losses: u64,
    ) {
        let sender = controller.get_mut(path_id).unwrap();
        sender.congestion_window = cwnd;
        sender.exit_slowstart();
        sender.update_rtt(Duration::ZERO, Duration::from_millis(srtt_ms));
        sender.olia.on_packet_acked(bytes_between_losses);
        sender.olia.on_packet_lost();
    }

    #[test]
    fn controller_path_table() {
        let mut conf = Config::new();
        conf.set_max_paths(2);
        let mut controller = MultipathController::new(&conf);
        assert!(controller.is_empty());

        let p0 = controller.add_path().unwrap();
        let p1 = controller.add_path().unwrap();
        assert_eq!(controller.len(), 2);
        assert_eq!(controller.add_path(), Err(Error::Done));

        assert!(controller.get(p0).is_ok());
        assert_eq!(controller.get(9).err(), Some(Error::InternalError));

        controller.remove_path(p0).unwrap();
        assert_eq!(controller.remove_path(p0), Err(Error::InternalError));
        assert_eq!(controller.len(), 1);
        assert!(controller.get(p1).is_ok());

        // The freed id is reusable.
        assert!(controller.add_path().is_ok());
    }

    #[test]
    fn controller_single_path_steady_ack() {
        let mut controller = new_controller(1);
        let now = Instant::now();
        seed_path(&mut controller, 0, 10, 100, 0);

        for pn in 1..=11u64 {
            controller
                .on_packet_sent(0, now, 10 * MSS, pn, MSS, true)
                .unwrap();
        }

        // Ten ACKs accumulate just below the fixed point threshold; the
        // window holds at ten packets.
        for pn in 1..=10u64 {
            controller
                .on_packet_acked(0, pn, MSS, 10 * MSS, Some(Duration::from_millis(20)))
                .unwrap();
            assert_eq!(controller.get(0).unwrap().congestion_window_packets(), 10);
        }

        // The eleventh ACK tips it over: Reno-like growth of one packet
        // per window's worth of ACKs.
        controller
            .on_packet_acked(0, 11, MSS, 10 * MSS, Some(Duration::from_millis(20)))
            .unwrap();
        assert_eq!(controller.get(0).unwrap().congestion_window_packets(), 11);
    }

    #[test]
    fn controller_identical_paths_stay_uncoupled() {
        let mut controller = new_controller(2);
        let now = Instant::now();
        for id in [0, 1] {
            seed_path(&mut controller, id, 10, 100, 120000);
        }

        controller.on_packet_sent(0, now, 0, 1, MSS, true).unwrap();
        controller
            .on_packet_acked(0, 1, MSS, 10 * MSS, None)
            .unwrap();

        for id in [0, 1] {
            let sender = controller.get(id).unwrap();
            assert_eq!(sender.olia.epsilon_num(), 0);
            assert_eq!(sender.olia.epsilon_den(), 1);
        }
    }

    #[test]
    fn controller_group_restricts_coupling() {
        let mut controller = new_controller(3);
        let now = Instant::now();
        seed_path(&mut controller, 0, 20, 100, 120000);
        seed_path(&mut controller, 1, 10, 100, 120000);
        seed_path(&mut controller, 2, 30, 100, 120000);

        // Paths 0 and 1 share a bottleneck; path 2 sits elsewhere.
        controller.get_mut(0).unwrap().sbd =
            SbdState::seed_estimates(-0.2, Duration::from_millis(1), 0.1, 0.02);
        controller.get_mut(1).unwrap().sbd =
            SbdState::seed_estimates(-0.2, Duration::from_micros(1050), 0.11, 0.02);
        controller.get_mut(2).unwrap().sbd =
            SbdState::seed_estimates(-0.2, Duration::from_millis(5), 0.5, 0.2);
        controller.advance_sbd_epoch();

        assert_eq!(controller.get(0).unwrap().sbd().group().len(), 2);
        assert_eq!(controller.get(2).unwrap().sbd().group().len(), 1);

        // An ACK on path 0 couples only against {0, 1}: path 0 leads
        // that pair, so it is penalized with eps_den = |S| * |M| = 2.
        controller.on_packet_sent(0, now, 0, 1, MSS, true).unwrap();
        controller
            .on_packet_acked(0, 1, MSS, 20 * MSS, None)
            .unwrap();
        let sender = controller.get(0).unwrap();
        assert_eq!(sender.olia.epsilon_num(), -1);
        assert_eq!(sender.olia.epsilon_den(), 2);

        // After the groups are cleared the whole table is coupled again:
        // path 2 now carries the largest window, so path 0 turns into a
        // boosted B\M member of a three path set.
        controller.clear_groups();
        controller.on_packet_sent(0, now, 0, 2, MSS, true).unwrap();
        controller
            .on_packet_acked(0, 2, MSS, 20 * MSS, None)
            .unwrap();
        let sender = controller.get(0).unwrap();
        assert_eq!(sender.olia.epsilon_num(), 1);
        assert_eq!(sender.olia.epsilon_den(), 6);
    }

    #[test]
    fn controller_full_mesh_ignores_groups() {
        let mut conf = Config::new();
        conf.set_coupling_algorithm(CouplingAlgorithm::FullMesh);
        let mut controller = MultipathController::new(&conf);
        for _ in 0..3 {
            controller.add_path().unwrap();
        }
        let now = Instant::now();
        seed_path(&mut controller, 0, 20, 100, 120000);
        seed_path(&mut controller, 1, 10, 100, 120000);
        seed_path(&mut controller, 2, 30, 100, 120000);

        // Even with a two path group in place, full mesh coupling walks
        // the whole table.
        controller.get_mut(0).unwrap().sbd.set_group(&[0, 1]);
        controller.on_packet_sent(0, now, 0, 1, MSS, true).unwrap();
        controller
            .on_packet_acked(0, 1, MSS, 20 * MSS, None)
            .unwrap();
        let sender = controller.get(0).unwrap();
        assert_eq!(sender.olia.epsilon_num(), 1);
        assert_eq!(sender.olia.epsilon_den(), 6);
    }

    #[test]
    fn controller_sbd_all_clear_forms_one_group() {
        let mut controller = new_controller(3);
        for id in 0..3 {
            controller.get_mut(id).unwrap().sbd =
                SbdState::seed_estimates(0.0, Duration::ZERO, 0.0, 0.01);
        }
        controller.advance_sbd_epoch();

        for id in 0..3 {
            let sender = controller.get(id).unwrap();
            assert!(!sender.sbd().congested());
            assert_eq!(sender.sbd().group().len(), 3);
            for peer in 0..3 {
                assert!(sender.sbd().group().contains(&peer));
            }
        }
    }

    #[test]
    fn controller_sbd_congested_split() {
        let mut controller = new_controller(3);
        controller.get_mut(0).unwrap().sbd =
            SbdState::seed_estimates(-0.2, Duration::from_millis(1), 0.1, 0.02);
        controller.get_mut(1).unwrap().sbd =
            SbdState::seed_estimates(-0.2, Duration::from_micros(1050), 0.11, 0.02);
        controller.get_mut(2).unwrap().sbd =
            SbdState::seed_estimates(-0.2, Duration::from_millis(5), 0.5, 0.2);

        let dump = controller.advance_sbd_epoch();

        // {P1, P2} and {P3}: every path is in its own group, and both
        // members of the pair reach each other.
        for id in [0, 1] {
            let group = controller.get(id).unwrap().sbd().group().clone();
            assert!(controller.get(id).unwrap().sbd().congested());
            assert_eq!(group.len(), 2);
            assert!(group.contains(&0) && group.contains(&1));
        }
        let group = controller.get(2).unwrap().sbd().group().clone();
        assert_eq!(group.len(), 1);
        assert!(group.contains(&2));

        // The diagnostic table reflects the split.
        let set_row = dump
            .lines()
            .find(|line| line.starts_with("set"))
            .unwrap();
        assert_eq!(set_row, format!("{:<12}{:<12}{:<12}{:<12}", "set", 2, 2, 1));
    }

    #[test]
    fn controller_sbd_hysteresis() {
        let mut controller = new_controller(1);
        controller.get_mut(0).unwrap().sbd =
            SbdState::seed_estimates(-0.2, Duration::from_millis(1), 0.1, 0.02);
        controller.advance_sbd_epoch();
        assert!(controller.get(0).unwrap().sbd().congested());

        // An idle epoch leaves the estimators at zero; the congested
        // flag survives through the hysteresis band.
        controller.advance_sbd_epoch();
        assert!(controller.get(0).unwrap().sbd().congested());
    }

    #[test]
    fn controller_sbd_epoch_counters() {
        let mut controller = new_controller(1);
        let now = Instant::now();
        let owd = Some(Duration::from_millis(20));

        for pn in 1..=10u64 {
            controller
                .on_packet_sent(0, now, 10 * MSS, pn, MSS, true)
                .unwrap();
        }
        for pn in 1..=10u64 {
            controller
                .on_packet_acked(0, pn, MSS, 10 * MSS, owd)
                .unwrap();
            controller.advance_sbd_bin();
        }
        controller.on_packet_lost(0, 11, MSS, 10 * MSS).unwrap();
        controller.on_packet_lost(0, 12, MSS, 10 * MSS).unwrap();

        let dump = controller.advance_sbd_epoch();

        // Two losses over ten acked packets: above P_L, so the lone
        // path is classified as congested.
        assert!(controller.get(0).unwrap().sbd().congested());
        let packet_row = dump.lines().find(|l| l.starts_with("packet")).unwrap();
        assert_eq!(packet_row, format!("{:<12}{:<12}", "packet", 10));

        // The next epoch starts from the current counters.
        for pn in 11..=12u64 {
            controller
                .on_packet_sent(0, now, 10 * MSS, pn, MSS, true)
                .unwrap();
        }
        // Acking past the cutback leaves recovery and counts one packet.
        controller
            .on_packet_acked(0, 12, MSS, 10 * MSS, owd)
            .unwrap();
        let dump = controller.advance_sbd_epoch();
        let packet_row = dump.lines().find(|l| l.starts_with("packet")).unwrap();
        assert_eq!(packet_row, format!("{:<12}{:<12}", "packet", 1));
    }

    #[test]
    fn controller_dump_shape() {
        let mut controller = new_controller(2);
        let dump = controller.advance_sbd_epoch();
        let lines: Vec<&str> = dump.lines().collect();

        assert_eq!(lines.len(), 7);
        for (line, label) in lines.iter().zip([
            "pathid", "skew_est", "var_est", "freq_est", "pac_loss", "set", "packet",
        ]) {
            assert!(line.starts_with(label));
            assert_eq!(line.len(), DUMP_COL_WIDTH * 3);
        }
    }

    #[test]
    fn controller_unknown_path_errors() {
        let mut controller = new_controller(1);
        let now = Instant::now();
        assert_eq!(
            controller.on_packet_acked(7, 1, MSS, 0, None),
            Err(Error::InternalError)
        );
        assert_eq!(
            controller.time_until_send(7, now, 0),
            Err(Error::InternalError)
        );
    }
}
