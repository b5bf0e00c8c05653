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

//! Proportional Rate Reduction.
//!
//! PRR paces transmissions during loss recovery so that the data in
//! flight converges smoothly towards the reduced slow start threshold,
//! instead of stalling or bursting.
//!
//! See <https://www.rfc-editor.org/rfc/rfc6937.html>.

use std::time::Duration;

use crate::INF_DURATION;

/// Pacer for packets sent during loss recovery.
#[derive(Debug, Default)]
pub struct PrrSender {
    /// MSS in bytes.
    max_datagram_size: u64,

    /// Bytes sent since the last loss event (prr_out).
    bytes_sent_since_loss: u64,

    /// Bytes delivered since the last loss event (prr_delivered).
    bytes_delivered_since_loss: u64,

    /// ACKs received since the last loss event.
    ack_count_since_loss: u64,

    /// Bytes in flight when the loss occurred (RecoverFS).
    bytes_in_flight_before_loss: u64,
}

impl PrrSender {
    pub fn new(max_datagram_size: u64) -> Self {
        Self {
            max_datagram_size,
            ..Self::default()
        }
    }

    pub fn on_packet_sent(&mut self, sent_bytes: u64) {
        self.bytes_sent_since_loss += sent_bytes;
    }

    /// Start a new recovery episode.
    pub fn on_packet_lost(&mut self, prior_in_flight: u64) {
        self.bytes_sent_since_loss = 0;
        self.bytes_in_flight_before_loss = prior_in_flight;
        self.bytes_delivered_since_loss = 0;
        self.ack_count_since_loss = 0;
    }

    pub fn on_packet_acked(&mut self, acked_bytes: u64) {
        self.bytes_delivered_since_loss += acked_bytes;
        self.ack_count_since_loss += 1;
    }

    /// Whether the next packet may leave now, or never during this
    /// recovery (callers re-evaluate on the next ACK).
    pub fn time_until_send(
        &self,
        congestion_window: u64,
        bytes_in_flight: u64,
        slowstart_threshold: u64,
    ) -> Duration {
        // The first packet after a loss, and the tail of a drained
        // flight, may always leave immediately.
        if self.bytes_sent_since_loss == 0 || bytes_in_flight < self.max_datagram_size {
            return Duration::ZERO;
        }
        if congestion_window > bytes_in_flight {
            // During PRR-SSRB, limit outgoing packets to 1 extra MSS per
            // ack, instead of sending the entire available window. This
            // prevents burst retransmits when more packets are lost than
            // the CWND reduction.
            //   limit = MAX(prr_delivered - prr_out, DeliveredData) + MSS
            if self.bytes_delivered_since_loss + self.ack_count_since_loss * self.max_datagram_size
                <= self.bytes_sent_since_loss
            {
                return INF_DURATION;
            }
            return Duration::ZERO;
        }
        // Implement Proportional Rate Reduction (RFC 6937).
        // Checks a simplified version of the PRR formula that doesn't
        // use division:
        //   AvailableSendWindow =
        //     CEIL(prr_delivered * ssthresh / BytesInFlightAtLoss) - prr_sent
        if self.bytes_delivered_since_loss * slowstart_threshold
            > self.bytes_sent_since_loss * self.bytes_in_flight_before_loss
        {
            return Duration::ZERO;
        }
        INF_DURATION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSS: u64 = 1200;

    fn can_send(prr: &PrrSender, cwnd: u64, in_flight: u64, ssthresh: u64) -> bool {
        prr.time_until_send(cwnd, in_flight, ssthresh).is_zero()
    }

    #[test]
    fn prr_single_loss_sends_on_every_other_ack() {
        let mut prr = PrrSender::new(MSS);
        let num_packets_in_flight = 50;
        let mut bytes_in_flight = num_packets_in_flight * MSS;
        let ssthresh_after_loss = num_packets_in_flight / 2;
        let congestion_window = ssthresh_after_loss * MSS;

        prr.on_packet_lost(bytes_in_flight);
        // Ack a packet: PRR allows one packet to leave immediately.
        prr.on_packet_acked(MSS);
        bytes_in_flight -= MSS;
        assert!(can_send(
            &prr,
            congestion_window,
            bytes_in_flight,
            ssthresh_after_loss * MSS
        ));

        // Send the retransmission; nothing more may leave.
        prr.on_packet_sent(MSS);
        assert!(!can_send(
            &prr,
            congestion_window,
            bytes_in_flight,
            ssthresh_after_loss * MSS
        ));

        // One packet was lost and one ack consumed above. PRR paces the
        // remaining acks, alternately blocking and releasing a packet.
        for _ in 0..ssthresh_after_loss - 1 {
            prr.on_packet_acked(MSS);
            bytes_in_flight -= MSS;
            assert!(!can_send(
                &prr,
                congestion_window,
                bytes_in_flight,
                ssthresh_after_loss * MSS
            ));

            prr.on_packet_acked(MSS);
            bytes_in_flight -= MSS;
            assert!(can_send(
                &prr,
                congestion_window,
                bytes_in_flight,
                ssthresh_after_loss * MSS
            ));

            prr.on_packet_sent(MSS);
            bytes_in_flight += MSS;
        }

        // The flight now equals the window; PRR maintains packet
        // conservation, one packet out per ack.
        assert_eq!(congestion_window, bytes_in_flight);
        for _ in 0..10 {
            prr.on_packet_acked(MSS);
            bytes_in_flight -= MSS;
            assert!(can_send(
                &prr,
                congestion_window,
                bytes_in_flight,
                ssthresh_after_loss * MSS
            ));

            prr.on_packet_sent(MSS);
            bytes_in_flight += MSS;
            assert_eq!(congestion_window, bytes_in_flight);
            assert!(!can_send(
                &prr,
                congestion_window,
                bytes_in_flight,
                ssthresh_after_loss * MSS
            ));
        }
    }

    #[test]
    fn prr_burst_loss_slow_start_rebuild() {
        let mut prr = PrrSender::new(MSS);
        let mut bytes_in_flight = 20 * MSS;
        let num_packets_lost = 13;
        let ssthresh_after_loss = 10;
        let congestion_window = ssthresh_after_loss * MSS;

        // Lose 13 packets.
        bytes_in_flight -= num_packets_lost * MSS;
        prr.on_packet_lost(bytes_in_flight);

        // PRR-SSRB allows the following 3 acks to send up to 2 packets.
        for _ in 0..3 {
            prr.on_packet_acked(MSS);
            bytes_in_flight -= MSS;
            for _ in 0..2 {
                assert!(can_send(
                    &prr,
                    congestion_window,
                    bytes_in_flight,
                    ssthresh_after_loss * MSS
                ));
                prr.on_packet_sent(MSS);
                bytes_in_flight += MSS;
            }
            // No more than 2 packets in response to one ack.
            assert!(!can_send(
                &prr,
                congestion_window,
                bytes_in_flight,
                ssthresh_after_loss * MSS
            ));
        }

        // Out of SSRB mode, one send per ack.
        for _ in 0..10 {
            prr.on_packet_acked(MSS);
            bytes_in_flight -= MSS;
            assert!(can_send(
                &prr,
                congestion_window,
                bytes_in_flight,
                ssthresh_after_loss * MSS
            ));
            prr.on_packet_sent(MSS);
            bytes_in_flight += MSS;
        }
    }
}
