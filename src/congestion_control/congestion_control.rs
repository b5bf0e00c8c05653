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

use core::str::FromStr;

use crate::Error;
use crate::Result;
pub use hybrid_slow_start::HybridSlowStart;
pub use olia::Olia;
pub use olia_sender::OliaConfig;
pub use olia_sender::PathSender;
pub use prr::PrrSender;
pub use sbd::SbdState;

pub(crate) use olia_sender::aggregate_rate;
pub(crate) use olia_sender::assign_epsilon;

/// Available strategies for choosing the set of paths whose congestion
/// windows are coupled together.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default)]
pub enum CouplingAlgorithm {
    /// Couple every path against the whole path table. This is the
    /// classic OLIA arrangement, which assumes all paths compete at a
    /// common bottleneck.
    FullMesh,

    /// Restrict coupling to the path's current shared-bottleneck group,
    /// as detected from one-way-delay statistics. Falls back to the
    /// whole table while the group has not been computed yet.
    #[default]
    SharedBottleneck,
}

impl FromStr for CouplingAlgorithm {
    type Err = Error;

    fn from_str(algor: &str) -> Result<CouplingAlgorithm> {
        if algor.eq_ignore_ascii_case("fullmesh") {
            Ok(CouplingAlgorithm::FullMesh)
        } else if algor.eq_ignore_ascii_case("sbd") {
            Ok(CouplingAlgorithm::SharedBottleneck)
        } else {
            Err(Error::InvalidConfig("unknown".into()))
        }
    }
}

/// Congestion control statistics for one path.
///
/// The cumulative packet counters double as the source of the per-epoch
/// loss/ack snapshots taken by the shared bottleneck detector.
#[derive(Debug, Default, Clone)]
pub struct CongestionStats {
    /// Total packets acked.
    pub packets_acked_in_total: u64,

    /// Total packets declared lost.
    pub packets_lost_in_total: u64,

    /// Total bytes acked.
    pub bytes_acked_in_total: u64,

    /// Total bytes declared lost.
    pub bytes_lost_in_total: u64,

    /// Packets lost while in slow start.
    pub slowstart_packets_lost: u64,

    /// Bytes lost while in slow start.
    pub slowstart_bytes_lost: u64,
}


mod hybrid_slow_start;
mod olia;
mod olia_sender;
mod prr;
pub(crate) mod sbd;
