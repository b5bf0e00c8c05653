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

//! MPOLIA is the multipath congestion control core of a multipath
//! QUIC-like transport. It couples the congestion windows of concurrent
//! network paths using the OLIA (Opportunistic Linked Increases
//! Algorithm) rule, and restricts the coupling to paths that share a
//! bottleneck, as detected from one-way-delay statistics (SBD).
//!
//! The crate is an arithmetic state machine: it consumes ACK/LOSS/RTO
//! events and RTT samples from the outer transport and returns only
//! congestion window updates, send gating decisions and path grouping
//! decisions. It performs no I/O and owns no timers.

use std::cmp;
use std::time::Duration;

pub use crate::congestion_control::CongestionStats;
pub use crate::congestion_control::CouplingAlgorithm;
pub use crate::congestion_control::HybridSlowStart;
pub use crate::congestion_control::Olia;
pub use crate::congestion_control::OliaConfig;
pub use crate::congestion_control::PathSender;
pub use crate::congestion_control::PrrSender;
pub use crate::congestion_control::SbdState;
pub use crate::error::Error;
pub use crate::multipath::MultipathController;
pub use crate::rtt::RttEstimator;

/// A specialized `Result` type for congestion control operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Default outgoing udp datagram payload size, used as the MSS for
/// packet/byte conversion.
pub const DEFAULT_SEND_UDP_PAYLOAD_SIZE: usize = 1200;

/// Duration used to express that sending is blocked indefinitely.
pub const INF_DURATION: Duration = Duration::MAX;

/// The minimal congestion window in packets.
/// The RECOMMENDED value is 2 * max_datagram_size.
/// See RFC 9002 Section 7.2
const DEFAULT_MIN_CONGESTION_WINDOW: u64 = 2;

/// The initial congestion window in packets.
/// See RFC 9002 Section 7.2
const DEFAULT_INITIAL_CONGESTION_WINDOW: u64 = 10;

/// Default upper bound for the congestion window in packets. It is also
/// the initial slow start threshold.
const DEFAULT_MAX_CONGESTION_WINDOW: u64 = 10000;

/// Default number of emulated Reno connections per path, used to compute
/// the multiplicative decrease factor on loss.
const DEFAULT_NUM_CONNECTIONS: u32 = 2;

/// A sender close to, but not at, its window still counts as window
/// limited when the headroom is at most this many packets.
const MAX_BURST_PACKETS: u64 = 3;

/// Default maximum number of concurrent paths.
const DEFAULT_MAX_PATHS: usize = 8;

/// Configurations for the multipath congestion control core.
///
/// The configuration is read at path creation; the constants driving the
/// OLIA arithmetic and the SBD thresholds are compile-time and not
/// tunable here.
#[derive(Debug, Clone)]
pub struct Config {
    /// Configurations about per-path congestion control.
    pub recovery: RecoveryConfig,

    /// Configurations about multipath coupling.
    pub multipath: MultipathConfig,
}

impl Config {
    /// Create default configuration.
    ///
    /// The configuration may be customized by calling related set methods.
    pub fn new() -> Self {
        Self {
            recovery: RecoveryConfig::default(),
            multipath: MultipathConfig::default(),
        }
    }

    /// Set the maximum outgoing UDP payload size in bytes.
    /// The default value is `1200`.
    pub fn set_max_datagram_size(&mut self, v: usize) {
        self.recovery.max_datagram_size = cmp::max(v, 1);
    }

    /// Set the minimal congestion window in packets.
    /// The default value is `2`.
    pub fn set_min_congestion_window(&mut self, v: u64) {
        self.recovery.min_congestion_window = cmp::max(v, 1);
    }

    /// Set the initial congestion window in packets.
    /// The default value is `10`.
    pub fn set_initial_congestion_window(&mut self, v: u64) {
        self.recovery.initial_congestion_window = cmp::max(v, 1);
    }

    /// Set the upper bound for the congestion window in packets. It is
    /// also used as the initial slow start threshold.
    /// The default value is `10000`.
    pub fn set_initial_max_congestion_window(&mut self, v: u64) {
        self.recovery.initial_max_congestion_window = cmp::max(v, 1);
    }

    /// Set the number of emulated Reno connections per path, floored at 1.
    /// The default value is `2`.
    pub fn set_num_emulated_connections(&mut self, v: u32) {
        self.recovery.num_emulated_connections = cmp::max(v, 1);
    }

    /// Exit slow start with a large cutback of the congestion window.
    /// Disabled by default.
    pub fn enable_slow_start_large_reduction(&mut self, v: bool) {
        self.recovery.slow_start_large_reduction = v;
    }

    /// Set the maximum number of concurrent paths.
    /// The default value is `8`.
    pub fn set_max_paths(&mut self, v: usize) {
        self.multipath.max_paths = cmp::max(v, 1);
    }

    /// Set the coupling strategy for the multipath sender set.
    /// The default value is `SharedBottleneck`.
    pub fn set_coupling_algorithm(&mut self, v: CouplingAlgorithm) {
        self.multipath.coupling_algorithm = v;
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Configurations about per-path congestion control.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// The maximum size of outgoing UDP payloads, used as the MSS.
    pub max_datagram_size: usize,

    /// The minimal congestion window in packets.
    pub min_congestion_window: u64,

    /// The initial congestion window in packets.
    pub initial_congestion_window: u64,

    /// The upper bound for the congestion window in packets, also the
    /// initial slow start threshold.
    pub initial_max_congestion_window: u64,

    /// The number of emulated Reno connections per path.
    pub num_emulated_connections: u32,

    /// When true, exit slow start with a large cutback of the
    /// congestion window.
    pub slow_start_large_reduction: bool,
}

impl Default for RecoveryConfig {
    fn default() -> RecoveryConfig {
        RecoveryConfig {
            max_datagram_size: DEFAULT_SEND_UDP_PAYLOAD_SIZE,
            min_congestion_window: DEFAULT_MIN_CONGESTION_WINDOW,
            initial_congestion_window: DEFAULT_INITIAL_CONGESTION_WINDOW,
            initial_max_congestion_window: DEFAULT_MAX_CONGESTION_WINDOW,
            num_emulated_connections: DEFAULT_NUM_CONNECTIONS,
            slow_start_large_reduction: false,
        }
    }
}

/// Configurations about multipath coupling.
#[derive(Debug, Clone)]
pub struct MultipathConfig {
    /// Maximum number of concurrent paths.
    pub max_paths: usize,

    /// Coupling strategy for the multipath sender set.
    pub coupling_algorithm: CouplingAlgorithm,
}

impl Default for MultipathConfig {
    fn default() -> MultipathConfig {
        MultipathConfig {
            max_paths: DEFAULT_MAX_PATHS,
            coupling_algorithm: CouplingAlgorithm::SharedBottleneck,
        }
    }
}


#[path = "congestion_control/congestion_control.rs"]
mod congestion_control;

pub mod error;
mod multipath;
mod rtt;
