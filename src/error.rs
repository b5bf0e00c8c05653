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

//! Error type for congestion control operations.
//!
//! The arithmetic core itself never fails; errors arise only from path
//! table lookups and configuration parsing.

/// An error originating from the multipath congestion control core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The controller encountered an internal error, e.g. an unknown
    /// path identifier.
    InternalError,

    /// There is no more room for the requested operation, e.g. the path
    /// table is full.
    Done,

    /// The endpoint received an invalid configuration value.
    InvalidConfig(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_format() {
        use std::error::Error;

        let e = super::Error::InvalidConfig("unknown".into());
        assert_eq!(format!("{}", e), "InvalidConfig(\"unknown\")");
        assert!(e.source().is_none());

        assert_eq!(format!("{}", super::Error::InternalError), "InternalError");
        assert_eq!(format!("{}", super::Error::Done), "Done");
    }
}
