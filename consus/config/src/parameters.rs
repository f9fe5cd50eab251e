// Copyright (c) Consus Contributors
// SPDX-License-Identifier: Apache-2.0

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Operational configuration of one server.
///
/// All fields tolerate inconsistencies among servers without affecting safety
/// of the protocol; anything safety-relevant lives in the coordinator-published
/// cluster snapshot instead.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Parameters {
    /// How long to wait before retransmitting an unacknowledged message.
    #[serde(default = "Parameters::default_resend_interval")]
    pub resend_interval: Duration,

    /// How often the background task re-drives state machines that have no
    /// pending external event and collects finished ones.
    #[serde(default = "Parameters::default_pump_interval")]
    pub pump_interval: Duration,

    /// Directory holding the durable log and the server identity files. The
    /// path must be provided for the node to boot a durable log.
    pub log_dir: Option<PathBuf>,
}

impl Parameters {
    pub fn default_resend_interval() -> Duration {
        Duration::from_secs(1)
    }

    pub fn default_pump_interval() -> Duration {
        Duration::from_millis(250)
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            resend_interval: Parameters::default_resend_interval(),
            pump_interval: Parameters::default_pump_interval(),
            log_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let parameters = Parameters::default();
        assert_eq!(parameters.resend_interval, Duration::from_secs(1));
        assert_eq!(parameters.pump_interval, Duration::from_millis(250));
        assert!(parameters.log_dir.is_none());
    }
}
