/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::{fmt, time::Duration};

/// Failures the driver treats as fatal for an iteration or for the whole sweep. Anything not
/// listed here (a failed `ceph osd pool set`, a `pkill` that matched nothing) is logged as a
/// warning and counted in the iteration report instead.
#[derive(Debug)]
pub enum DriverError {
    /// The cluster bring-up script could not be run or exited non-zero.
    BringUp(String),

    /// A configuration command failed and `on_config_failure = "abort"` is set.
    Configure(String),

    /// The drain counter never reached zero within the allowed time.
    DrainTimeout {
        pool: String,
        waited: Duration,
        last_reading: Option<i64>,
    },

    /// Ctrl-C (or another cancellation source) interrupted the sweep.
    Cancelled,

    /// The sweep definition cannot be expanded into a valid plan.
    Plan(String),
}

impl DriverError {
    /// Whether this error should stop the remaining sweep points, as opposed to only the current
    /// iteration.
    pub fn is_fatal(&self) -> bool {
        match self {
            DriverError::BringUp(_) | DriverError::Configure(_) => false,
            DriverError::DrainTimeout { .. } | DriverError::Cancelled | DriverError::Plan(_) => {
                true
            }
        }
    }

    pub fn error_message(&self) -> String {
        match self {
            DriverError::BringUp(e) => format!("cluster bring-up failed: {}", e),
            DriverError::Configure(e) => format!("cluster configuration failed: {}", e),
            DriverError::DrainTimeout {
                pool,
                waited,
                last_reading,
            } => {
                let last = last_reading
                    .map(|r| r.to_string())
                    .unwrap_or("unreadable".to_string());
                format!(
                    "pool {} did not drain within {}s (last reading: {})",
                    pool,
                    waited.as_secs(),
                    last
                )
            }
            DriverError::Cancelled => "sweep cancelled".to_string(),
            DriverError::Plan(e) => format!("invalid sweep plan: {}", e),
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error_message())
    }
}

impl std::error::Error for DriverError {}
