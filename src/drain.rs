/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    command::{CommandSpec, Executor},
    config::{ClusterSettings, DrainSettings},
    error::DriverError,
};
use anyhow::Context;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sleeps for `duration` unless the token is cancelled first.
pub async fn sleep_or_cancel(
    duration: Duration,
    token: &CancellationToken,
) -> Result<(), DriverError> {
    tokio::select! {
        _ = token.cancelled() => Err(DriverError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Reads the amount of data still sitting in a pool.
pub trait DrainProbe {
    /// A fresh reading. `Err` means the value could not be obtained or parsed, which never counts
    /// as drained.
    fn read(&mut self) -> anyhow::Result<i64>;
}

/// Reads the `USED` column of `rados df` for one pool.
pub struct RadosDfProbe<'a> {
    executor: &'a dyn Executor,
    cmd: CommandSpec,
    pool: String,
}
impl<'a> RadosDfProbe<'a> {
    pub fn new(executor: &'a dyn Executor, cluster: &ClusterSettings, pool: &str) -> Self {
        let cmd = CommandSpec::new(cluster.tool(&cluster.rados_tool).to_string_lossy())
            .arg("df")
            .sudo(cluster.sudo);
        Self {
            executor,
            cmd,
            pool: pool.to_string(),
        }
    }
}

impl DrainProbe for RadosDfProbe<'_> {
    fn read(&mut self) -> anyhow::Result<i64> {
        let outcome = self.executor.run(&self.cmd)?;
        if !outcome.success() {
            return Err(anyhow::anyhow!(
                "`{}` failed with {}",
                self.cmd,
                outcome.describe()
            ));
        }
        parse_pool_usage(&outcome.stdout, &self.pool)
    }
}

/// Finds the row for `pool` in `rados df` output and parses its second column.
pub fn parse_pool_usage(output: &str, pool: &str) -> anyhow::Result<i64> {
    let row = output
        .lines()
        .find(|line| line.split_whitespace().next() == Some(pool))
        .context(format!("No row for pool {} in rados df output", pool))?;

    let used = row
        .split_whitespace()
        .nth(1)
        .context(format!("Row for pool {} has no usage column", pool))?;

    used.parse::<i64>()
        .context(format!("Usage of pool {} is not a number: {:?}", pool, used))
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrainReport {
    pub polls: u32,
    pub waited: Duration,
}

/// Blocks until the probe reads exactly zero. Polls every `interval` after an initial `settle`
/// wait, and gives up with [`DriverError::DrainTimeout`] once `max_wait` has elapsed.
pub async fn wait_for_drain(
    probe: &mut dyn DrainProbe,
    pool: &str,
    settings: &DrainSettings,
    token: &CancellationToken,
) -> Result<DrainReport, DriverError> {
    let start = Instant::now();
    let deadline = start.checked_add(settings.max_wait()).ok_or_else(|| {
        DriverError::Plan(format!(
            "drain wait of {}s for pool {} is out of range",
            settings.max_wait_secs, pool
        ))
    })?;

    info!(
        "waiting {}s before polling pool {}",
        settings.settle_secs, pool
    );
    sleep_or_cancel(settings.settle().min(settings.max_wait()), token).await?;

    let mut polls = 0;
    let mut last_reading = None;
    loop {
        polls += 1;
        match probe.read() {
            Ok(0) => {
                let waited = start.elapsed();
                info!("pool {} drained after {}s", pool, waited.as_secs());
                return Ok(DrainReport { polls, waited });
            }
            Ok(reading) => {
                debug!("pool {} still holds {}", pool, reading);
                last_reading = Some(reading);
            }
            Err(err) => warn!("{:#}", err),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(DriverError::DrainTimeout {
                pool: pool.to_string(),
                waited: now - start,
                last_reading,
            });
        }
        sleep_or_cancel(settings.interval().min(deadline - now), token).await?;
    }
}
