/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    command::{CommandSpec, Executor},
    config::{ClusterSettings, PoolSettings},
    error::DriverError,
    sweep::SweepPoint,
};
use tracing::{debug, warn};

/// The administrative settings applied to a freshly started cluster for one iteration. Nothing is
/// read back from the cluster: the state is re-issued in full after every bring-up.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConfigState {
    pub pools: PoolSettings,
    pub chunk_size: u32,
}
impl ClusterConfigState {
    pub fn for_point(point: &SweepPoint) -> Self {
        Self {
            pools: point.pools.clone(),
            chunk_size: point.chunk_size,
        }
    }

    /// The administrative commands establishing this state, in the order they must run: pools
    /// first, then OSD flags, then the tiering relation and per-pool settings, then the RBD image.
    pub fn commands(&self, cluster: &ClusterSettings) -> Vec<CommandSpec> {
        let pools = &self.pools;
        let ceph = || {
            CommandSpec::new(cluster.tool(&cluster.admin_tool).to_string_lossy())
                .cwd(cluster.build_dir())
                .sudo(cluster.sudo)
        };
        let pool_set = |key: &str, value: String| {
            ceph()
                .args(["osd", "pool", "set", pools.base.as_str(), key])
                .arg(value)
        };

        let mut cmds = vec![
            ceph()
                .args(["osd", "pool", "create", pools.base.as_str()])
                .arg(pools.base_pg_num),
            ceph().args(["osd", "pool", "create", pools.chunk.as_str()]),
        ];

        cmds.extend(
            pools
                .osd_flags
                .iter()
                .map(|flag| ceph().args(["osd", "set", flag.as_str()])),
        );

        cmds.push(pool_set("dedup_tier", pools.chunk.clone()));
        cmds.push(pool_set(
            "dedup_chunk_algorithm",
            pools.chunk_algorithm.clone(),
        ));
        cmds.push(pool_set("dedup_cdc_chunk_size", self.chunk_size.to_string()));
        cmds.push(pool_set(
            "fingerprint_algorithm",
            pools.fingerprint_algorithm.clone(),
        ));
        cmds.push(pool_set(
            "target_max_objects",
            pools.target_max_objects.to_string(),
        ));
        cmds.push(pool_set(
            "target_max_bytes",
            pools.target_max_bytes.to_string(),
        ));
        cmds.push(pool_set(
            "pg_autoscale_mode",
            pools.pg_autoscale_mode.clone(),
        ));
        cmds.push(pool_set(
            "cache_target_full_ratio",
            pools.cache_target_full_ratio.to_string(),
        ));
        if let Some(age) = pools.cache_min_flush_age {
            cmds.push(pool_set("cache_min_flush_age", age.to_string()));
        }
        if let Some(age) = pools.cache_min_evict_age {
            cmds.push(pool_set("cache_min_evict_age", age.to_string()));
        }

        if let Some(image) = &pools.rbd_image {
            cmds.push(
                CommandSpec::new(cluster.tool(&cluster.rbd_tool).to_string_lossy())
                    .cwd(cluster.build_dir())
                    .sudo(cluster.sudo)
                    .args(["create", image.name.as_str()])
                    .opt("--size", &image.size)
                    .opt("--pool", &pools.base),
            );
        }

        cmds
    }
}

pub fn bring_up_command(cluster: &ClusterSettings) -> CommandSpec {
    CommandSpec::new(&cluster.bringup)
        .cwd(&cluster.scripts_dir)
        .sudo(cluster.sudo)
}

/// Starts a fresh cluster. Every later step depends on it, so any failure is returned as an
/// error rather than a warning.
pub fn bring_up(executor: &dyn Executor, cluster: &ClusterSettings) -> Result<(), DriverError> {
    let cmd = bring_up_command(cluster);
    match executor.run(&cmd) {
        Ok(outcome) if outcome.success() => Ok(()),
        Ok(outcome) => Err(DriverError::BringUp(format!(
            "`{}` failed with {}",
            cmd,
            outcome.describe()
        ))),
        Err(err) => Err(DriverError::BringUp(format!("{:#}", err))),
    }
}

/// Issues every configuration command, returning a description of each one that failed.
pub fn configure(
    executor: &dyn Executor,
    cluster: &ClusterSettings,
    state: &ClusterConfigState,
) -> Vec<String> {
    let mut failures = vec![];
    for cmd in state.commands(cluster) {
        debug!("configure: {}", cmd);
        let failure = match executor.run(&cmd) {
            Ok(outcome) if outcome.success() => None,
            Ok(outcome) => Some(format!("`{}` failed with {}", cmd, outcome.describe())),
            Err(err) => Some(format!("{:#}", err)),
        };
        if let Some(failure) = failure {
            warn!("{}", failure);
            failures.push(failure);
        }
    }
    failures
}
