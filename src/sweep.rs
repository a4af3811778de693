/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::{Config, CrawlMode, CrawlerSettings, DrainSettings, PoolSettings, Sweep, SweepAxes},
    error::DriverError,
};
use itertools::Itertools;
use std::{collections::HashSet, time::Duration};

/// The foreground workload of an iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkloadKind {
    /// Time-boxed fio run with `skew` repeated-pattern streams.
    Fio { skew: u32 },
    /// Synchronous upload of the generated test files.
    Upload,
}

/// When an iteration's workload counts as finished.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Fixed(Duration),
    Drain(DrainSettings),
}

/// Parameters for a single iteration of a sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPoint {
    pub sweep: String,
    /// Position in the whole plan, starting at 0.
    pub index: usize,
    pub mode: Option<CrawlMode>,
    pub skew: Option<u32>,
    pub chunk_size: u32,
    pub workload: WorkloadKind,
    pub completion: Completion,
    pub pools: PoolSettings,
    pub crawler: CrawlerSettings,
}
impl SweepPoint {
    /// Every varying parameter of the point, in a form usable inside a file name.
    pub fn label(&self) -> String {
        let mut parts = vec![];
        if let Some(skew) = self.skew {
            parts.push(format!("skew_{}", skew));
        }
        if let Some(mode) = self.mode {
            parts.push(format!("mode_{}", mode.code()));
        }
        if self.skew.is_none() {
            parts.push(format!("chunk_{}", self.chunk_size));
        }
        parts.join("_")
    }

    /// Log file written by the statistics collector.
    pub fn stats_log_name(&self) -> String {
        format!("{}_{}.log", self.sweep, self.label())
    }

    /// Log file capturing the workload generator's output, if it runs in the background.
    pub fn workload_log_name(&self) -> Option<String> {
        match self.workload {
            WorkloadKind::Fio { .. } => Some(format!("{}_fio_{}.log", self.sweep, self.label())),
            WorkloadKind::Upload => None,
        }
    }

    /// The crawler runs shallow unless the sweep explicitly varies the mode.
    pub fn crawl_mode(&self) -> CrawlMode {
        self.mode.unwrap_or(CrawlMode::Shallow)
    }
}

fn expand_sweep(
    config: &Config,
    sweep: &Sweep,
    first_index: usize,
) -> Result<Vec<SweepPoint>, DriverError> {
    let pools = sweep.pools.clone().unwrap_or_else(|| config.pools.clone());
    let crawler = sweep
        .crawler
        .clone()
        .unwrap_or_else(|| config.crawler.clone());

    let point = |offset: usize,
                 mode: Option<CrawlMode>,
                 skew: Option<u32>,
                 chunk_size: u32,
                 workload: WorkloadKind,
                 completion: Completion| SweepPoint {
        sweep: sweep.name.clone(),
        index: first_index + offset,
        mode,
        skew,
        chunk_size,
        workload,
        completion,
        pools: pools.clone(),
        crawler: crawler.clone(),
    };

    match &sweep.axes {
        SweepAxes::Skew {
            modes,
            skews,
            chunk_size,
            wait_secs,
        } => {
            if modes.is_empty() || skews.is_empty() {
                return Err(DriverError::Plan(format!(
                    "sweep {} needs at least one mode and one skew",
                    sweep.name
                )));
            }
            let streams = config.workload.total_streams;
            if let Some(skew) = skews.iter().find(|s| **s > streams) {
                return Err(DriverError::Plan(format!(
                    "sweep {}: skew {} exceeds the {} configured workload streams",
                    sweep.name, skew, streams
                )));
            }

            Ok(modes
                .iter()
                .cartesian_product(skews.iter())
                .enumerate()
                .map(|(offset, (mode, skew))| {
                    point(
                        offset,
                        Some(*mode),
                        Some(*skew),
                        *chunk_size,
                        WorkloadKind::Fio { skew: *skew },
                        Completion::Fixed(Duration::from_secs(*wait_secs)),
                    )
                })
                .collect())
        }

        SweepAxes::Chunk { chunk_sizes, drain } => {
            if chunk_sizes.is_empty() {
                return Err(DriverError::Plan(format!(
                    "sweep {} needs at least one chunk size",
                    sweep.name
                )));
            }
            if drain.interval_secs == 0 {
                return Err(DriverError::Plan(format!(
                    "sweep {}: drain interval must be at least one second",
                    sweep.name
                )));
            }
            if drain.max_wait_secs > DrainSettings::MAX_WAIT_SECS {
                return Err(DriverError::Plan(format!(
                    "sweep {}: drain max_wait_secs {} exceeds the {}s limit",
                    sweep.name,
                    drain.max_wait_secs,
                    DrainSettings::MAX_WAIT_SECS
                )));
            }

            Ok(chunk_sizes
                .iter()
                .enumerate()
                .map(|(offset, chunk_size)| {
                    point(
                        offset,
                        None,
                        None,
                        *chunk_size,
                        WorkloadKind::Upload,
                        Completion::Drain(drain.clone()),
                    )
                })
                .collect())
        }
    }
}

/// Expands the selected sweeps into iterations, in declared order: sweeps in the order given,
/// and within a skew sweep modes outermost, skews innermost.
///
/// Fails if two iterations would write to the same log file.
pub fn plan(config: &Config, sweeps: &[&Sweep]) -> Result<Vec<SweepPoint>, DriverError> {
    let mut points = vec![];
    for sweep in sweeps {
        let expanded = expand_sweep(config, sweep, points.len())?;
        points.extend(expanded);
    }

    let mut seen = HashSet::new();
    for point in &points {
        if point.chunk_size == 0 {
            return Err(DriverError::Plan(format!(
                "sweep {}: chunk size must be positive",
                point.sweep
            )));
        }
        for name in std::iter::once(point.stats_log_name()).chain(point.workload_log_name()) {
            if !seen.insert(name.clone()) {
                return Err(DriverError::Plan(format!(
                    "log file {} would be written by more than one iteration",
                    name
                )));
            }
        }
    }

    Ok(points)
}

/// Whether any planned iteration uploads generated test files.
pub fn needs_test_files(points: &[SweepPoint]) -> bool {
    points
        .iter()
        .any(|p| matches!(p.workload, WorkloadKind::Upload))
}
