/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

static EXAMPLE_CONFIG: &str = include_str!("templates/dedup-sweep.toml");

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterSettings,
    #[serde(default)]
    pub pools: PoolSettings,
    #[serde(default)]
    pub crawler: CrawlerSettings,
    #[serde(default)]
    pub profiler: ProfilerSettings,
    #[serde(default)]
    pub workload: WorkloadSettings,
    #[serde(default)]
    pub files: FileSettings,
    #[serde(rename(serialize = "sweep", deserialize = "sweep"))]
    pub sweeps: Vec<Sweep>,
}
impl Config {
    pub fn write_example_to_file(path: &Path) -> anyhow::Result<File> {
        let mut file = File::create_new(path)
            .context(format!("Unable to create {}", path.display()))?;
        file.write_all(EXAMPLE_CONFIG.as_bytes())?;
        Ok(file)
    }

    pub fn try_from_path(path: &Path) -> anyhow::Result<Config> {
        let mut config_str = String::new();
        fs::File::open(path)
            .context(format!("Unable to open config file {}", path.display()))?
            .read_to_string(&mut config_str)?;
        Config::try_from_str(&config_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<Config> {
        toml::from_str::<Config>(conf_str).map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))
    }

    pub fn find_sweep(&self, sweep_name: &str) -> anyhow::Result<&Sweep> {
        self.sweeps
            .iter()
            .find(|sweep| sweep.name == sweep_name)
            .context(format!("Unable to find sweep with name {}", sweep_name))
    }

    /// Returns the sweeps to run, in file order. An empty selection means all of them.
    pub fn select_sweeps(&self, names: &[String]) -> anyhow::Result<Vec<&Sweep>> {
        if names.is_empty() {
            return Ok(self.sweeps.iter().collect());
        }
        names.iter().map(|name| self.find_sweep(name)).collect()
    }

    /// Makes every directory in the cluster settings absolute, relative to `base`. External tools
    /// are run from different working directories so relative paths would resolve differently
    /// for each of them.
    pub fn resolve_paths(&mut self, base: &Path) {
        let absolute = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                base.join(p)
            }
        };
        self.cluster.bin_dir = absolute(&self.cluster.bin_dir);
        self.cluster.scripts_dir = absolute(&self.cluster.scripts_dir);
        self.cluster.output_dir = absolute(&self.cluster.output_dir);
    }
}

/// What to do when one of the pool configuration commands exits non-zero.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Warn,
    Abort,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ClusterSettings {
    /// Directory holding `ceph`, `rados`, `rbd` and `ceph-dedup-tool`.
    pub bin_dir: PathBuf,
    /// Directory holding the bring-up, statistics and file helper scripts.
    pub scripts_dir: PathBuf,
    /// Where per-iteration logs and summaries are written.
    pub output_dir: PathBuf,
    pub sudo: bool,
    pub bringup: String,
    pub admin_tool: String,
    pub rados_tool: String,
    pub rbd_tool: String,
    /// Process names force-killed at the end of every iteration.
    pub kill_targets: Vec<String>,
    pub grace_secs: u64,
    pub on_config_failure: FailurePolicy,
}
impl ClusterSettings {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn tool(&self, name: &str) -> PathBuf {
        self.bin_dir.join(name)
    }

    /// The directory the admin tools are run from (the build directory above `bin`).
    pub fn build_dir(&self) -> PathBuf {
        self.bin_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.bin_dir.clone())
    }
}
impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            bin_dir: PathBuf::from("../build/bin"),
            scripts_dir: PathBuf::from("."),
            output_dir: PathBuf::from("."),
            sudo: true,
            bringup: "./bringup_mon_osd.sh".to_string(),
            admin_tool: "ceph".to_string(),
            rados_tool: "rados".to_string(),
            rbd_tool: "rbd".to_string(),
            kill_targets: vec![
                "dedup-tool".to_string(),
                "fio".to_string(),
                "ceph".to_string(),
            ],
            grace_secs: 10,
            on_config_failure: FailurePolicy::Warn,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RbdImage {
    pub name: String,
    pub size: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct PoolSettings {
    pub base: String,
    pub base_pg_num: u32,
    pub chunk: String,
    pub osd_flags: Vec<String>,
    pub chunk_algorithm: String,
    pub fingerprint_algorithm: String,
    pub target_max_objects: u64,
    pub target_max_bytes: u64,
    pub pg_autoscale_mode: String,
    pub cache_target_full_ratio: f64,
    pub cache_min_flush_age: Option<u64>,
    pub cache_min_evict_age: Option<u64>,
    pub rbd_image: Option<RbdImage>,
}
impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            base: "base_pool".to_string(),
            base_pg_num: 128,
            chunk: "chunk_pool".to_string(),
            osd_flags: vec![],
            chunk_algorithm: "fastcdc".to_string(),
            fingerprint_algorithm: "sha1".to_string(),
            target_max_objects: 10000,
            target_max_bytes: 1048576000,
            pg_autoscale_mode: "off".to_string(),
            cache_target_full_ratio: 0.9,
            cache_min_flush_age: None,
            cache_min_evict_age: None,
            rbd_image: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct CrawlerSettings {
    pub enabled: bool,
    pub tool: String,
    pub op: String,
    pub max_thread: u32,
    pub sampling_ratio: u32,
    pub osd_count: u32,
    pub wakeup_period: u32,
    pub object_dedup_threshold: Option<u32>,
    pub iterative: bool,
}
impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            tool: "ceph-dedup-tool".to_string(),
            op: "sample-dedup".to_string(),
            max_thread: 12,
            sampling_ratio: 10,
            osd_count: 3,
            wakeup_period: 10,
            object_dedup_threshold: None,
            iterative: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProfilerSettings {
    pub script: String,
    pub pool: String,
}
impl Default for ProfilerSettings {
    fn default() -> Self {
        Self {
            script: "./accumulate_statistics.py".to_string(),
            pool: "chunk_pool".to_string(),
        }
    }
}

/// fio settings for the skew sweeps.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct WorkloadSettings {
    pub tool: String,
    pub ioengine: String,
    pub clientname: String,
    pub rbdname: String,
    pub bsrange: String,
    pub readwrite: String,
    pub runtime_secs: u64,
    /// Total number of writer streams; `skew` of them write repeated patterns, the rest unique
    /// data.
    pub total_streams: u32,
}
impl Default for WorkloadSettings {
    fn default() -> Self {
        Self {
            tool: "fio".to_string(),
            ioengine: "rbd".to_string(),
            clientname: "admin".to_string(),
            rbdname: "test_rbd".to_string(),
            bsrange: "4m-4m".to_string(),
            readwrite: "randwrite".to_string(),
            runtime_secs: 30,
            total_streams: 10,
        }
    }
}

/// Test-file generation and upload for the chunk-size sweeps.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct FileSettings {
    pub generator: String,
    pub uploader: String,
    pub num_files: u32,
    pub skew_ratio: u32,
    pub dedup_ratio: u32,
}
impl FileSettings {
    pub fn source_dir(&self) -> String {
        format!(
            "test_files_{}_{}_{}",
            self.num_files, self.skew_ratio, self.dedup_ratio
        )
    }
}
impl Default for FileSettings {
    fn default() -> Self {
        Self {
            generator: "./generate_files.py".to_string(),
            uploader: "./process_object.py".to_string(),
            num_files: 1000,
            skew_ratio: 40,
            dedup_ratio: 50,
        }
    }
}

/// Crawling strategy of the dedup tool.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CrawlMode {
    Shallow,
    Full,
}
impl CrawlMode {
    /// Numeric code used in log file names.
    pub fn code(&self) -> u8 {
        match self {
            CrawlMode::Shallow => 0,
            CrawlMode::Full => 1,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct DrainSettings {
    /// Initial wait before the first poll, while the tiering agent starts flushing.
    pub settle_secs: u64,
    pub interval_secs: u64,
    /// Upper bound on the whole wait, settle time included.
    pub max_wait_secs: u64,
}
impl DrainSettings {
    /// Longest drain wait accepted at plan time (30 days).
    pub const MAX_WAIT_SECS: u64 = 30 * 24 * 60 * 60;

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}
impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            settle_secs: 100,
            interval_secs: 5,
            max_wait_secs: 7200,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SweepAxes {
    /// mode × skew, fio workload, fixed wait.
    Skew {
        modes: Vec<CrawlMode>,
        skews: Vec<u32>,
        chunk_size: u32,
        wait_secs: u64,
    },
    /// chunk size, upload workload, drain wait.
    Chunk {
        chunk_sizes: Vec<u32>,
        #[serde(default)]
        drain: DrainSettings,
    },
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Sweep {
    pub name: String,
    #[serde(flatten)]
    pub axes: SweepAxes,
    /// Replaces the top-level `[pools]` table for this sweep.
    pub pools: Option<PoolSettings>,
    /// Replaces the top-level `[crawler]` table for this sweep.
    pub crawler: Option<CrawlerSettings>,
}
