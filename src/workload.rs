/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Argument lists for the external programs started during an iteration.

use crate::{
    command::CommandSpec,
    config::{
        ClusterSettings, CrawlMode, CrawlerSettings, FileSettings, PoolSettings, ProfilerSettings,
        WorkloadSettings,
    },
};
use std::path::Path;

/// Named fio jobs that write unique (non-repeating) data. Always exactly one job, fanned out
/// with `--numjobs`.
pub const UNIQUE_JOBS: u32 = 1;

pub fn profiler_command(
    cluster: &ClusterSettings,
    profiler: &ProfilerSettings,
    log_path: &Path,
) -> CommandSpec {
    CommandSpec::new(&profiler.script)
        .cwd(&cluster.scripts_dir)
        .opt("--ceph", cluster.bin_dir.display())
        .opt("--pool", &profiler.pool)
        .opt("--log", log_path.display())
}

pub fn crawler_command(
    cluster: &ClusterSettings,
    crawler: &CrawlerSettings,
    pools: &PoolSettings,
    mode: CrawlMode,
    chunk_size: u32,
) -> CommandSpec {
    CommandSpec::new(cluster.tool(&crawler.tool).to_string_lossy())
        .sudo(cluster.sudo)
        .switch_if(crawler.iterative, "--iterative")
        .opt("--op", &crawler.op)
        .opt("--base-pool", &pools.base)
        .opt("--chunk-pool", &pools.chunk)
        .opt("--max-thread", crawler.max_thread)
        .switch_if(mode == CrawlMode::Shallow, "--shallow-crawling")
        .opt("--sampling-ratio", crawler.sampling_ratio)
        .opt("--osd-count", crawler.osd_count)
        .opt("--wakeup-period", crawler.wakeup_period)
        .opt_if_some("--object-dedup-threshold", crawler.object_dedup_threshold)
        .opt("--chunk-size", chunk_size)
}

/// A time-based random-write fio run against the RBD image. One `unique` job writes
/// md5-verifiable random data with `total_streams - skew` workers; each of the `skew` extra jobs
/// writes a fixed pattern, so the share of duplicate data grows with the skew.
pub fn fio_command(
    cluster: &ClusterSettings,
    workload: &WorkloadSettings,
    pools: &PoolSettings,
    skew: u32,
) -> CommandSpec {
    let unique_workers = workload.total_streams.saturating_sub(skew);

    let cmd = CommandSpec::new(&workload.tool)
        .sudo(cluster.sudo)
        .opt("--ioengine", &workload.ioengine)
        .opt("--clientname", &workload.clientname)
        .opt("--pool", &pools.base)
        .opt("--rbdname", &workload.rbdname)
        .opt("--invalidate", 0)
        .opt("--direct", 1)
        .opt("--bsrange", &workload.bsrange)
        .arg("--time_based")
        .opt("--runtime", workload.runtime_secs)
        .opt("--do_verify", 0)
        .opt("--readwrite", &workload.readwrite)
        .opt("--verify_state_save", 0)
        .arg("--group_reporting")
        .opt("--name", "unique")
        .opt("--verify", "md5")
        .opt("--numjobs", unique_workers);

    (0..skew).fold(cmd, |cmd, idx| {
        cmd.opt("--name", format!("skew_{}", idx))
            .opt("--verify", "pattern")
            .opt("--verify_pattern", idx)
    })
}

/// Number of named fio jobs issued for a given skew.
pub fn fio_job_count(skew: u32) -> u32 {
    skew + UNIQUE_JOBS
}

pub fn generate_files_command(cluster: &ClusterSettings, files: &FileSettings) -> CommandSpec {
    CommandSpec::new(&files.generator)
        .cwd(&cluster.scripts_dir)
        .opt("-n", files.num_files)
        .opt("-d", files.skew_ratio)
        .opt("-r", files.dedup_ratio)
}

pub fn upload_command(
    cluster: &ClusterSettings,
    files: &FileSettings,
    pools: &PoolSettings,
) -> CommandSpec {
    CommandSpec::new(&files.uploader)
        .cwd(&cluster.scripts_dir)
        .opt("--ceph", cluster.bin_dir.display())
        .opt("--src", files.source_dir())
        .opt("--pool", &pools.base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn cluster() -> ClusterSettings {
        ClusterSettings {
            bin_dir: PathBuf::from("/ceph/build/bin"),
            scripts_dir: PathBuf::from("/ceph/scripts"),
            ..Default::default()
        }
    }

    #[test]
    fn fio_job_count_is_skew_plus_unique() {
        for skew in 0..=10 {
            let cmd = fio_command(
                &cluster(),
                &WorkloadSettings::default(),
                &PoolSettings::default(),
                skew,
            );
            assert_eq!(cmd.count_of("--name") as u32, fio_job_count(skew));
            assert_eq!(cmd.count_of("--verify_pattern") as u32, skew);
        }
    }

    #[test]
    fn fio_splits_streams_between_unique_and_skewed() {
        let cmd = fio_command(
            &cluster(),
            &WorkloadSettings::default(),
            &PoolSettings::default(),
            3,
        );

        assert_eq!(cmd.value_of("--numjobs"), Some("7"));
        assert_eq!(cmd.value_of("--pool"), Some("base_pool"));
        assert_eq!(cmd.value_of("--runtime"), Some("30"));
        let args = cmd.args_slice().join(" ");
        assert!(args.ends_with(
            "--name skew_0 --verify pattern --verify_pattern 0 \
             --name skew_1 --verify pattern --verify_pattern 1 \
             --name skew_2 --verify pattern --verify_pattern 2"
        ));
        assert_eq!(cmd.argv()[0], "sudo");
    }

    #[test]
    fn crawler_mode_toggles_shallow_crawling() {
        let crawler = CrawlerSettings {
            object_dedup_threshold: Some(40),
            ..Default::default()
        };
        let shallow = crawler_command(
            &cluster(),
            &crawler,
            &PoolSettings::default(),
            CrawlMode::Shallow,
            16384,
        );
        let full = crawler_command(
            &cluster(),
            &crawler,
            &PoolSettings::default(),
            CrawlMode::Full,
            16384,
        );

        assert_eq!(shallow.count_of("--shallow-crawling"), 1);
        assert_eq!(full.count_of("--shallow-crawling"), 0);
        assert_eq!(shallow.program(), "/ceph/build/bin/ceph-dedup-tool");
        assert_eq!(
            full.args_slice().join(" "),
            "--iterative --op sample-dedup --base-pool base_pool --chunk-pool chunk_pool \
             --max-thread 12 --sampling-ratio 10 --osd-count 3 --wakeup-period 10 \
             --object-dedup-threshold 40 --chunk-size 16384"
        );
    }

    #[test]
    fn profiler_gets_the_iteration_log() {
        let cmd = profiler_command(
            &cluster(),
            &ProfilerSettings::default(),
            Path::new("/results/test_03_skew_1_mode_0.log"),
        );

        assert_eq!(cmd.program(), "./accumulate_statistics.py");
        assert!(!cmd.uses_sudo());
        assert_eq!(cmd.value_of("--ceph"), Some("/ceph/build/bin"));
        assert_eq!(cmd.value_of("--pool"), Some("chunk_pool"));
        assert_eq!(
            cmd.value_of("--log"),
            Some("/results/test_03_skew_1_mode_0.log")
        );
    }

    #[test]
    fn upload_reads_from_the_generated_directory() {
        let files = FileSettings::default();
        let gen = generate_files_command(&cluster(), &files);
        let upload = upload_command(&cluster(), &files, &PoolSettings::default());

        assert_eq!(gen.args_slice().join(" "), "-n 1000 -d 40 -r 50");
        assert_eq!(upload.value_of("--src"), Some("test_files_1000_40_50"));
        assert_eq!(
            upload.working_dir(),
            Some(PathBuf::from("/ceph/scripts").as_path())
        );
    }
}
