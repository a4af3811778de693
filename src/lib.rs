/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod clap_args;
pub mod cluster;
pub mod command;
pub mod config;
pub mod drain;
pub mod driver;
pub mod error;
pub mod process_control;
pub mod summary;
pub mod sweep;
pub mod workload;

use colored::*;
use sweep::SweepPoint;

/// Prints every planned iteration with the commands it would issue, without running anything.
pub fn print_plan(config: &config::Config, points: &[SweepPoint]) {
    let cluster = &config.cluster;
    if sweep::needs_test_files(points) {
        println!(
            "{} {}",
            "files".bold(),
            workload::generate_files_command(cluster, &config.files)
        );
    }

    for point in points {
        println!(
            "\n{} {} {}",
            format!("[{}]", point.index).bright_black(),
            point.sweep.green(),
            point.label()
        );
        println!("\t{} {}", "bring-up".bold(), cluster::bring_up_command(cluster));

        let state = cluster::ClusterConfigState::for_point(point);
        for cmd in state.commands(cluster) {
            println!("\t{} {}", "configure".bold(), cmd);
        }

        let stats_log = cluster.output_dir.join(point.stats_log_name());
        println!(
            "\t{} {}",
            "profiler".bold(),
            workload::profiler_command(cluster, &config.profiler, &stats_log)
        );
        if point.crawler.enabled {
            println!(
                "\t{} {}",
                "crawler".bold(),
                workload::crawler_command(
                    cluster,
                    &point.crawler,
                    &point.pools,
                    point.crawl_mode(),
                    point.chunk_size
                )
            );
        }
        match point.workload {
            sweep::WorkloadKind::Fio { skew } => println!(
                "\t{} {}",
                "workload".bold(),
                workload::fio_command(cluster, &config.workload, &point.pools, skew)
            ),
            sweep::WorkloadKind::Upload => println!(
                "\t{} {}",
                "upload".bold(),
                workload::upload_command(cluster, &config.files, &point.pools)
            ),
        }
        match &point.completion {
            sweep::Completion::Fixed(duration) => {
                println!("\t{} {}s", "wait".bold(), duration.as_secs())
            }
            sweep::Completion::Drain(settings) => println!(
                "\t{} until {} is empty (settle {}s, every {}s, at most {}s)",
                "drain".bold(),
                point.pools.base,
                settings.settle_secs,
                settings.interval_secs,
                settings.max_wait_secs
            ),
        }
    }
}
