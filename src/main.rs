/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use colored::*;
use dedup_sweep::{
    clap_args::{self, Commands},
    command::{DryRunExecutor, Executor, SystemExecutor},
    config::Config,
    driver::{Driver, DriverOptions},
    print_plan, sweep,
};
use nanoid::nanoid;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, subscriber::set_global_default, Subscriber};
use tracing_subscriber::EnvFilter;

fn get_subscriber(env_filter: &str) -> impl Subscriber + Sync + Send {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .finish()
}

/// Loads the config and makes its directories absolute. `bin_dir` overrides `cluster.bin_dir`.
fn load_config(path: &Path, bin_dir: Option<PathBuf>) -> anyhow::Result<Config> {
    let mut config = Config::try_from_path(path)?;
    if let Some(bin_dir) = bin_dir {
        config.cluster.bin_dir = bin_dir;
    }
    let cwd = std::env::current_dir().context("Unable to read the current directory")?;
    config.resolve_paths(&cwd);
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = clap_args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    set_global_default(get_subscriber(level)).context("Failed to set tracing subscriber")?;

    match args.command {
        Commands::Init => {
            Config::write_example_to_file(&args.config)?;
            println!("{} {}", "written".green(), args.config.display());
        }

        Commands::Plan { sweeps } => {
            let config = load_config(&args.config, None)?;
            let selected = config.select_sweeps(&sweeps)?;
            let points = sweep::plan(&config, &selected)?;
            print_plan(&config, &points);
            println!("\n{} iterations", points.len());
        }

        Commands::Run {
            ceph,
            skip_new_file,
            dry_run,
            sweeps,
        } => {
            let config = load_config(&args.config, ceph)?;
            let selected = config.select_sweeps(&sweeps)?;
            let points = sweep::plan(&config, &selected)?;

            let token = CancellationToken::new();
            let handler_token = token.clone();
            ctrlc::set_handler(move || {
                eprintln!("{}", "> interrupted, tearing down".yellow());
                handler_token.cancel();
            })
            .context("Failed to install the Ctrl-C handler")?;

            let run_id = nanoid!(5, &nanoid::alphabet::SAFE);
            let options = DriverOptions {
                skip_new_files: skip_new_file,
                scan_residuals: !dry_run,
                exclusive: !dry_run,
                skip_waits: dry_run,
                ..DriverOptions::new(run_id.clone())
            };
            let executor: Box<dyn Executor> = if dry_run {
                Box::new(DryRunExecutor)
            } else {
                Box::new(SystemExecutor)
            };

            info!("run {}: {} iterations", run_id, points.len());
            let outcome = Driver::new(&config, executor.as_ref(), token, options)
                .run(&points)
                .await;

            println!("{}", outcome.report.render_table());
            println!(
                "{}/{} iterations completed, {} warnings",
                outcome.report.completed(),
                points.len(),
                outcome.report.warning_count()
            );

            outcome.into_result()?;
        }
    }

    Ok(())
}
