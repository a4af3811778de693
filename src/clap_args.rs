/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbose mode (-v, --verbose)
    #[arg(short, long)]
    pub verbose: bool,

    /// Path to the sweep configuration
    #[arg(short, long, default_value = "dedup-sweep.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one or more sweeps against a freshly started cluster per iteration
    Run {
        /// Directory holding the Ceph binaries (overrides cluster.bin_dir)
        #[arg(long)]
        ceph: Option<PathBuf>,

        /// Reuse previously generated test files
        #[arg(long)]
        skip_new_file: bool,

        /// Log every command instead of running it
        #[arg(long)]
        dry_run: bool,

        /// Sweeps to run, in order. Runs every sweep in the config when omitted
        #[arg(short, long = "sweep", value_name = "NAME")]
        sweeps: Vec<String>,
    },

    /// Print the iterations and commands a run would issue
    Plan {
        #[arg(short, long = "sweep", value_name = "NAME")]
        sweeps: Vec<String>,
    },

    /// Write an example configuration file
    Init,
}

pub fn parse() -> Cli {
    Cli::parse()
}
