/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    cluster::{self, ClusterConfigState},
    command::{CommandSpec, Executor, Redirect},
    config::{Config, FailurePolicy},
    drain::{sleep_or_cancel, wait_for_drain, RadosDfProbe},
    error::DriverError,
    process_control::{
        force_kill_by_name, wait_for_residuals, KillByName, ManagedProcess, ProcessRole,
        Termination,
    },
    summary::{IterationReport, IterationStatus, SweepReport, TeardownEntry},
    sweep::{needs_test_files, Completion, SweepPoint, WorkloadKind},
    workload,
};
use anyhow::Context;
use chrono::Utc;
use colored::*;
use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long killed processes get to disappear from the process table before they are reported.
const RESIDUAL_SETTLE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub run_id: String,
    /// Reuse the test files from a previous run instead of regenerating them.
    pub skip_new_files: bool,
    /// Look for surviving processes by name after every teardown.
    pub scan_residuals: bool,
    /// Hold a lock file in the scripts directory for the duration of the sweep.
    pub exclusive: bool,
    /// Log the completion wait of each iteration instead of waiting.
    pub skip_waits: bool,
}
impl DriverOptions {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            skip_new_files: false,
            scan_residuals: true,
            exclusive: true,
            skip_waits: false,
        }
    }
}

/// Guards against two drivers sharing one cluster. The lock file is removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}
impl RunLock {
    pub const FILE_NAME: &'static str = ".dedup-sweep.lock";

    pub fn acquire(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join(Self::FILE_NAME);
        let mut file = File::create_new(&path).context(format!(
            "Another sweep appears to be running (lock file {} exists)",
            path.display()
        ))?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { path })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("Failed to remove lock file {}: {}", self.path.display(), err);
        }
    }
}

#[derive(Debug)]
pub struct SweepOutcome {
    pub report: SweepReport,
    pub error: Option<DriverError>,
}
impl SweepOutcome {
    pub fn into_result(self) -> Result<SweepReport, DriverError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.report),
        }
    }
}

/// Everything one iteration starts. Processes are stopped in teardown; if the iteration is
/// dropped early the `ManagedProcess` drop impls kill whatever is left.
struct Iteration<'p> {
    point: &'p SweepPoint,
    stats_log: PathBuf,
    workload_log: Option<PathBuf>,
    profiler: Option<ManagedProcess>,
    workload: Option<ManagedProcess>,
    crawler: Option<ManagedProcess>,
    warnings: Vec<String>,
    drain_polls: Option<u32>,
}
impl<'p> Iteration<'p> {
    fn new(point: &'p SweepPoint, output_dir: &Path) -> Self {
        Self {
            point,
            stats_log: output_dir.join(point.stats_log_name()),
            workload_log: point.workload_log_name().map(|n| output_dir.join(n)),
            profiler: None,
            workload: None,
            crawler: None,
            warnings: vec![],
            drain_polls: None,
        }
    }

    fn warn(&mut self, msg: String) {
        warn!("{}", msg);
        self.warnings.push(msg);
    }
}

pub struct Driver<'a> {
    config: &'a Config,
    executor: &'a dyn Executor,
    token: CancellationToken,
    options: DriverOptions,
}
impl<'a> Driver<'a> {
    pub fn new(
        config: &'a Config,
        executor: &'a dyn Executor,
        token: CancellationToken,
        options: DriverOptions,
    ) -> Self {
        Self {
            config,
            executor,
            token,
            options,
        }
    }

    /// Runs every point in order. Iterations never overlap, and each one is fully torn down
    /// before the next bring-up. Stops early on a fatal error (drain timeout, cancellation).
    pub async fn run(&self, points: &[SweepPoint]) -> SweepOutcome {
        let mut report = SweepReport::new(&self.options.run_id);

        let error = match self.prepare(points) {
            Ok(_lock) => self.run_points(points, &mut report).await,
            Err(err) => Some(err),
        };

        report.finish(error.as_ref().map(|e| e.to_string()));
        match report.write_json(&self.config.cluster.output_dir) {
            Ok(path) => info!("summary written to {}", path.display()),
            Err(err) => warn!("Failed to write summary: {:#}", err),
        }

        SweepOutcome { report, error }
    }

    fn prepare(&self, points: &[SweepPoint]) -> Result<Option<RunLock>, DriverError> {
        let cluster = &self.config.cluster;
        fs::create_dir_all(&cluster.output_dir).map_err(|e| {
            DriverError::Plan(format!(
                "cannot create output dir {}: {}",
                cluster.output_dir.display(),
                e
            ))
        })?;

        let lock = if self.options.exclusive {
            let lock = RunLock::acquire(&cluster.scripts_dir)
                .map_err(|e| DriverError::Plan(format!("{:#}", e)))?;
            Some(lock)
        } else {
            None
        };

        if needs_test_files(points) {
            if self.options.skip_new_files {
                info!("reusing test files in {}", self.config.files.source_dir());
            } else {
                println!("> generating test files");
                let cmd = workload::generate_files_command(cluster, &self.config.files);
                match self.executor.run(&cmd) {
                    Ok(outcome) if outcome.success() => {}
                    Ok(outcome) => warn!("`{}` failed with {}", cmd, outcome.describe()),
                    Err(err) => warn!("{:#}", err),
                }
            }
        }

        Ok(lock)
    }

    async fn run_points(
        &self,
        points: &[SweepPoint],
        report: &mut SweepReport,
    ) -> Option<DriverError> {
        for point in points {
            if self.token.is_cancelled() {
                return Some(DriverError::Cancelled);
            }

            println!(
                "> running {} {} ({}/{})",
                point.sweep.green(),
                point.label(),
                point.index + 1,
                points.len()
            );
            let (iteration_report, error) = self.run_iteration(point).await;
            report.iterations.push(iteration_report);

            match error {
                Some(err) if err.is_fatal() => return Some(err),
                Some(err) => warn!("iteration {} failed: {}", point.label(), err),
                None => {}
            }
        }
        None
    }

    /// Runs one iteration and always tears it down, whatever happened in between.
    pub async fn run_iteration(&self, point: &SweepPoint) -> (IterationReport, Option<DriverError>) {
        let started_at = Utc::now();
        let mut it = Iteration::new(point, &self.config.cluster.output_dir);

        let result = self.execute(&mut it).await;
        let teardown = self.teardown(&mut it).await;

        let (status, error) = match result {
            Ok(()) => (IterationStatus::Completed, None),
            Err(DriverError::Cancelled) => (IterationStatus::Cancelled, Some(DriverError::Cancelled)),
            Err(err) => (IterationStatus::Failed(err.to_string()), Some(err)),
        };

        let report = IterationReport {
            sweep: point.sweep.clone(),
            index: point.index,
            label: point.label(),
            stats_log: it.stats_log.clone(),
            workload_log: it.workload_log.clone(),
            started_at,
            finished_at: Utc::now(),
            status,
            warnings: std::mem::take(&mut it.warnings),
            drain_polls: it.drain_polls,
            teardown,
        };
        (report, error)
    }

    fn check_cancelled(&self) -> Result<(), DriverError> {
        if self.token.is_cancelled() {
            Err(DriverError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn spawn(
        &self,
        it: &mut Iteration,
        role: ProcessRole,
        termination: Termination,
        cmd: CommandSpec,
        redirect: Redirect,
    ) -> Option<ManagedProcess> {
        match self.executor.spawn(&cmd, &redirect) {
            Ok(handle) => {
                println!("\t{}", format!("- {}", cmd).bright_black());
                Some(ManagedProcess::new(role, cmd.program(), termination, handle))
            }
            Err(err) => {
                it.warn(format!("Failed to start {}: {:#}", role, err));
                None
            }
        }
    }

    async fn execute(&self, it: &mut Iteration<'_>) -> Result<(), DriverError> {
        let cluster = &self.config.cluster;
        let point = it.point;

        fs::create_dir_all(&cluster.output_dir).map_err(|e| {
            DriverError::Plan(format!(
                "cannot create output dir {}: {}",
                cluster.output_dir.display(),
                e
            ))
        })?;

        println!("> bring-up");
        cluster::bring_up(self.executor, cluster)?;
        self.check_cancelled()?;

        println!("> configure");
        let state = ClusterConfigState::for_point(point);
        let failures = cluster::configure(self.executor, cluster, &state);
        let failed = failures.len();
        it.warnings.extend(failures);
        if failed > 0 && cluster.on_config_failure == FailurePolicy::Abort {
            return Err(DriverError::Configure(format!(
                "{} configuration command(s) failed",
                failed
            )));
        }
        self.check_cancelled()?;

        println!("> statistics collector");
        let cmd = workload::profiler_command(cluster, &self.config.profiler, &it.stats_log);
        it.profiler = self.spawn(
            it,
            ProcessRole::StatisticsCollector,
            Termination::Graceful,
            cmd,
            Redirect::Null,
        );

        if point.crawler.enabled {
            println!("> crawler ({:?})", point.crawl_mode());
            let cmd = workload::crawler_command(
                cluster,
                &point.crawler,
                &point.pools,
                point.crawl_mode(),
                point.chunk_size,
            );
            it.crawler = self.spawn(it, ProcessRole::Crawler, Termination::Kill, cmd, Redirect::Null);
        }

        match point.workload {
            WorkloadKind::Fio { skew } => {
                println!("> workload (skew {})", skew);
                let cmd =
                    workload::fio_command(cluster, &self.config.workload, &point.pools, skew);
                let redirect = match &it.workload_log {
                    Some(path) => Redirect::File(path.clone()),
                    None => Redirect::Null,
                };
                it.workload = self.spawn(
                    it,
                    ProcessRole::Workload,
                    Termination::Graceful,
                    cmd,
                    redirect,
                );
            }
            WorkloadKind::Upload => {
                println!("> uploading objects");
                let cmd = workload::upload_command(cluster, &self.config.files, &point.pools);
                match self.executor.run(&cmd) {
                    Ok(outcome) if outcome.success() => {}
                    Ok(outcome) => it.warn(format!("`{}` failed with {}", cmd, outcome.describe())),
                    Err(err) => it.warn(format!("{:#}", err)),
                }
            }
        }

        if self.options.skip_waits {
            info!("[dry-run] skipping the completion wait ({:?})", point.completion);
            return Ok(());
        }

        match &point.completion {
            Completion::Fixed(duration) => {
                println!("> waiting {}s", duration.as_secs());
                sleep_or_cancel(*duration, &self.token).await?;
            }
            Completion::Drain(settings) => {
                println!("> waiting for {} to drain", point.pools.base);
                let mut probe = RadosDfProbe::new(self.executor, cluster, &point.pools.base);
                let drained =
                    wait_for_drain(&mut probe, &point.pools.base, settings, &self.token).await?;
                it.drain_polls = Some(drained.polls);
            }
        }

        Ok(())
    }

    /// Stops the statistics collector, then the workload generator, then kills the crawler, then
    /// force-kills every configured process name whether or not the earlier steps worked.
    ///
    /// The stops block the runtime thread for up to twice the grace period each. The driver is the
    /// only task on the runtime and Ctrl-C is handled on its own thread, so nothing waits on it.
    async fn teardown(&self, it: &mut Iteration<'_>) -> Vec<TeardownEntry> {
        let cluster = &self.config.cluster;
        let grace = cluster.grace();
        println!("> teardown");

        let mut entries = vec![];
        let slots = [
            it.profiler.take(),
            it.workload.take(),
            it.crawler.take(),
        ];
        for mut proc in slots.into_iter().flatten() {
            let outcome = proc.stop(grace);
            info!("stopped {} ({}): {:?}", proc.role(), proc.name(), outcome);
            entries.push(TeardownEntry {
                process: proc.role().to_string(),
                outcome: format!("{:?}", outcome),
            });
        }

        for name in &cluster.kill_targets {
            match force_kill_by_name(self.executor, name, cluster.sudo) {
                Ok(KillByName::Matched) => info!("killed stray {} processes", name),
                Ok(KillByName::NoneMatched) => {}
                Err(err) => it.warn(format!("{:#}", err)),
            }
        }

        if self.options.scan_residuals {
            let survivors = wait_for_residuals(&cluster.kill_targets, RESIDUAL_SETTLE).await;
            for (pid, name) in survivors {
                it.warn(format!("process {} ({}) survived teardown", pid, name));
            }
        }

        println!("\t{}", "✓".green());
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::CommandOutcome,
        process_control::ProcessHandle,
        sweep::plan,
    };
    use itertools::Itertools;
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
        time::Duration,
    };
    use subprocess::ExitStatus;

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
        live: usize,
        live_at_bring_up: Vec<usize>,
        df_readings: VecDeque<i64>,
    }

    fn base_name(program: &str) -> String {
        Path::new(program)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// Records every command and hands out fake processes that count themselves as live until
    /// they are terminated or killed.
    struct FakeExecutor {
        recorder: Arc<Mutex<Recorder>>,
        /// Programs whose processes ignore terminate.
        stubborn: Vec<&'static str>,
        /// Bring-up calls (0-based) that fail.
        failing_bring_ups: Vec<usize>,
        failing_config: bool,
        bring_ups: Mutex<usize>,
    }
    impl FakeExecutor {
        fn new() -> Self {
            Self {
                recorder: Arc::new(Mutex::new(Recorder::default())),
                stubborn: vec![],
                failing_bring_ups: vec![],
                failing_config: false,
                bring_ups: Mutex::new(0),
            }
        }

        fn events(&self) -> Vec<String> {
            self.recorder.lock().unwrap().events.clone()
        }

        fn live(&self) -> usize {
            self.recorder.lock().unwrap().live
        }
    }

    impl Executor for FakeExecutor {
        fn run(&self, cmd: &CommandSpec) -> anyhow::Result<CommandOutcome> {
            let program = base_name(cmd.program());
            let mut rec = self.recorder.lock().unwrap();
            rec.events
                .push(format!("run {} {}", program, cmd.args_slice().join(" ")).trim().to_string());

            match program.as_str() {
                "bringup_mon_osd.sh" => {
                    let live = rec.live;
                    rec.live_at_bring_up.push(live);
                    let mut count = self.bring_ups.lock().unwrap();
                    let n = *count;
                    *count += 1;
                    if self.failing_bring_ups.contains(&n) {
                        return Ok(CommandOutcome::failed(1, "mon.a failed to start"));
                    }
                    Ok(CommandOutcome::ok(""))
                }
                "ceph" if self.failing_config => {
                    Ok(CommandOutcome::failed(22, "Error EINVAL"))
                }
                "rados" => {
                    let reading = rec.df_readings.pop_front().unwrap_or(1);
                    Ok(CommandOutcome::ok(format!(
                        "POOL_NAME USED OBJECTS\nbase_pool {} 0\nchunk_pool 0 0\n",
                        reading
                    )))
                }
                "pkill" => Ok(CommandOutcome::failed(1, "")),
                _ => Ok(CommandOutcome::ok("")),
            }
        }

        fn spawn(
            &self,
            cmd: &CommandSpec,
            redirect: &Redirect,
        ) -> anyhow::Result<Box<dyn ProcessHandle>> {
            let program = base_name(cmd.program());
            if let Redirect::File(path) = redirect {
                File::create(path)?;
            }
            {
                let mut rec = self.recorder.lock().unwrap();
                rec.events.push(format!("spawn {}", program));
                rec.live += 1;
            }
            Ok(Box::new(FakeHandle {
                program: program.clone(),
                stubborn: self.stubborn.contains(&program.as_str()),
                exited: None,
                recorder: self.recorder.clone(),
            }))
        }
    }

    struct FakeHandle {
        program: String,
        stubborn: bool,
        exited: Option<ExitStatus>,
        recorder: Arc<Mutex<Recorder>>,
    }
    impl FakeHandle {
        fn exit(&mut self, status: ExitStatus) {
            if self.exited.is_none() {
                self.exited = Some(status);
                self.recorder.lock().unwrap().live -= 1;
            }
        }

        fn record(&self, event: &str) {
            self.recorder
                .lock()
                .unwrap()
                .events
                .push(format!("{} {}", event, self.program));
        }
    }

    impl ProcessHandle for FakeHandle {
        fn pid(&self) -> Option<u32> {
            Some(1000)
        }
        fn poll(&mut self) -> Option<ExitStatus> {
            self.exited
        }
        fn terminate(&mut self) -> anyhow::Result<()> {
            self.record("terminate");
            if !self.stubborn {
                self.exit(ExitStatus::Signaled(15));
            }
            Ok(())
        }
        fn kill(&mut self) -> anyhow::Result<()> {
            self.record("kill");
            self.exit(ExitStatus::Signaled(9));
            Ok(())
        }
        fn wait_timeout(&mut self, _timeout: Duration) -> anyhow::Result<Option<ExitStatus>> {
            Ok(self.exited)
        }
    }

    fn config_in(dir: &Path) -> Config {
        let mut cfg = Config::try_from_path(Path::new("./fixtures/dedup-sweep.success.toml"))
            .expect("fixture should parse");
        cfg.cluster.bin_dir = dir.join("build/bin");
        cfg.cluster.scripts_dir = dir.to_path_buf();
        cfg.cluster.output_dir = dir.join("results");
        cfg.cluster.grace_secs = 0;
        cfg
    }

    fn options() -> DriverOptions {
        DriverOptions {
            scan_residuals: false,
            ..DriverOptions::new("test1")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn skew_sweep_runs_twenty_isolated_iterations() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cfg = config_in(dir.path());
        let points = plan(&cfg, &[cfg.find_sweep("test_03")?])?;
        let executor = FakeExecutor::new();
        let driver = Driver::new(&cfg, &executor, CancellationToken::new(), options());

        let started = tokio::time::Instant::now();
        let report = driver.run(&points).await.into_result()?;

        assert_eq!(report.iterations.len(), 20);
        assert_eq!(report.completed(), 20);
        assert_eq!(started.elapsed(), Duration::from_secs(20 * 600));

        // nothing is alive when the next cluster comes up, nor at the end
        let rec = executor.recorder.lock().unwrap();
        assert_eq!(rec.live_at_bring_up, vec![0; 20]);
        assert_eq!(rec.live, 0);
        drop(rec);

        // each iteration leaves exactly one stats log and one fio log, none shared
        let logs = report
            .iterations
            .iter()
            .flat_map(|it| [Some(it.stats_log.clone()), it.workload_log.clone()])
            .flatten()
            .collect_vec();
        assert_eq!(logs.len(), 40);
        assert_eq!(logs.iter().unique().count(), 40);
        assert!(report
            .iterations
            .iter()
            .all(|it| it.workload_log.as_ref().is_some_and(|p| p.exists())));
        assert!(dir.path().join("results/summary_test1.json").exists());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn iteration_steps_run_in_order() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cfg = config_in(dir.path());
        let points = plan(&cfg, &[cfg.find_sweep("test_03")?])?;
        let executor = FakeExecutor::new();
        let driver = Driver::new(&cfg, &executor, CancellationToken::new(), options());

        let (report, error) = driver.run_iteration(&points[0]).await;
        assert!(error.is_none());
        assert_eq!(report.status, IterationStatus::Completed);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert!(report.workload_log.as_ref().is_some_and(|p| p.exists()));
        assert_eq!(executor.live(), 0);

        let events = executor
            .events()
            .into_iter()
            .filter(|e| !e.starts_with("run ceph") && !e.starts_with("run rbd"))
            .collect_vec();
        assert_eq!(
            events,
            [
                "run bringup_mon_osd.sh",
                "spawn accumulate_statistics.py",
                "spawn ceph-dedup-tool",
                "spawn fio",
                "terminate accumulate_statistics.py",
                "terminate fio",
                "kill ceph-dedup-tool",
                "run pkill -9 dedup-tool",
                "run pkill -9 fio",
                "run pkill -9 ceph",
            ]
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_workload_is_killed_and_the_sweep_moves_on() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cfg = config_in(dir.path());
        let sweep = cfg.find_sweep("test_03")?;
        let points = plan(&cfg, &[sweep])?.into_iter().take(2).collect_vec();
        let mut executor = FakeExecutor::new();
        executor.stubborn = vec!["fio"];
        let driver = Driver::new(&cfg, &executor, CancellationToken::new(), options());

        let report = driver.run(&points).await.into_result()?;

        assert_eq!(report.completed(), 2);
        let fio = &report.iterations[0].teardown[1];
        assert_eq!(fio.process, "workload generator");
        assert_eq!(fio.outcome, "Killed { escalated: true }");
        assert_eq!(executor.live(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn failed_bring_up_skips_only_that_iteration() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cfg = config_in(dir.path());
        let points = plan(&cfg, &[cfg.find_sweep("test_04")?])?;
        let mut executor = FakeExecutor::new();
        executor.failing_bring_ups = vec![1];
        executor.recorder.lock().unwrap().df_readings = VecDeque::from(vec![0; 5]);
        let driver = Driver::new(&cfg, &executor, CancellationToken::new(), options());

        let report = driver.run(&points).await.into_result()?;

        assert_eq!(report.iterations.len(), 5);
        assert_eq!(report.completed(), 4);
        assert!(matches!(
            report.iterations[1].status,
            IterationStatus::Failed(_)
        ));
        // the failed iteration still ran the by-name kills
        let pkills = executor
            .events()
            .iter()
            .filter(|e| e.starts_with("run pkill"))
            .count();
        assert_eq!(pkills, 5 * 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn chunk_sweep_uploads_and_waits_for_drain() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cfg = config_in(dir.path());
        let points = plan(&cfg, &[cfg.find_sweep("test_04")?])?;
        let points = &points[..1];
        let executor = FakeExecutor::new();
        executor.recorder.lock().unwrap().df_readings = VecDeque::from(vec![100, 50, 1, 0]);
        let driver = Driver::new(&cfg, &executor, CancellationToken::new(), options());

        let report = driver.run(points).await.into_result()?;

        assert_eq!(report.iterations[0].drain_polls, Some(4));
        let events = executor.events();
        assert!(events.contains(&"run generate_files.py -n 1000 -d 40 -r 50".to_string()));
        let upload = events
            .iter()
            .position(|e| e.starts_with("run process_object.py"))
            .expect("upload should run");
        let first_df = events
            .iter()
            .position(|e| e == "run rados df")
            .expect("drain should poll");
        assert!(upload < first_df);
        assert!(!events.iter().any(|e| e == "spawn fio"));
        assert!(!events.iter().any(|e| e == "spawn ceph-dedup-tool"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn skip_new_files_does_not_regenerate() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cfg = config_in(dir.path());
        let points = plan(&cfg, &[cfg.find_sweep("test_04")?])?;
        let executor = FakeExecutor::new();
        executor.recorder.lock().unwrap().df_readings = VecDeque::from(vec![0; 5]);
        let opts = DriverOptions {
            skip_new_files: true,
            ..options()
        };
        let driver = Driver::new(&cfg, &executor, CancellationToken::new(), opts);

        driver.run(&points).await.into_result()?;
        assert!(!executor
            .events()
            .iter()
            .any(|e| e.starts_with("run generate_files.py")));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn drain_timeout_stops_the_sweep_after_teardown() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut cfg = config_in(dir.path());
        if let crate::config::SweepAxes::Chunk { drain, .. } = &mut cfg.sweeps[1].axes {
            drain.max_wait_secs = 300;
        }
        let points = plan(&cfg, &[cfg.find_sweep("test_04")?])?;
        let executor = FakeExecutor::new();
        let driver = Driver::new(&cfg, &executor, CancellationToken::new(), options());

        let outcome = driver.run(&points).await;

        assert!(matches!(
            outcome.error,
            Some(DriverError::DrainTimeout { .. })
        ));
        assert_eq!(outcome.report.iterations.len(), 1);
        assert!(outcome.report.fatal.is_some());
        assert_eq!(executor.live(), 0);
        assert!(executor.events().last().unwrap().starts_with("run pkill"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_runs_teardown_and_stops() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cfg = config_in(dir.path());
        let points = plan(&cfg, &[cfg.find_sweep("test_03")?])?;
        let executor = FakeExecutor::new();
        let token = CancellationToken::new();
        let driver = Driver::new(&cfg, &executor, token.clone(), options());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(900)).await;
            token.cancel();
        });
        let outcome = driver.run(&points).await;
        canceller.await?;

        assert!(matches!(outcome.error, Some(DriverError::Cancelled)));
        assert_eq!(outcome.report.iterations.len(), 2);
        assert_eq!(
            outcome.report.iterations[1].status,
            IterationStatus::Cancelled
        );
        assert_eq!(executor.live(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn abort_policy_skips_processes_on_config_failure() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut cfg = config_in(dir.path());
        cfg.cluster.on_config_failure = FailurePolicy::Abort;
        let points = plan(&cfg, &[cfg.find_sweep("test_03")?])?;
        let mut executor = FakeExecutor::new();
        executor.failing_config = true;
        let driver = Driver::new(&cfg, &executor, CancellationToken::new(), options());

        let (report, error) = driver.run_iteration(&points[0]).await;

        assert!(matches!(error, Some(DriverError::Configure(_))));
        assert!(!report.warnings.is_empty());
        assert!(!executor.events().iter().any(|e| e.starts_with("spawn")));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn warn_policy_keeps_going_on_config_failure() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cfg = config_in(dir.path());
        let points = plan(&cfg, &[cfg.find_sweep("test_03")?])?;
        let mut executor = FakeExecutor::new();
        executor.failing_config = true;
        let driver = Driver::new(&cfg, &executor, CancellationToken::new(), options());

        let (report, error) = driver.run_iteration(&points[0]).await;

        assert!(error.is_none());
        assert_eq!(report.status, IterationStatus::Completed);
        assert!(!report.warnings.is_empty());
        assert!(report.warnings.iter().all(|w| w.contains("exit code 22")));
        assert!(executor.events().contains(&"spawn fio".to_string()));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn workload_that_cannot_start_is_a_warning() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cfg = config_in(dir.path());
        let points = plan(&cfg, &[cfg.find_sweep("test_03")?])?;
        // a directory where the fio log should go makes the log file impossible to create
        let log_name = points[0].workload_log_name().expect("skew points log fio output");
        fs::create_dir_all(cfg.cluster.output_dir.join(log_name))?;
        let executor = FakeExecutor::new();
        let driver = Driver::new(&cfg, &executor, CancellationToken::new(), options());

        let (report, error) = driver.run_iteration(&points[0]).await;

        assert!(error.is_none());
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("workload generator"));
        assert!(!executor.events().contains(&"spawn fio".to_string()));
        assert_eq!(report.teardown.len(), 2);
        assert_eq!(executor.live(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_waits_do_not_advance_the_clock() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cfg = config_in(dir.path());
        let points = plan(&cfg, &[cfg.find_sweep("test_03")?, cfg.find_sweep("test_04")?])?;
        let executor = FakeExecutor::new();
        let opts = DriverOptions {
            skip_waits: true,
            ..options()
        };
        let driver = Driver::new(&cfg, &executor, CancellationToken::new(), opts);

        let started = tokio::time::Instant::now();
        let report = driver.run(&points).await.into_result()?;

        assert_eq!(report.completed(), 25);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(!executor.events().iter().any(|e| e == "run rados df"));
        Ok(())
    }

    #[test]
    fn second_lock_is_refused() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let lock = RunLock::acquire(dir.path())?;
        assert!(RunLock::acquire(dir.path()).is_err());
        drop(lock);
        assert!(RunLock::acquire(dir.path()).is_ok());
        Ok(())
    }
}
