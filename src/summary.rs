/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use chrono::{DateTime, Utc};
use colored::*;
use serde::Serialize;
use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};
use term_table::{row, row::Row, table_cell::*, Table, TableStyle};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum IterationStatus {
    Completed,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct TeardownEntry {
    pub process: String,
    pub outcome: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationReport {
    pub sweep: String,
    pub index: usize,
    pub label: String,
    pub stats_log: PathBuf,
    pub workload_log: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: IterationStatus,
    pub warnings: Vec<String>,
    pub drain_polls: Option<u32>,
    pub teardown: Vec<TeardownEntry>,
}
impl IterationReport {
    pub fn duration_secs(&self) -> i64 {
        (self.finished_at - self.started_at).num_seconds()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub iterations: Vec<IterationReport>,
    pub fatal: Option<String>,
}
impl SweepReport {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            iterations: vec![],
            fatal: None,
        }
    }

    pub fn finish(&mut self, fatal: Option<String>) {
        self.finished_at = Some(Utc::now());
        self.fatal = fatal;
    }

    pub fn completed(&self) -> usize {
        self.iterations
            .iter()
            .filter(|it| it.status == IterationStatus::Completed)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.iterations.iter().map(|it| it.warnings.len()).sum()
    }

    pub fn file_name(&self) -> String {
        format!("summary_{}.json", self.run_id)
    }

    /// Writes the report as pretty JSON into `dir` and returns the path written.
    pub fn write_json(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        let path = dir.join(self.file_name());
        let json = serde_json::to_string_pretty(self)?;
        let mut file =
            File::create(&path).context(format!("Unable to create {}", path.display()))?;
        file.write_all(json.as_bytes())?;
        Ok(path)
    }

    pub fn render_table(&self) -> String {
        let mut rows = vec![row![
            TableCell::builder("Sweep".bold()).build(),
            TableCell::builder("Point".bold()).build(),
            TableCell::builder("Duration (s)".bold()).build(),
            TableCell::builder("Status".bold()).build(),
            TableCell::builder("Warnings".bold()).build(),
            TableCell::builder("Stats log".bold()).build()
        ]];

        for it in &self.iterations {
            let status = match &it.status {
                IterationStatus::Completed => "ok".green(),
                IterationStatus::Failed(_) => "failed".red(),
                IterationStatus::Cancelled => "cancelled".yellow(),
            };
            let warnings = match it.warnings.len() {
                0 => "--".bright_black(),
                n => n.to_string().yellow(),
            };
            let log_name = it
                .stats_log
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            rows.push(row![
                TableCell::new(&it.sweep),
                TableCell::new(&it.label),
                TableCell::new(it.duration_secs()),
                TableCell::new(status),
                TableCell::new(warnings),
                TableCell::new(log_name)
            ]);
        }

        Table::builder()
            .rows(rows)
            .style(TableStyle::rounded())
            .build()
            .render()
    }
}
