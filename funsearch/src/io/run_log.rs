//! Run artifacts under `<out>/<run id>/`.
//!
//! A run directory holds `config.toml` (effective config), `progress.jsonl`
//! (one [`ProgressRecord`] per iteration), and on exit `best.py` and
//! `report.json`.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Local};
use serde::Serialize;

use crate::core::database::DatabaseStats;
use crate::core::types::{Candidate, EvalTally, ProgressRecord};
use crate::io::config::{SearchConfig, write_config};

/// Default output root for `funsearch run`.
pub const DEFAULT_OUT_DIR: &str = "runs";

const MAX_RUN_ID_ATTEMPTS: u32 = 1_000;

/// Run id derived from the start time, e.g. `run-20260105_142233`.
pub fn run_id(started: &DateTime<Local>) -> String {
    started.format("run-%Y%m%d_%H%M%S").to_string()
}

#[derive(Debug, Clone)]
pub struct RunPaths {
    pub run_id: String,
    pub dir: PathBuf,
    pub config_path: PathBuf,
    pub progress_path: PathBuf,
    pub best_path: PathBuf,
    pub report_path: PathBuf,
}

impl RunPaths {
    pub fn new(out_dir: &Path, run_id: &str) -> Self {
        let dir = out_dir.join(run_id);
        Self {
            run_id: run_id.to_string(),
            config_path: dir.join("config.toml"),
            progress_path: dir.join("progress.jsonl"),
            best_path: dir.join("best.py"),
            report_path: dir.join("report.json"),
            dir,
        }
    }

    /// Claim a fresh run directory under `out_dir`.
    ///
    /// Uses `base_id`, or `base_id-2`, `base_id-3`, ... when runs started in
    /// the same second already took it. An existing directory is never reused.
    pub fn create_unique(out_dir: &Path, base_id: &str, config: &SearchConfig) -> Result<Self> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("create output dir {}", out_dir.display()))?;
        for attempt in 1..=MAX_RUN_ID_ATTEMPTS {
            let run_id = if attempt == 1 {
                base_id.to_string()
            } else {
                format!("{base_id}-{attempt}")
            };
            let paths = Self::new(out_dir, &run_id);
            match fs::create_dir(&paths.dir) {
                Ok(()) => {
                    write_config(&paths.config_path, config)?;
                    return Ok(paths);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("create run dir {}", paths.dir.display()));
                }
            }
        }
        Err(anyhow!(
            "no free run directory for {base_id} under {}",
            out_dir.display()
        ))
    }
}

/// Append-only JSON lines writer for progress records.
pub struct ProgressLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl ProgressLog {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn append(&mut self, record: &ProgressRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record).context("serialize progress record")?;
        self.writer
            .write_all(b"\n")
            .and_then(|()| self.writer.flush())
            .with_context(|| format!("append {}", self.path.display()))
    }
}

/// Final summary written to `report.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport<'a> {
    pub run_id: &'a str,
    pub started_at: String,
    pub ended_at: String,
    pub phase: &'a str,
    pub stop_reason: Option<String>,
    pub iterations: u32,
    pub evaluations: EvalTally,
    pub accepted: u64,
    pub migrations: u32,
    pub best: Option<&'a Candidate>,
    pub database: &'a DatabaseStats,
}

pub fn write_report(paths: &RunPaths, report: &RunReport<'_>) -> Result<()> {
    write_json(&paths.report_path, report)?;
    if let Some(best) = report.best {
        write_text(&paths.best_path, best.source())?;
    }
    Ok(())
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::candidate_with_source;
    use chrono::TimeZone;

    fn record(iteration: u32) -> ProgressRecord {
        ProgressRecord {
            iteration,
            elapsed_seconds: 0.5,
            island_id: 1,
            valid_count: 1,
            invalid_syntax_count: 0,
            runtime_failure_count: 1,
            timeout_count: 0,
            accepted_count: 1,
            best_fitness: Some(12.5),
            db_size: 4,
            avg_fitness: Some(3.0),
            migrated: false,
        }
    }

    #[test]
    fn run_paths_are_stable() {
        let paths = RunPaths::new(Path::new("runs"), "run-1");
        assert!(paths.dir.ends_with("runs/run-1"));
        assert!(paths.progress_path.ends_with("progress.jsonl"));
        assert!(paths.best_path.ends_with("best.py"));
        assert!(paths.report_path.ends_with("report.json"));
    }

    #[test]
    fn run_id_uses_start_time() {
        let started = Local
            .with_ymd_and_hms(2026, 1, 5, 14, 22, 33)
            .single()
            .expect("local time");
        assert_eq!(run_id(&started), "run-20260105_142233");
    }

    #[test]
    fn runs_in_the_same_second_get_distinct_dirs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = SearchConfig::default();

        let first = RunPaths::create_unique(temp.path(), "run-1", &config).expect("first");
        let second = RunPaths::create_unique(temp.path(), "run-1", &config).expect("second");
        let third = RunPaths::create_unique(temp.path(), "run-1", &config).expect("third");

        assert_eq!(first.run_id, "run-1");
        assert_eq!(second.run_id, "run-1-2");
        assert_eq!(third.run_id, "run-1-3");
        assert_ne!(first.progress_path, second.progress_path);
        assert!(second.config_path.is_file());
    }

    #[test]
    fn progress_log_appends_json_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("progress.jsonl");
        let mut log = ProgressLog::open(&path).expect("open");
        log.append(&record(1)).expect("append");
        log.append(&record(2)).expect("append");

        let contents = fs::read_to_string(&path).expect("read");
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["iteration"], 2);
        assert_eq!(lines[0]["best_fitness"], 12.5);
    }

    #[test]
    fn report_writes_best_program() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RunPaths::create_unique(temp.path(), "run-x", &SearchConfig::default())
            .expect("create");
        let best = candidate_with_source("def mice_behavior(s, m, p):\n    return (0, 1)\n", 5.0, 3, 0);
        let stats = DatabaseStats {
            size: 1,
            generation: 4,
            rejected: 0,
            best_fitness: Some(5.0),
            avg_fitness: Some(5.0),
            worst_fitness: Some(5.0),
            islands: Vec::new(),
        };
        write_report(
            &paths,
            &RunReport {
                run_id: "run-x",
                started_at: "start".to_string(),
                ended_at: "end".to_string(),
                phase: "completed",
                stop_reason: Some("max_iterations".to_string()),
                iterations: 3,
                evaluations: EvalTally::default(),
                accepted: 1,
                migrations: 0,
                best: Some(&best),
                database: &stats,
            },
        )
        .expect("report");

        assert_eq!(
            fs::read_to_string(&paths.best_path).expect("best"),
            best.source()
        );
        let report: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.report_path).expect("report"))
                .expect("json");
        assert_eq!(report["best"]["generation"], 3);
        assert_eq!(report["phase"], "completed");
        assert!(paths.config_path.is_file());
    }
}
