//! Worker launcher for the accumulator protocol
//!
//! Runs one worker per input file, either as a child process re-executing
//! this program's hidden `worker` command or as a blocking task on the
//! tokio runtime, and waits for all of them before the total is final.

use crate::accumulator::{sum_file, write_result, Accumulator, LocalSum, ACCUMULATOR_BASE};
use crate::Result;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use shm_coord_shared_memory::{remove_stale, PlatformUtils, SegmentOptions, SessionNames};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, instrument, warn};

/// How workers are run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// One child process per file
    Process,
    /// One blocking task per file, sharing the launcher's handle
    Thread,
}

impl FromStr for WorkerMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "process" | "processes" => Ok(WorkerMode::Process),
            "thread" | "threads" => Ok(WorkerMode::Thread),
            other => Err(format!("unknown worker mode {:?} (expected process or thread)", other)),
        }
    }
}

impl fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerMode::Process => write!(f, "process"),
            WorkerMode::Thread => write!(f, "thread"),
        }
    }
}

/// Launcher configuration
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub mode: WorkerMode,
    /// Base of the segment names
    pub base: String,
    /// Session id; a fresh one is generated when absent
    pub session: Option<String>,
    /// Result artifact
    pub output: PathBuf,
    /// Per-worker deadline; slower workers are reported as timed out
    pub worker_deadline: Option<Duration>,
    /// Program re-executed for process workers; defaults to the current executable
    pub worker_program: Option<PathBuf>,
    pub segment: SegmentOptions,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            mode: WorkerMode::Process,
            base: ACCUMULATOR_BASE.to_string(),
            session: None,
            output: PathBuf::from("res.txt"),
            worker_deadline: None,
            worker_program: None,
            segment: SegmentOptions::default(),
        }
    }
}

/// Outcome of one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Local sum computed and folded into the shared total
    Folded { local: LocalSum },
    Failed { error: String },
    /// Missed its deadline; a process was killed, a thread keeps running
    TimedOut,
}

impl WorkerStatus {
    pub fn is_folded(&self) -> bool {
        matches!(self, WorkerStatus::Folded { .. })
    }
}

/// One worker's entry in a [`RunReport`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub index: usize,
    pub file: PathBuf,
    pub status: WorkerStatus,
}

/// Summary of a launcher run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub region: String,
    pub gate: String,
    pub mode: WorkerMode,
    pub total: f64,
    pub folds: u64,
    pub artifact: PathBuf,
    pub workers: Vec<WorkerReport>,
}

impl RunReport {
    /// Workers that did not fold
    pub fn failed(&self) -> impl Iterator<Item = &WorkerReport> {
        self.workers.iter().filter(|w| !w.status.is_folded())
    }

    pub fn all_folded(&self) -> bool {
        self.failed().next().is_none()
    }
}

/// Spawns workers over a fresh accumulator segment
pub struct Launcher {
    options: LaunchOptions,
}

impl Launcher {
    pub fn new(options: LaunchOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &LaunchOptions {
        &self.options
    }

    /// Run one worker per file and persist the total
    ///
    /// Worker failures are recorded in the report; only resource failures
    /// and a failed artifact write are errors. The segment is destroyed on
    /// every path once it exists.
    #[instrument(skip(self, files), fields(mode = %self.options.mode, files = files.len()))]
    pub async fn run(&self, files: &[PathBuf]) -> Result<RunReport> {
        let session = self
            .options
            .session
            .clone()
            .unwrap_or_else(PlatformUtils::generate_session_id);
        let names = SessionNames::new(&self.options.base, Some(&session))?;

        remove_stale(&names)?;
        let accumulator = Arc::new(Accumulator::create_or_attach(&names, self.options.segment.clone())?);
        info!("Accumulator {} ready, launching {} workers", names.region(), files.len());

        let workers = match self.options.mode {
            WorkerMode::Thread => self.run_threads(&accumulator, files).await,
            WorkerMode::Process => self.run_processes(&session, files).await,
        };

        // Reading the total and destroying both wait on the gate
        let options = self.options.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = finish(&options, &names, &accumulator, workers);
            if let Err(e) = accumulator.destroy() {
                warn!("Failed to destroy {}: {}", names.region(), e);
            }
            outcome
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, format!("finishing run panicked: {}", e)))?
    }

    async fn run_threads(&self, accumulator: &Arc<Accumulator>, files: &[PathBuf]) -> Vec<WorkerReport> {
        let deadline = self.options.worker_deadline;
        let tasks = files.iter().cloned().enumerate().map(|(index, file)| {
            let accumulator = Arc::clone(accumulator);
            async move {
                let path = file.clone();
                let handle = tokio::task::spawn_blocking(move || fold_file(&accumulator, &path));

                let status = match deadline {
                    Some(limit) => match tokio::time::timeout(limit, handle).await {
                        Ok(joined) => thread_status(joined),
                        Err(_) => {
                            warn!("Worker {} ({}) missed its {:?} deadline", index, file.display(), limit);
                            WorkerStatus::TimedOut
                        }
                    },
                    None => thread_status(handle.await),
                };
                WorkerReport { index, file, status }
            }
        });

        join_all(tasks).await
    }

    async fn run_processes(&self, session: &str, files: &[PathBuf]) -> Vec<WorkerReport> {
        let program = match self.worker_program() {
            Ok(program) => program,
            Err(e) => {
                error!("Cannot locate worker program: {}", e);
                return files
                    .iter()
                    .cloned()
                    .enumerate()
                    .map(|(index, file)| WorkerReport {
                        index,
                        file,
                        status: WorkerStatus::Failed { error: e.to_string() },
                    })
                    .collect();
            }
        };

        let tasks = files.iter().cloned().enumerate().map(|(index, file)| {
            let program = &program;
            async move {
                let status = match self.run_process(program, session, index, &file).await {
                    Ok(status) => status,
                    Err(e) => WorkerStatus::Failed { error: e.to_string() },
                };
                WorkerReport { index, file, status }
            }
        });

        join_all(tasks).await
    }

    async fn run_process(&self, program: &Path, session: &str, index: usize, file: &Path) -> Result<WorkerStatus> {
        let mut child = Command::new(program)
            .arg("worker")
            .arg("--base")
            .arg(&self.options.base)
            .arg("--session")
            .arg(session)
            .arg("--index")
            .arg(index.to_string())
            .arg(file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        debug!("Worker {} started as pid {:?}", index, child.id());

        let waited = match self.options.worker_deadline {
            Some(limit) => tokio::time::timeout(limit, collect_output(&mut child)).await.ok(),
            None => Some(collect_output(&mut child).await),
        };

        match waited {
            Some(output) => {
                let (stdout, status) = output?;
                Ok(process_status(&stdout, status))
            }
            None => {
                // Reap it now so a permit it held is seen as orphaned
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill worker {}: {}", index, e);
                }
                warn!("Worker {} ({}) missed its deadline; killed", index, file.display());
                Ok(WorkerStatus::TimedOut)
            }
        }
    }

    fn worker_program(&self) -> Result<PathBuf> {
        match &self.options.worker_program {
            Some(program) => Ok(program.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }
}

fn finish(
    options: &LaunchOptions,
    names: &SessionNames,
    accumulator: &Accumulator,
    workers: Vec<WorkerReport>,
) -> Result<RunReport> {
    let total = accumulator.total()?;
    let folds = accumulator.folds()?;
    write_result(&options.output, total)?;

    let report = RunReport {
        region: names.region().to_string(),
        gate: names.gate().to_string(),
        mode: options.mode,
        total,
        folds,
        artifact: options.output.clone(),
        workers,
    };

    for failed in report.failed() {
        warn!("Worker {} ({}) did not fold: {:?}", failed.index, failed.file.display(), failed.status);
    }
    info!("Total {:.2} from {} of {} workers", total, folds, report.workers.len());
    Ok(report)
}

async fn collect_output(child: &mut Child) -> std::io::Result<(Vec<u8>, ExitStatus)> {
    let mut stdout = Vec::new();
    if let Some(mut pipe) = child.stdout.take() {
        pipe.read_to_end(&mut stdout).await?;
    }
    let status = child.wait().await?;
    Ok((stdout, status))
}

/// Compute a file's local sum and fold it into the accumulator
pub fn fold_file(accumulator: &Accumulator, file: &Path) -> Result<LocalSum> {
    let local = sum_file(file)?;
    let total = accumulator.fold(local.sum)?;
    debug!("Folded {} from {} (total now {})", local.sum, file.display(), total);
    Ok(local)
}

/// Body of a process worker: attach by name, fold once, detach
pub fn run_worker(names: &SessionNames, file: &Path, options: SegmentOptions) -> WorkerStatus {
    let folded = sum_file(file).and_then(|local| {
        let accumulator = Accumulator::attach(names, options)?;
        accumulator.fold(local.sum)?;
        accumulator.detach()?;
        Ok(local)
    });

    match folded {
        Ok(local) => WorkerStatus::Folded { local },
        Err(e) => {
            error!("Worker for {} failed: {}", file.display(), e);
            WorkerStatus::Failed { error: e.to_string() }
        }
    }
}

fn thread_status(joined: std::result::Result<Result<LocalSum>, tokio::task::JoinError>) -> WorkerStatus {
    match joined {
        Ok(Ok(local)) => WorkerStatus::Folded { local },
        Ok(Err(e)) => WorkerStatus::Failed { error: e.to_string() },
        Err(e) => WorkerStatus::Failed {
            error: format!("worker panicked: {}", e),
        },
    }
}

/// Interpret a process worker's exit status and the report on its stdout
fn process_status(stdout: &[u8], exit: ExitStatus) -> WorkerStatus {
    let report = std::str::from_utf8(stdout)
        .ok()
        .and_then(|text| text.lines().rev().find(|line| !line.trim().is_empty()))
        .map(serde_json::from_str::<WorkerStatus>);

    match report {
        Some(Ok(status)) if exit.success() || !status.is_folded() => status,
        Some(Err(e)) if exit.success() => WorkerStatus::Failed {
            error: format!("unreadable worker report: {}", e),
        },
        None if exit.success() => WorkerStatus::Failed {
            error: "worker exited without a report".to_string(),
        },
        _ => WorkerStatus::Failed {
            error: format!("worker exited with {}", exit),
        },
    }
}
