use anyhow::{Context, Result};
use clap::Parser;
use shm_coord::{load_config, log_level, menu, Cli, Command, Config, Strategy};
use shm_coord_core::launcher::{run_worker, LaunchOptions, Launcher, RunReport, WorkerStatus};
use shm_coord_core::symmetry::{self, Matrix, MatrixFile, Pattern};
use shm_coord_core::SharedStack;
use shm_coord_shared_memory::{remove_stale, SessionNames};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // --help and --version are not failures
            return if e.use_stderr() { ExitCode::FAILURE } else { ExitCode::SUCCESS };
        }
    };

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(&log_level(&cli, &config));

    match run(cli, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Log to stderr; stdout carries worker reports and menu output
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli, config: Config) -> Result<ExitCode> {
    match cli.command {
        Command::Sum {
            mode,
            output,
            session,
            deadline_secs,
            json,
            files,
        } => {
            let options = LaunchOptions {
                mode: mode.unwrap_or(config.mode),
                base: config.sum_base.clone(),
                session,
                output: output.unwrap_or_else(|| config.output.clone()),
                worker_deadline: deadline_secs.or(config.worker_deadline_secs).map(Duration::from_secs),
                worker_program: None,
                segment: config.segment_options(),
            };
            handle_sum(options, &files, json).await
        }

        Command::Worker {
            base,
            session,
            index,
            file,
        } => handle_worker(&config, base.as_deref(), &session, index, &file),

        Command::Stack { session } => {
            handle_stack(&config, session.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Symmetry {
            file,
            threads,
            strategy,
            json,
        } => {
            handle_symmetry(&config, file.as_deref(), threads, strategy, json)?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Symmetrize { file, threads } => {
            handle_symmetrize(&config, file.as_deref(), threads)?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Cleanup { base, session } => {
            let names = SessionNames::new(&base, session.as_deref())?;
            let removed = remove_stale(&names).with_context(|| format!("Cannot clean up {}", names.region()))?;
            println!("Removed {} object(s) for {}", removed, names.region());
            Ok(ExitCode::SUCCESS)
        }

        Command::Init { path } => {
            Config::default().save_to_file(&path)?;
            println!("Default configuration written to {:?}", path);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn handle_sum(options: LaunchOptions, files: &[PathBuf], json: bool) -> Result<ExitCode> {
    let launcher = Launcher::new(options);
    let report = launcher.run(files).await.context("Sum run failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_run_report(&report);
    }

    if report.all_folded() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn print_run_report(report: &RunReport) {
    for worker in &report.workers {
        match &worker.status {
            WorkerStatus::Folded { local } => println!(
                "[{}] {}: {} numbers, sum {}",
                worker.index,
                worker.file.display(),
                local.count,
                local.sum
            ),
            WorkerStatus::Failed { error } => {
                println!("[{}] {}: failed: {}", worker.index, worker.file.display(), error)
            }
            WorkerStatus::TimedOut => println!("[{}] {}: timed out", worker.index, worker.file.display()),
        }
    }
    println!("Total: {:.2} (written to {})", report.total, report.artifact.display());
}

fn handle_worker(config: &Config, base: Option<&str>, session: &str, index: usize, file: &Path) -> Result<ExitCode> {
    let names = SessionNames::new(base.unwrap_or(config.sum_base.as_str()), Some(session))?;
    info!("Worker {} folding {} into {}", index, file.display(), names.region());

    let status = run_worker(&names, file, config.segment_options());
    println!("{}", serde_json::to_string(&status)?);

    if status.is_folded() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn handle_stack(config: &Config, session: Option<&str>) -> Result<()> {
    let names = SessionNames::new(&config.stack_base, session)?;
    let stack = Arc::new(
        SharedStack::open(&names, config.segment_options())
            .with_context(|| format!("Cannot open shared stack {}", names.region()))?,
    );
    println!("Shared stack {} ({} participants)", names.region(), stack.participants());

    let on_interrupt = Arc::clone(&stack);
    ctrlc::set_handler(move || {
        if let Err(e) = on_interrupt.shutdown() {
            eprintln!("Failed to leave shared stack: {}", e);
        }
        std::process::exit(0);
    })
    .context("Cannot install Ctrl-C handler")?;

    let stdin = std::io::stdin();
    let outcome = menu::run_menu(&stack, stdin.lock(), std::io::stdout());
    stack.shutdown()?;
    outcome
}

fn load_matrix(file: Option<&Path>, fallback: Pattern) -> Result<MatrixFile> {
    match file {
        Some(path) => Matrix::from_file(path).with_context(|| format!("Cannot load matrix {}", path.display())),
        None => {
            info!("No matrix file given, using a generated 4x4 matrix");
            Ok(MatrixFile {
                matrix: Matrix::generate(4, fallback),
                workers: 4,
            })
        }
    }
}

fn handle_symmetry(
    config: &Config,
    file: Option<&Path>,
    threads: Option<usize>,
    strategy: Strategy,
    json: bool,
) -> Result<()> {
    let MatrixFile { matrix, workers } = load_matrix(file, Pattern::Symmetric)?;
    let threads = threads.unwrap_or(if workers > 0 { workers } else { config.effective_threads() });

    let started = Instant::now();
    let report = match strategy {
        Strategy::Threads => symmetry::check_symmetric_strided(&matrix, threads),
        Strategy::Rayon => symmetry::check_symmetric_parallel(&matrix, &symmetry::build_pool(threads)?),
    };
    let elapsed = started.elapsed();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Matrix {}x{}:\n{}", matrix.dim(), matrix.dim(), matrix);
    println!("Workers: {}", report.workers);
    if let Some(mismatch) = &report.mismatch {
        println!("Worker {} found {}", mismatch.worker, mismatch);
    }
    if report.symmetric {
        println!("Result: matrix is symmetric");
    } else {
        println!("Result: matrix is NOT symmetric");
    }
    println!("Time: {:.6} s", elapsed.as_secs_f64());
    Ok(())
}

fn handle_symmetrize(config: &Config, file: Option<&Path>, threads: Option<usize>) -> Result<()> {
    let MatrixFile { matrix, workers } = load_matrix(file, Pattern::Linear)?;
    let threads = threads.unwrap_or(if workers > 0 { workers } else { config.effective_threads() });
    let pool = symmetry::build_pool(threads)?;

    println!("Original:\n{}", matrix);
    println!("Symmetry error: {:.6}", symmetry::symmetry_error(&matrix, &pool));

    let symmetric = symmetry::symmetrize(&matrix, &pool);
    println!("Symmetrized:\n{}", symmetric);
    println!("Symmetry error: {:.6}", symmetry::symmetry_error(&symmetric, &pool));
    Ok(())
}
