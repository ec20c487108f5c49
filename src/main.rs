use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;

use taskaudit_lib::config::{self, AuditorConfig};
use taskaudit_lib::pipeline::inference::{LlmClient, OllamaClient};
use taskaudit_lib::pipeline::{Auditor, CheckpointStore, RunResult, SqliteCheckpointStore};

#[derive(Parser, Debug)]
#[command(name = "taskaudit", version, about = "Document-grounded task auditor")]
struct Cli {
    #[arg(long, global = true, help = "Output machine-readable JSON")]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Audit the documents under a directory against a list of tasks.
    Run {
        #[arg(long, help = "Directory holding the documents to audit")]
        data: PathBuf,
        #[arg(long = "task", help = "Audit task (repeatable)")]
        tasks: Vec<String>,
        #[arg(long, help = "File with one task per line")]
        tasks_file: Option<PathBuf>,
        #[arg(long, help = "Run identifier (defaults to a new UUID)")]
        run_id: Option<String>,
    },
    /// Continue a run from its latest checkpoint.
    Resume { run_id: String },
    Checkpoints {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
    /// List models available on the inference backend (`*` marks configured ones).
    Models,
}

#[derive(Subcommand, Debug)]
enum CheckpointCommands {
    List,
    Show { run_id: String },
}

#[derive(Serialize)]
struct JsonOut<T: Serialize> {
    ok: bool,
    data: T,
}

fn main() -> anyhow::Result<ExitCode> {
    taskaudit_lib::init_tracing();
    let cli = Cli::parse();
    let config = AuditorConfig::from_env();
    tracing::info!("{} v{}", config::APP_NAME, config::APP_VERSION);

    match cli.command {
        Commands::Run {
            data,
            mut tasks,
            tasks_file,
            run_id,
        } => {
            if let Some(path) = tasks_file {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading tasks file {}", path.display()))?;
                tasks.extend(raw.lines().map(str::to_string));
            }
            let run_id = run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let auditor = Auditor::from_config(&config)?;
            let result = auditor.invoke(&run_id, &data, &tasks);
            print_result(cli.json, &result)
        }
        Commands::Resume { run_id } => {
            let auditor = Auditor::from_config(&config)?;
            let result = auditor.resume(&run_id);
            print_result(cli.json, &result)
        }
        Commands::Checkpoints { command } => {
            let store = open_store(&config)?;
            match command {
                CheckpointCommands::List => {
                    let runs = store.list_runs()?;
                    if cli.json {
                        print_json(&runs)?;
                    } else {
                        for r in runs {
                            println!(
                                "{}\t{}\t{}\t{}",
                                r.run_id,
                                r.next_stage,
                                r.checkpoints,
                                r.updated_at.to_rfc3339()
                            );
                        }
                    }
                }
                CheckpointCommands::Show { run_id } => {
                    let history = store.history(&run_id)?;
                    if history.is_empty() {
                        anyhow::bail!("no checkpoints for run {run_id}");
                    }
                    if cli.json {
                        print_json(&history)?;
                    } else {
                        for c in &history {
                            println!(
                                "{:>3}  {} -> {}  docs={} tasks={} results={} iterations={}  {}",
                                c.seq,
                                c.completed_stage,
                                c.next_stage,
                                c.state.documents.len(),
                                c.state.tasks_parsed.len(),
                                c.state.results.len(),
                                c.state.iteration_count,
                                c.saved_at.to_rfc3339()
                            );
                        }
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Models => {
            let client = OllamaClient::from_config(&config)?;
            let models = client.list_models()?;
            if cli.json {
                print_json(&models)?;
            } else {
                for m in models {
                    let marker = if m.starts_with(&config.model) || m.starts_with(&config.vision_model) {
                        "*"
                    } else {
                        " "
                    };
                    println!("{marker} {m}");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn open_store(config: &AuditorConfig) -> anyhow::Result<SqliteCheckpointStore> {
    let path = config
        .checkpoint_db
        .as_deref()
        .context("checkpointing is disabled (TASKAUDIT_CHECKPOINT_DB=off)")?;
    SqliteCheckpointStore::open(path)
        .with_context(|| format!("opening checkpoint database {}", path.display()))
}

fn print_json<T: Serialize>(data: T) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(&JsonOut { ok: true, data })?
    );
    Ok(())
}

fn print_result(json: bool, result: &RunResult) -> anyhow::Result<ExitCode> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        match result {
            RunResult::Success(s) => {
                print!("{}", s.report);
                if !s.report.ends_with('\n') {
                    println!();
                }
                println!();
                for (i, d) in s.execution_details.iter().enumerate() {
                    println!("{}. [{}] {}", i + 1, d.status, d.task);
                }
                println!(
                    "run {}: {} documents, {} tasks, {:.2}s",
                    s.run_id, s.documents_processed, s.tasks_count, s.execution_time
                );
            }
            RunResult::Failure(f) => {
                eprintln!("run {} failed after {:.2}s: {}", f.run_id, f.execution_time, f.error);
            }
        }
    }

    Ok(if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
