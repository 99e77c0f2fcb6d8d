//! `refiner` command line.
//!
//! Sessions (`session.json`) hold the ledger and interpreter context of one
//! task, so `run` and `step` can be resumed and `toc`/`diff`/`validate` can
//! inspect them offline.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;

use refiner::core::toc::{TocOrdering, render_toc, synthesize};
use refiner::exit_codes;
use refiner::io::config::{RefinerConfig, load_config, write_config};
use refiner::io::model::{CommandModel, LanguageModel, ScriptedModel};
use refiner::io::sandbox::sandbox_from_config;
use refiner::io::session_store::{
    SessionFile, load_session, schema_errors, session_errors, write_session,
};
use refiner::{StepOutcome, StopReason, Task, TaskError, create_task, logging, run, step};

#[derive(Parser)]
#[command(
    name = "refiner",
    version,
    about = "Iterative document refinement driven by a language model"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `refiner.toml`.
    Init {
        #[arg(long, default_value = "refiner.toml")]
        config: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Drive a task until it completes or its iteration budget runs out.
    Run {
        /// Request text for a new task.
        #[arg(long, conflicts_with_all = ["request_file", "resume"])]
        request: Option<String>,
        /// Read the request for a new task from a file.
        #[arg(long, conflicts_with = "resume")]
        request_file: Option<PathBuf>,
        /// Continue the task stored in the session file.
        #[arg(long)]
        resume: bool,
        /// Override `max_iterations` from the config.
        #[arg(long)]
        max_iterations: Option<u32>,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Run one iteration of a persisted task.
    Step {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Print the table of contents of a persisted task.
    Toc {
        #[arg(long, default_value = "session.json")]
        session: PathBuf,
        #[arg(long, value_enum)]
        ordering: Option<OrderingArg>,
        /// Show the state after this iteration instead of the latest one.
        #[arg(long)]
        iteration: Option<u32>,
    },
    /// List sections added, modified and removed between two iterations.
    Diff {
        #[arg(long, default_value = "session.json")]
        session: PathBuf,
        from: u32,
        to: u32,
    },
    /// Check a session file against the schema and document invariants.
    Validate {
        #[arg(long, default_value = "session.json")]
        session: PathBuf,
    },
}

#[derive(Args)]
struct CommonArgs {
    #[arg(long, default_value = "refiner.toml")]
    config: PathBuf,
    #[arg(long, default_value = "session.json")]
    session: PathBuf,
    /// Replay model replies from a JSON array instead of calling `[model].command`.
    #[arg(long)]
    responses: Option<PathBuf>,
    /// Write per-iteration prompts, replies and states here.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum OrderingArg {
    Creation,
    Alphabetical,
}

impl From<OrderingArg> for TocOrdering {
    fn from(arg: OrderingArg) -> Self {
        match arg {
            OrderingArg::Creation => TocOrdering::CreationOrder,
            OrderingArg::Alphabetical => TocOrdering::Alphabetical,
        }
    }
}

fn main() {
    logging::init();
    match dispatch(Cli::parse()) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { config, force } => cmd_init(&config, force),
        Command::Run {
            request,
            request_file,
            resume,
            max_iterations,
            common,
        } => cmd_run(request, request_file, resume, max_iterations, &common),
        Command::Step { common } => cmd_step(&common),
        Command::Toc {
            session,
            ordering,
            iteration,
        } => cmd_toc(&session, ordering, iteration),
        Command::Diff { session, from, to } => cmd_diff(&session, from, to),
        Command::Validate { session } => cmd_validate(&session),
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &RefinerConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_run(
    request: Option<String>,
    request_file: Option<PathBuf>,
    resume: bool,
    max_iterations: Option<u32>,
    common: &CommonArgs,
) -> Result<i32> {
    let config = load_config(&common.config)?;
    let max_iterations = max_iterations.unwrap_or(config.max_iterations);
    let mut task = if resume {
        let session = load_session(&common.session)?;
        Task::from_session(session, config)?
    } else {
        let request = match (request, request_file) {
            (Some(text), _) => text,
            (None, Some(path)) => fs::read_to_string(&path)
                .with_context(|| format!("read request {}", path.display()))?,
            (None, None) => bail!("pass --request, --request-file or --resume"),
        };
        create_task(&request, config)?
    };
    if let Some(dir) = &common.log_dir {
        task = task.with_log_dir(dir);
    }

    let model = build_model(task.config(), common.responses.as_deref())?;
    let sandbox = sandbox_from_config(&task.config().sandbox);
    let result = run(
        &mut task,
        model.as_ref(),
        sandbox.as_ref(),
        max_iterations,
        print_step,
    );
    // The task only ever holds committed states, so it is safe to persist on failure too.
    write_session(&common.session, &task.to_session())?;

    match result {
        Ok(outcome) => match outcome.stop {
            StopReason::Completed { final_answer } => {
                println!("{}", final_answer);
                Ok(exit_codes::OK)
            }
            StopReason::MaxIterations => {
                eprintln!(
                    "stopped after {} iteration(s) without a final answer",
                    outcome.final_state.iteration
                );
                Ok(exit_codes::INCOMPLETE)
            }
            StopReason::Cancelled => {
                eprintln!("cancelled");
                Ok(exit_codes::INCOMPLETE)
            }
        },
        Err(err) => task_failure(err),
    }
}

fn cmd_step(common: &CommonArgs) -> Result<i32> {
    let config = load_config(&common.config)?;
    let session = load_session(&common.session)?;
    let mut task = Task::from_session(session, config)?;
    if let Some(dir) = &common.log_dir {
        task = task.with_log_dir(dir);
    }
    let model = build_model(task.config(), common.responses.as_deref())?;
    let sandbox = sandbox_from_config(&task.config().sandbox);

    let result = step(&mut task, model.as_ref(), sandbox.as_ref());
    write_session(&common.session, &task.to_session())?;
    match result {
        Ok(outcome) => {
            print_step(&outcome);
            if let Some(answer) = &outcome.completion {
                println!("{}", answer);
            }
            Ok(exit_codes::OK)
        }
        Err(err) => task_failure(err),
    }
}

fn cmd_toc(session: &Path, ordering: Option<OrderingArg>, iteration: Option<u32>) -> Result<i32> {
    let session = load_session(session)?;
    let ledger = &session.ledger;
    let state = match iteration {
        Some(n) => ledger
            .state_at(n)
            .ok_or_else(|| anyhow!("no state recorded for iteration {n}"))?,
        None => ledger.last_state(),
    };
    let ordering = ordering.map(TocOrdering::from).unwrap_or_default();
    println!("{}", render_toc(&synthesize(state, ordering)));
    Ok(exit_codes::OK)
}

fn cmd_diff(session: &Path, from: u32, to: u32) -> Result<i32> {
    let session = load_session(session)?;
    let diff = session
        .ledger
        .diff(from, to)
        .ok_or_else(|| anyhow!("iterations {from} and {to} are not both recorded"))?;
    for id in &diff.added {
        println!("+ {id}");
    }
    for id in &diff.modified {
        println!("~ {id}");
    }
    for id in &diff.removed {
        println!("- {id}");
    }
    Ok(exit_codes::OK)
}

fn cmd_validate(path: &Path) -> Result<i32> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    let mut errors = schema_errors(&value);
    if errors.is_empty() {
        let session: SessionFile = serde_json::from_value(value)
            .with_context(|| format!("deserialize {}", path.display()))?;
        errors = session_errors(&session);
    }
    if errors.is_empty() {
        println!("ok");
        return Ok(exit_codes::OK);
    }
    eprintln!("invalid session:\n- {}", errors.join("\n- "));
    Ok(exit_codes::INVALID)
}

fn build_model(config: &RefinerConfig, responses: Option<&Path>) -> Result<Box<dyn LanguageModel>> {
    if let Some(path) = responses {
        return Ok(Box::new(ScriptedModel::from_file(path)?));
    }
    if config.model.command.is_empty() {
        bail!("no model configured: set [model].command or pass --responses");
    }
    Ok(Box::new(CommandModel::new(
        config.model.command.clone(),
        config.model.output_limit_bytes,
    )))
}

fn print_step(outcome: &StepOutcome) {
    let entry = &outcome.entry;
    eprintln!(
        "iteration {} [{}]: +{} ~{} -{}",
        entry.iteration,
        entry.recovery.tier.label(),
        outcome.changes.added.len(),
        outcome.changes.modified.len(),
        outcome.changes.removed.len()
    );
}

fn task_failure(err: TaskError) -> Result<i32> {
    eprintln!("{}", err);
    if err.is_fatal_invariant() {
        Ok(exit_codes::FATAL)
    } else {
        Ok(exit_codes::INVALID)
    }
}
