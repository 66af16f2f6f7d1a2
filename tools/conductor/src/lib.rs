pub mod composer;
pub mod composition;
pub mod config;
pub mod errors;
pub mod identity;
pub mod logging;
pub mod matcher;
pub mod performance;
pub mod performer;
pub mod recorder;
pub mod registry;
pub mod report;
pub mod runtime;
pub mod store;
pub mod transport;
pub mod types;
pub mod variables;

use clap::{error::ErrorKind, Parser, Subcommand};
use composition::Composition;
use config::{anchor_paths, load_config, AppConfig, CliOverrides};
use errors::ConductorError;
use logging::{append_run_log, init_run_logger, JsonlLogger};
use performance::Performance;
use performer::{CancelToken, Performer};
use runtime::{ConnectionProvider, Runtime};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use store::{ConductorStore, Repository};
use transport::TcpConnectionProvider;

pub const EXIT_PERFORMANCE_FAILED: i32 = 2;

#[derive(Debug, Clone, Parser)]
#[command(name = "conductor")]
#[command(about = "Replay recorded protocol compositions against live peers")]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// List stored compositions.
    List,
    /// Import a composition, or an array of them, from a JSON file.
    Import { file: PathBuf },
    /// Write a stored composition as JSON.
    Export {
        id: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Remove a composition and its performance history.
    Delete { id: String },
    /// Replay a composition and record the performance.
    Perform {
        id: String,
        #[arg(long, default_value_t = false)]
        json: bool,
        /// Stop at the first failed assertion.
        #[arg(long, default_value_t = false)]
        fail_fast: bool,
    },
    /// Show past performances, newest first.
    History { composition_id: Option<String> },
}

pub fn run() -> Result<i32, ConductorError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| ConductorError::Io(e.to_string()))?;
    let runtime = Runtime::production();
    run_with_runtime(&args, &cwd, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    cwd: &Path,
    runtime: &Runtime,
) -> Result<i32, ConductorError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(ConductorError::Cli(error.to_string())),
        },
    };

    let overrides = CliOverrides {
        config_path: cli.config.as_ref().map(|path| absolutize(cwd, path)),
        store_path: cli.store.clone(),
        fail_fast: matches!(cli.command, Command::Perform { fail_fast: true, .. }),
    };
    let mut cfg = load_config(&overrides)?;
    anchor_paths(&mut cfg, cwd);

    init_run_logger(JsonlLogger {
        path: cfg.logging.path.clone(),
        max_payload_bytes: cfg.logging.max_payload_bytes,
        budget_bytes: cfg.logging.budget_bytes,
    });
    append_run_log(
        "info",
        "cli.command.started",
        json!({
            "command": format!("{:?}", cli.command),
            "store": cfg.store.path.display().to_string(),
        }),
    );

    let store = ConductorStore::open(&cfg.store.path)?;
    match &cli.command {
        Command::List => list(&store, runtime),
        Command::Import { file } => import(&store, runtime, &absolutize(cwd, file)),
        Command::Export { id, out } => {
            export(&store, runtime, id, out.as_ref().map(|p| absolutize(cwd, p)))
        }
        Command::Delete { id } => {
            if !Repository::<Composition>::delete(&store, id)? {
                return Err(not_found(id));
            }
            runtime.terminal.write_line(&format!("deleted {id}"))?;
            Ok(0)
        }
        Command::Perform { id, json, .. } => perform(&store, runtime, &cfg, id, *json),
        Command::History { composition_id } => history(&store, runtime, composition_id.as_deref()),
    }
}

fn list(store: &ConductorStore, runtime: &Runtime) -> Result<i32, ConductorError> {
    let compositions: Vec<Composition> = store.load_all()?;
    if compositions.is_empty() {
        runtime.terminal.write_line("no compositions")?;
    }
    for composition in compositions {
        runtime.terminal.write_line(&format!(
            "{}  v{}  {} steps  {}",
            composition.id,
            composition.version,
            composition.steps.len(),
            composition.name
        ))?;
    }
    Ok(0)
}

fn import(store: &ConductorStore, runtime: &Runtime, file: &Path) -> Result<i32, ConductorError> {
    let text = std::fs::read_to_string(file)
        .map_err(|e| ConductorError::Io(format!("{}: {e}", file.display())))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| ConductorError::InvalidComposition(format!("{}: {e}", file.display())))?;
    let compositions: Vec<Composition> = if value.is_array() {
        serde_json::from_value(value)
    } else {
        serde_json::from_value(value).map(|single| vec![single])
    }
    .map_err(|e| ConductorError::InvalidComposition(format!("{}: {e}", file.display())))?;

    for composition in &compositions {
        composition.validate()?;
    }
    for composition in &compositions {
        store.save(composition)?;
        runtime.terminal.write_line(&format!(
            "imported {}  {}",
            composition.id, composition.name
        ))?;
    }
    Ok(0)
}

fn export(
    store: &ConductorStore,
    runtime: &Runtime,
    id: &str,
    out: Option<PathBuf>,
) -> Result<i32, ConductorError> {
    let composition = store.load_composition(id)?.ok_or_else(|| not_found(id))?;
    let document = serde_json::to_string_pretty(&composition)
        .map_err(|e| ConductorError::Io(e.to_string()))?;
    match out {
        Some(path) => {
            std::fs::write(&path, format!("{document}\n"))
                .map_err(|e| ConductorError::Io(format!("{}: {e}", path.display())))?;
            runtime
                .terminal
                .write_line(&format!("exported {id} to {}", path.display()))?;
        }
        None => runtime.terminal.write_line(&document)?,
    }
    Ok(0)
}

fn perform(
    store: &ConductorStore,
    runtime: &Runtime,
    cfg: &AppConfig,
    id: &str,
    as_json: bool,
) -> Result<i32, ConductorError> {
    let composition = store.load_composition(id)?.ok_or_else(|| not_found(id))?;
    let provider: Arc<dyn ConnectionProvider> = match &runtime.provider {
        Some(provider) => Arc::clone(provider),
        None => Arc::new(TcpConnectionProvider::new(
            cfg.transport.endpoints.clone(),
            cfg.transport.connect_timeout_ms,
        )),
    };
    let performer = Performer::new(
        provider,
        Arc::clone(&runtime.clock),
        cfg.performer.clone(),
    );
    let performance = performer.run(&composition, &CancelToken::new())?;
    store.save(&performance)?;

    if as_json {
        runtime.terminal.write_line(&report::render_json(&performance)?)?;
    } else {
        for line in report::render_text(&performance, Some(&composition)) {
            runtime.terminal.write_line(&line)?;
        }
    }
    Ok(if performance.passed() {
        0
    } else {
        EXIT_PERFORMANCE_FAILED
    })
}

fn history(
    store: &ConductorStore,
    runtime: &Runtime,
    composition_id: Option<&str>,
) -> Result<i32, ConductorError> {
    let performances: Vec<Performance> = match composition_id {
        Some(id) => store.performances_for(id)?,
        None => store.load_all()?,
    };
    if performances.is_empty() {
        runtime.terminal.write_line("no performances")?;
    }
    for performance in performances {
        runtime.terminal.write_line(&format!(
            "{}  {}  {}  {}/{} passed  {}ms",
            performance.id,
            performance.composition_id,
            performance.status.as_str(),
            performance.summary.passed,
            performance.summary.total,
            performance.duration_ms
        ))?;
    }
    Ok(0)
}

fn not_found(id: &str) -> ConductorError {
    ConductorError::Cli(format!("composition {id} not found"))
}

fn absolutize(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}
