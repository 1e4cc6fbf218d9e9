//! CLI definition and dispatch.
//!
//! Results are printed to stdout as JSON; diagnostics go through `tracing`
//! to stderr. The exit code is derived from [`QuantscriptError`].

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::adapters::csv_adapter::CsvAdapter;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::domain::capability::CapabilityRegistry;
use crate::domain::error::QuantscriptError;
use crate::domain::evaluator::Evaluator;
use crate::domain::history::HistoryProvider;
use crate::domain::operations::{CalculationService, ExecuteRequest, ValidationReport};
use crate::domain::row::{ListQuery, StockInfo, StockRow};
use crate::domain::sandbox_config::SandboxConfig;
use crate::domain::script::ScriptUpdate;
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::DataPort;
use crate::ports::script_port::ScriptPort;

const DEFAULT_BACKEND: &str = if cfg!(feature = "sqlite") {
    "sqlite"
} else {
    "postgres"
};

#[derive(Parser, Debug)]
#[command(
    name = "quantscript",
    version,
    about = "Sandboxed per-row script calculations over daily market data"
)]
pub struct Cli {
    /// INI configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Where a script's source text comes from.
#[derive(Args, Debug, Default)]
pub struct SourceArgs {
    /// Read the script from a file
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Inline script text
    #[arg(short = 'e', long = "script", conflicts_with = "file")]
    pub script: Option<String>,
}

impl SourceArgs {
    pub fn read(&self) -> Result<Option<String>, QuantscriptError> {
        match (&self.file, &self.script) {
            (Some(path), _) => Ok(Some(std::fs::read_to_string(path)?)),
            (None, inline) => Ok(inline.clone()),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check a script without running it
    Validate {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Run one script over a set of symbols
    Execute {
        #[command(flatten)]
        source: SourceArgs,
        /// Run a saved script instead of inline source
        #[arg(long)]
        script_id: Option<i64>,
        /// Name of the computed column
        #[arg(long)]
        column: Option<String>,
        /// Symbols to evaluate; all active entities when omitted
        #[arg(short, long, value_delimiter = ',')]
        symbols: Vec<String>,
        /// Serve rows from a daily-data CSV instead of the database
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// List latest rows, optionally with saved-script columns
    List {
        #[arg(long)]
        market_code: Option<String>,
        /// Include inactive entities
        #[arg(long)]
        all: bool,
        #[arg(long, default_value_t = 100)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        /// Saved scripts to evaluate per row
        #[arg(long = "script-id", value_delimiter = ',')]
        script_ids: Vec<i64>,
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Manage saved scripts
    #[command(subcommand)]
    Scripts(ScriptsCommand),
    /// Describe the functions and modules scripts may use
    Functions,
    /// Create the database schema
    InitDb,
    /// Load a daily-data CSV into the database
    ImportCsv { path: PathBuf },
    /// Start the web server
    Serve {
        /// Address to bind, overriding [web] listen
        #[arg(long)]
        listen: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ScriptsCommand {
    Create {
        #[arg(long)]
        name: String,
        #[command(flatten)]
        source: SourceArgs,
        #[arg(long)]
        description: Option<String>,
    },
    List,
    Show {
        id: i64,
    },
    Update {
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[command(flatten)]
        source: SourceArgs,
        #[arg(long)]
        description: Option<String>,
    },
    Delete {
        id: i64,
    },
}

/// Parses the CLI, runs it and maps the outcome to an exit code.
pub fn run(cli: Cli) -> ExitCode {
    let config = match load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return (&e).into();
        }
    };
    init_tracing(&config);

    let stdout = io::stdout();
    match dispatch(cli.command, &config, &mut stdout.lock()) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

/// `None` yields an empty configuration where every key takes its default.
pub fn load_config(path: Option<&Path>) -> Result<FileConfigAdapter, QuantscriptError> {
    match path {
        Some(path) => FileConfigAdapter::from_file(path),
        None => Ok(FileConfigAdapter::empty()),
    }
}

/// `RUST_LOG` wins over `[logging] level`; later calls are no-ops.
pub fn init_tracing(config: &dyn ConfigPort) {
    let level = config
        .get_trimmed("logging", "level")
        .unwrap_or_else(|| "info".to_string());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .try_init()
        .ok();
}

fn print_json<T: Serialize>(out: &mut dyn Write, value: &T) -> Result<(), QuantscriptError> {
    serde_json::to_writer_pretty(&mut *out, value).map_err(io::Error::other)?;
    writeln!(out)?;
    Ok(())
}

/// Runs one command, writing its JSON result to `out`.
pub fn dispatch(
    command: Command,
    config: &dyn ConfigPort,
    out: &mut dyn Write,
) -> Result<ExitCode, QuantscriptError> {
    let limits = SandboxConfig::from_config(config)?;

    match command {
        Command::Validate { source } => {
            let source = source.read()?.unwrap_or_default();
            let report = validate_offline(&source, limits)?;
            print_json(out, &report)?;
            Ok(if report.valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(4)
            })
        }
        Command::Functions => {
            print_json(out, &offline_evaluator(limits).registry().describe())?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Execute {
            source,
            script_id,
            column,
            symbols,
            csv,
        } => {
            let service = open_service(config, limits, csv.as_deref())?;
            let request = ExecuteRequest {
                script: source.read()?,
                script_id,
                column_name: column,
                symbols,
            };
            print_json(out, &service.execute(request)?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::List {
            market_code,
            all,
            limit,
            offset,
            script_ids,
            csv,
        } => {
            let service = open_service(config, limits, csv.as_deref())?;
            let query = ListQuery {
                market_code,
                active_only: !all,
                limit,
                offset,
            };
            print_json(out, &service.list_rows(&query, &script_ids)?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Scripts(command) => {
            let service = open_service(config, limits, None)?;
            run_scripts(&service, command, out)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::InitDb => {
            let store = open_store(config)?;
            print_json(out, &serde_json::json!({ "backend": store.name(), "initialized": true }))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::ImportCsv { path } => {
            let store = open_store(config)?;
            let rows = CsvAdapter::read_rows(&path)?;
            let entities = store.import(&rows)?;
            info!(rows = rows.len(), entities, "CSV imported");
            print_json(out, &serde_json::json!({ "rows": rows.len(), "entities": entities }))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Serve { listen } => {
            let service = open_service(config, limits, None)?;
            let listen = listen
                .or_else(|| config.get_trimmed("web", "listen"))
                .unwrap_or_else(|| default_listen().to_string());
            serve(service, &listen)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_scripts(
    service: &CalculationService,
    command: ScriptsCommand,
    out: &mut dyn Write,
) -> Result<(), QuantscriptError> {
    match command {
        ScriptsCommand::Create {
            name,
            source,
            description,
        } => {
            let code = source.read()?.unwrap_or_default();
            print_json(out, &service.create_script(&name, &code, description.as_deref())?)
        }
        ScriptsCommand::List => print_json(out, &service.list_scripts()?),
        ScriptsCommand::Show { id } => print_json(out, &service.get_script(id)?),
        ScriptsCommand::Update {
            id,
            name,
            source,
            description,
        } => {
            let code = source.read()?;
            let update =
                ScriptUpdate::new(name.as_deref(), code.as_deref(), description.as_deref());
            print_json(out, &service.update_script(id, &update)?)
        }
        ScriptsCommand::Delete { id } => {
            service.delete_script(id)?;
            print_json(out, &serde_json::json!({ "deleted": id }))
        }
    }
}

/// An evaluator with no market data behind `get_history`, enough for static
/// checks and the catalogue.
pub fn offline_evaluator(limits: SandboxConfig) -> Evaluator {
    let data: Arc<dyn DataPort> = Arc::new(CsvAdapter::from_rows(Vec::new()));
    let registry = CapabilityRegistry::new(Arc::new(HistoryProvider::new(data)));
    Evaluator::new(Arc::new(registry), limits)
}

pub fn validate_offline(
    source: &str,
    limits: SandboxConfig,
) -> Result<ValidationReport, QuantscriptError> {
    if source.trim().is_empty() {
        return Err(QuantscriptError::parameter("script must not be empty"));
    }
    if source.len() > limits.max_script_bytes {
        return Err(QuantscriptError::parameter(format!(
            "script exceeds the maximum size of {} bytes",
            limits.max_script_bytes
        )));
    }
    Ok(offline_evaluator(limits).validate(source).map(|_| ()).into())
}

/// A configured persistence backend.
pub enum Store {
    #[cfg(feature = "sqlite")]
    Sqlite(Arc<crate::adapters::sqlite_adapter::SqliteAdapter>),
    #[cfg(feature = "postgres")]
    Postgres(Arc<crate::adapters::postgres_adapter::PostgresAdapter>),
}

impl Store {
    pub fn name(&self) -> &'static str {
        match self {
            #[cfg(feature = "sqlite")]
            Store::Sqlite(_) => "sqlite",
            #[cfg(feature = "postgres")]
            Store::Postgres(_) => "postgres",
        }
    }

    pub fn data(&self) -> Arc<dyn DataPort> {
        match self {
            #[cfg(feature = "sqlite")]
            Store::Sqlite(a) => a.clone(),
            #[cfg(feature = "postgres")]
            Store::Postgres(a) => a.clone(),
        }
    }

    pub fn scripts(&self) -> Arc<dyn ScriptPort> {
        match self {
            #[cfg(feature = "sqlite")]
            Store::Sqlite(a) => a.clone(),
            #[cfg(feature = "postgres")]
            Store::Postgres(a) => a.clone(),
        }
    }

    /// Stores `rows` and marks every symbol in them active; returns the
    /// number of distinct entities.
    pub fn import(&self, rows: &[StockRow]) -> Result<usize, QuantscriptError> {
        let mut seen = BTreeSet::new();
        let infos: Vec<StockInfo> = rows
            .iter()
            .filter(|r| seen.insert(r.symbol.as_str()))
            .map(StockInfo::from_row)
            .collect();

        match self {
            #[cfg(feature = "sqlite")]
            Store::Sqlite(a) => {
                a.insert_rows(rows)?;
                a.upsert_stock_info(&infos)?;
            }
            #[cfg(feature = "postgres")]
            Store::Postgres(a) => {
                a.insert_rows(rows)?;
                a.upsert_stock_info(&infos)?;
            }
        }
        Ok(infos.len())
    }
}

/// Opens the backend named by `[database] backend` and ensures its schema.
pub fn open_store(config: &dyn ConfigPort) -> Result<Store, QuantscriptError> {
    let backend = config
        .get_trimmed("database", "backend")
        .unwrap_or_else(|| DEFAULT_BACKEND.to_string());

    let store = match backend.as_str() {
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            let adapter = crate::adapters::sqlite_adapter::SqliteAdapter::from_config(config)?;
            adapter.initialize_schema()?;
            Store::Sqlite(Arc::new(adapter))
        }
        #[cfg(feature = "postgres")]
        "postgres" => {
            let adapter = crate::adapters::postgres_adapter::PostgresAdapter::from_config(config)?;
            adapter.initialize_schema()?;
            Store::Postgres(Arc::new(adapter))
        }
        other => {
            return Err(QuantscriptError::ConfigInvalid {
                section: "database".into(),
                key: "backend".into(),
                reason: format!("backend '{other}' is not available in this build"),
            });
        }
    };
    info!(backend = store.name(), "store ready");
    Ok(store)
}

/// Wires the service to the configured store; `csv` replaces the store as
/// the row source while scripts still come from the store.
pub fn open_service(
    config: &dyn ConfigPort,
    limits: SandboxConfig,
    csv: Option<&Path>,
) -> Result<CalculationService, QuantscriptError> {
    let store = open_store(config)?;
    let data = match csv {
        Some(path) => Arc::new(CsvAdapter::from_file(path)?) as Arc<dyn DataPort>,
        None => store.data(),
    };
    CalculationService::new(data, store.scripts(), limits)
}

#[cfg(any(feature = "web-sqlite", feature = "web-postgres"))]
fn default_listen() -> &'static str {
    crate::adapters::web::DEFAULT_LISTEN
}

#[cfg(not(any(feature = "web-sqlite", feature = "web-postgres")))]
fn default_listen() -> &'static str {
    "127.0.0.1:5000"
}

#[cfg(any(feature = "web-sqlite", feature = "web-postgres"))]
fn serve(service: CalculationService, listen: &str) -> Result<(), QuantscriptError> {
    use crate::domain::evaluator::EVAL_STACK_SIZE;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_stack_size(EVAL_STACK_SIZE)
        .build()?;
    runtime.block_on(crate::adapters::web::serve(Arc::new(service), listen))
}

#[cfg(not(any(feature = "web-sqlite", feature = "web-postgres")))]
fn serve(_service: CalculationService, _listen: &str) -> Result<(), QuantscriptError> {
    Err(QuantscriptError::ConfigInvalid {
        section: "web".into(),
        key: "listen".into(),
        reason: "the web feature is required for serve".into(),
    })
}
