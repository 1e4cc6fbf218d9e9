//! CLI integration tests for command dispatch.
//!
//! Tests cover:
//! - Config loading from INI files on disk
//! - Offline validate and functions commands
//! - init-db and import-csv against a SQLite file in a temp dir
//! - execute and list over imported data, and over a CSV file
//! - Saved script management through the scripts subcommands

mod common;

use common::*;
use quantscript::adapters::csv_adapter::HEADER;
use quantscript::adapters::file_config_adapter::FileConfigAdapter;
use quantscript::cli::{self, Command, ScriptsCommand, SourceArgs};
use quantscript::domain::error::QuantscriptError;
use quantscript::domain::row::StockRow;
use quantscript::ports::config_port::ConfigPort;
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

fn write_temp_ini(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn inline(script: &str) -> SourceArgs {
    SourceArgs {
        file: None,
        script: Some(script.to_string()),
    }
}

fn run(command: Command, config: &FileConfigAdapter) -> Result<(ExitCode, Value), QuantscriptError> {
    let mut out = Vec::new();
    let code = cli::dispatch(command, config, &mut out)?;
    let json = serde_json::from_slice(&out).unwrap();
    Ok((code, json))
}

fn run_ok(command: Command, config: &FileConfigAdapter) -> Value {
    let (code, json) = run(command, config).unwrap();
    assert_eq!(code, ExitCode::SUCCESS);
    json
}

/// Writes `rows` as a daily-data CSV.
fn write_csv(path: &Path, rows: &[StockRow]) {
    let mut file = std::fs::File::create(path).unwrap();
    writeln!(file, "{}", HEADER.join(",")).unwrap();
    for r in rows {
        let opt = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_default();
        writeln!(
            file,
            "{},{},{},{},{},{},{},{},{},{},{},{},{}",
            r.symbol,
            r.stock_name,
            r.trade_date.format("%Y-%m-%d"),
            opt(r.open_price),
            opt(r.high_price),
            opt(r.low_price),
            r.close_price,
            r.volume,
            r.turnover,
            opt(r.price_change),
            opt(r.price_change_pct),
            opt(r.premium_rate),
            r.market_code
        )
        .unwrap();
    }
}

/// A SQLite-backed config rooted in its own temp dir.
struct Workspace {
    dir: tempfile::TempDir,
    config: FileConfigAdapter,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let ini = format!(
            "[database]\nbackend = sqlite\n\n[sqlite]\npath = {}\n\n[sandbox]\ntimeout_secs = 2\nworkers = 2\n",
            dir.path().join("quantscript.db").display()
        );
        let config = FileConfigAdapter::from_string(&ini).unwrap();
        Self { dir, config }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Imports a trending SH series and a short SZ one.
    fn imported(self) -> Self {
        let csv = self.path("daily.csv");
        let mut rows = generate_series("SH.600519", 60, 100.0, 1.01);
        rows.extend(generate_series("SZ.000001", 5, 10.0, 1.0));
        write_csv(&csv, &rows);
        let json = run_ok(Command::ImportCsv { path: csv }, &self.config);
        assert_eq!(json["rows"], 65);
        assert_eq!(json["entities"], 2);
        self
    }
}

mod config_loading {
    use super::*;

    #[test]
    fn loads_ini_from_disk() {
        let file = write_temp_ini("[logging]\nlevel = debug\n\n[web]\nlisten = 0.0.0.0:8080\n");
        let config = cli::load_config(Some(file.path())).unwrap();
        assert_eq!(config.get_string("logging", "level").as_deref(), Some("debug"));
        assert_eq!(config.get_string("web", "listen").as_deref(), Some("0.0.0.0:8080"));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = cli::load_config(Some(Path::new("/nonexistent/quantscript.ini"))).unwrap_err();
        assert!(matches!(err, QuantscriptError::ConfigParse { .. }));
        assert_eq!(ExitCode::from(&err), ExitCode::from(2));
    }

    #[test]
    fn no_file_means_defaults() {
        assert!(cli::load_config(None).is_ok());
    }

    #[test]
    fn invalid_sandbox_value_fails_before_dispatch() {
        let config = FileConfigAdapter::from_string("[sandbox]\nworkers = 0\n").unwrap();
        let err = run(Command::Functions, &config).unwrap_err();
        assert!(matches!(err, QuantscriptError::ConfigInvalid { .. }));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let config = FileConfigAdapter::from_string("[database]\nbackend = oracle\n").unwrap();
        let err = run(Command::InitDb, &config).unwrap_err();
        assert!(matches!(err, QuantscriptError::ConfigInvalid { .. }));
    }
}

mod offline {
    use super::*;

    #[test]
    fn validate_valid_script() {
        let config = FileConfigAdapter::empty();
        let json = run_ok(Command::Validate { source: inline("result = 1") }, &config);
        assert_eq!(json["valid"], true);
    }

    #[test]
    fn validate_invalid_script_exits_4() {
        let config = FileConfigAdapter::empty();
        let (code, json) = run(
            Command::Validate {
                source: inline("x = 1\nimport os"),
            },
            &config,
        )
        .unwrap();
        assert_eq!(code, ExitCode::from(4));
        assert_eq!(json["valid"], false);
        assert_eq!(json["line"], 2);
    }

    #[test]
    fn validate_bundled_scripts_from_file() {
        let config = FileConfigAdapter::empty();
        for script in ["scripts/momentum_score.py", "scripts/momentum_acceleration.py"] {
            let source = SourceArgs {
                file: Some(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(script)),
                script: None,
            };
            let json = run_ok(Command::Validate { source }, &config);
            assert_eq!(json["valid"], true, "{script}");
        }
    }

    #[test]
    fn validate_empty_script_is_a_parameter_error() {
        let config = FileConfigAdapter::empty();
        let err = run(Command::Validate { source: SourceArgs::default() }, &config).unwrap_err();
        assert_eq!(ExitCode::from(&err), ExitCode::from(5));
    }

    #[test]
    fn functions_lists_get_history() {
        let json = run_ok(Command::Functions, &FileConfigAdapter::empty());
        let names: Vec<&str> = json["functions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"get_history"));
    }
}

#[cfg(feature = "sqlite")]
mod sqlite_workflow {
    use super::*;

    #[test]
    fn init_db_is_idempotent() {
        let ws = Workspace::new();
        let json = run_ok(Command::InitDb, &ws.config);
        assert_eq!(json["backend"], "sqlite");
        run_ok(Command::InitDb, &ws.config);
        assert!(ws.path("quantscript.db").exists());
    }

    #[test]
    fn execute_over_imported_rows() {
        let ws = Workspace::new().imported();
        let json = run_ok(
            Command::Execute {
                source: inline(MOMENTUM),
                script_id: None,
                column: Some("momentum".into()),
                symbols: Vec::new(),
                csv: None,
            },
            &ws.config,
        );
        assert_eq!(json["column_name"], "momentum");
        let results = json["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["symbol"], "SH.600519");
        assert!(results[0]["value"].as_f64().unwrap() < 0.0);
        // Five days is too little history.
        assert!(results[1]["value"].is_null());
        assert!(results[1]["error"].is_null());
        assert_eq!(json["summary"]["total"], 2);
    }

    #[test]
    fn execute_requires_a_column() {
        let ws = Workspace::new().imported();
        let err = run(
            Command::Execute {
                source: inline("result = 1"),
                script_id: None,
                column: None,
                symbols: vec!["SH.600519".into()],
                csv: None,
            },
            &ws.config,
        )
        .unwrap_err();
        assert!(matches!(err, QuantscriptError::Parameter { .. }));
    }

    #[test]
    fn scripts_lifecycle_and_list_columns() {
        let ws = Workspace::new().imported();
        let created = run_ok(
            Command::Scripts(ScriptsCommand::Create {
                name: "double close".into(),
                source: inline("result = row['close_price'] * 2"),
                description: Some("demo".into()),
            }),
            &ws.config,
        );
        let id = created["id"].as_i64().unwrap();
        assert_eq!(created["description"], "demo");

        let listing = run_ok(
            Command::List {
                market_code: Some("SZ".into()),
                all: false,
                limit: 10,
                offset: 0,
                script_ids: vec![id],
                csv: None,
            },
            &ws.config,
        );
        assert_eq!(listing["total"], 1);
        let row = &listing["rows"][0];
        assert_eq!(row["symbol"], "SZ.000001");
        assert_eq!(row["trade_date"], "2024-06-28");
        assert_eq!(row["script_results"][id.to_string()], 20.0);

        let updated = run_ok(
            Command::Scripts(ScriptsCommand::Update {
                id,
                name: Some("triple close".into()),
                source: inline("result = row['close_price'] * 3"),
                description: None,
            }),
            &ws.config,
        );
        assert_eq!(updated["name"], "triple close");
        assert_eq!(updated["description"], "demo");

        let out = run_ok(
            Command::Execute {
                source: SourceArgs::default(),
                script_id: Some(id),
                column: Some("x3".into()),
                symbols: vec!["SZ.000001".into()],
                csv: None,
            },
            &ws.config,
        );
        assert_eq!(out["results"][0]["value"], 30.0);
        assert!(out.get("summary").is_none());

        let all = run_ok(Command::Scripts(ScriptsCommand::List), &ws.config);
        assert_eq!(all.as_array().unwrap().len(), 1);

        run_ok(Command::Scripts(ScriptsCommand::Delete { id }), &ws.config);
        let err = run(Command::Scripts(ScriptsCommand::Show { id }), &ws.config).unwrap_err();
        assert_eq!(ExitCode::from(&err), ExitCode::from(6));
    }

    #[test]
    fn list_with_unknown_script_fails() {
        let ws = Workspace::new().imported();
        let err = run(
            Command::List {
                market_code: None,
                all: true,
                limit: 100,
                offset: 0,
                script_ids: vec![77],
                csv: None,
            },
            &ws.config,
        )
        .unwrap_err();
        match err {
            QuantscriptError::ScriptsNotFound { ids } => assert_eq!(ids, vec![77]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn execute_against_csv_instead_of_store() {
        let ws = Workspace::new();
        let csv = ws.path("other.csv");
        write_csv(&csv, &generate_series("SZ.159998", 3, 1.5, 1.0));
        let json = run_ok(
            Command::Execute {
                source: inline("result = len(get_history(row['symbol'], 10))"),
                script_id: None,
                column: Some("days".into()),
                symbols: vec!["SZ.159998".into()],
                csv: Some(csv),
            },
            &ws.config,
        );
        assert_eq!(json["results"][0]["value"], 3);
    }

    #[test]
    fn import_of_bad_csv_fails_with_database_error() {
        let ws = Workspace::new();
        let csv = ws.path("bad.csv");
        std::fs::write(&csv, format!("{}\nSH.600519,X,not-a-date\n", HEADER.join(","))).unwrap();
        let err = run(Command::ImportCsv { path: csv }, &ws.config).unwrap_err();
        assert_eq!(ExitCode::from(&err), ExitCode::from(3));
    }
}
