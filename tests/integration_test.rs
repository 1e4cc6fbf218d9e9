//! End-to-end tests of the calculation service.
//!
//! Tests cover:
//! - Bundled momentum scripts over mock market data
//! - Batch ordering, per-row failures and summaries
//! - Listing with saved-script columns
//! - The same flows over an in-memory SQLite store and a CSV file

mod common;

use approx::assert_relative_eq;
use common::*;
use quantscript::domain::batch::RowError;
use quantscript::domain::error::QuantscriptError;
use quantscript::domain::evaluator::ScriptValue;
use quantscript::domain::operations::ExecuteRequest;
use quantscript::domain::row::ListQuery;
use quantscript::domain::sandbox_config::SandboxConfig;
use quantscript::domain::script::ScriptUpdate;
use std::time::Duration;

fn request(script: &str, symbols: &[&str]) -> ExecuteRequest {
    ExecuteRequest {
        script: Some(script.to_string()),
        script_id: None,
        column_name: Some("score".to_string()),
        symbols: symbols.iter().map(|s| s.to_string()).collect(),
    }
}

/// Score of a series whose closes change by `growth` each day, seen newest
/// first by the regression.
fn steady_score(growth: f64) -> f64 {
    (1.0 / growth).powi(250) - 1.0
}

mod momentum_scripts {
    use super::*;

    #[test]
    fn momentum_scores_each_symbol() {
        let svc = service_with(market());
        let out = svc
            .execute(request(MOMENTUM, &["SH.600519", "SZ.000001", "SZ.159998"]))
            .unwrap();

        let results = &out.batch.results;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.is_ok()));
        assert_relative_eq!(
            results[0].value.as_f64().unwrap(),
            steady_score(1.01),
            max_relative = 1e-9
        );
        assert_relative_eq!(
            results[1].value.as_f64().unwrap(),
            steady_score(0.995),
            max_relative = 1e-9
        );
        // 20 days of history is below the 30-day minimum.
        assert_eq!(results[2].value, ScriptValue::Absent);
    }

    #[test]
    fn acceleration_returns_latest_window() {
        let svc = service_with(market());
        let out = svc
            .execute(request(ACCELERATION, &["SH.600519", "SZ.159998"]))
            .unwrap();
        assert_relative_eq!(
            out.batch.results[0].value.as_f64().unwrap(),
            steady_score(1.01),
            max_relative = 1e-9
        );
        assert!(out.batch.results[1].value.is_absent());
    }

    #[test]
    fn momentum_over_active_universe() {
        let svc = service_with(market());
        let out = svc.execute(request(MOMENTUM, &[])).unwrap();
        let symbols: Vec<&str> = out.batch.results.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(symbols, ["SH.600519", "SZ.000001", "SZ.159998"]);
        let summary = out.batch.summary.unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 3);
    }

    #[test]
    fn saved_momentum_script_as_list_column() {
        let svc = service_with(market());
        let momentum = svc.create_script("momentum", MOMENTUM, Some("weighted")).unwrap();
        let accel = svc.create_script("acceleration", ACCELERATION, None).unwrap();

        let listing = svc
            .list_rows(&ListQuery::default(), &[accel.id, momentum.id])
            .unwrap();
        assert_eq!(listing.total, 3);
        let first = &listing.rows[0];
        assert_eq!(first.row.symbol, "SH.600519");
        let ids: Vec<i64> = first.script_results.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, [accel.id, momentum.id]);
        assert!(first.script_results.get(momentum.id).unwrap().is_some());
    }
}

mod batches {
    use super::*;

    #[test]
    fn unknown_and_failing_rows_keep_their_slots() {
        let data = market().with_error("SZ.000001", "connection reset");
        let svc = service_with(data);
        let out = svc
            .execute(request(
                "result = row['close_price'] > 0",
                &["SH.600519", "XX.000000", "SZ.000001"],
            ))
            .unwrap();

        let results = &out.batch.results;
        assert_eq!(results[0].value, ScriptValue::Boolean(true));
        assert_eq!(
            results[1].error,
            Some(RowError::NotFound {
                symbol: "XX.000000".into()
            })
        );
        assert!(matches!(results[2].error, Some(RowError::Lookup { .. })));
        let summary = out.batch.summary.unwrap();
        assert_eq!((summary.succeeded, summary.failed), (1, 2));
    }

    #[test]
    fn response_json_shape() {
        let svc = service_with(market());
        let out = svc
            .execute(request("result = row['volume']", &["SH.600519", "NOPE"]))
            .unwrap();
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["column_name"], "score");
        assert_eq!(json["results"][0]["value"], 10_000);
        assert!(json["results"][0]["error"].is_null());
        assert!(json["results"][1]["value"].is_null());
        assert!(json["results"][1]["error"].as_str().unwrap().contains("NOPE"));
        assert_eq!(json["summary"]["successful"], 1);
        assert_eq!(json["summary"]["failed"], 1);
    }

    #[test]
    fn runaway_script_times_out_per_row() {
        let limits = SandboxConfig::default().with_timeout(Duration::from_millis(100));
        let svc = service_with_limits(market(), limits);
        let out = svc
            .execute(request("while True:\n    pass\nresult = 1", &["SH.600519"]))
            .unwrap();
        assert!(out.batch.results[0].error.is_some());
        assert!(out.batch.results[0].value.is_absent());
    }

    #[test]
    fn forbidden_script_is_rejected_before_any_row() {
        let svc = service_with(market());
        let err = svc
            .execute(request("import os\nresult = 1", &["SH.600519"]))
            .unwrap_err();
        assert!(matches!(err, QuantscriptError::Compile(_)));
    }

    #[test]
    fn no_active_entities() {
        let svc = service_with(MockDataPort::new());
        let err = svc.execute(request("result = 1", &[])).unwrap_err();
        assert!(matches!(err, QuantscriptError::NoActiveEntities));
    }
}

mod listing {
    use super::*;

    #[test]
    fn market_filter_and_inactive_entities() {
        let svc = service_with(market());
        let sz = ListQuery {
            market_code: Some("SZ".into()),
            ..ListQuery::default()
        };
        let listing = svc.list_rows(&sz, &[]).unwrap();
        assert_eq!(listing.total, 2);

        let all = ListQuery {
            active_only: false,
            ..ListQuery::default()
        };
        assert_eq!(svc.list_rows(&all, &[]).unwrap().total, 4);
    }

    #[test]
    fn script_failing_on_one_row_degrades_that_slot() {
        let svc = service_with(market());
        let s = svc
            .create_script("inverse", "result = 1 / (row['close_price'] - 1.0)", None)
            .unwrap();
        let listing = svc.list_rows(&ListQuery::default(), &[s.id]).unwrap();
        let by_symbol = |sym: &str| {
            listing
                .rows
                .iter()
                .find(|r| r.row.symbol == sym)
                .unwrap()
                .script_results
                .get(s.id)
                .unwrap()
        };
        // SZ.159998 closes flat at 1.0.
        assert_eq!(by_symbol("SZ.159998"), None);
        assert!(by_symbol("SH.600519").is_some());
    }

    #[test]
    fn missing_script_ids_are_reported_in_request_order() {
        let svc = service_with(market());
        let s = svc.create_script("one", "result = 1", None).unwrap();
        let err = svc
            .list_rows(&ListQuery::default(), &[40, s.id, 30])
            .unwrap_err();
        match err {
            QuantscriptError::ScriptsNotFound { ids } => assert_eq!(ids, vec![40, 30]),
            other => panic!("unexpected {other:?}"),
        }
    }
}

mod script_lifecycle {
    use super::*;

    #[test]
    fn create_update_run_delete() {
        let svc = service_with(market());
        let s = svc
            .create_script("  close  ", "result = row['close_price']", Some("latest close"))
            .unwrap();
        assert_eq!(s.name, "close");

        let update = ScriptUpdate::new(None, Some("result = row['volume'] * 2"), Some(""));
        let updated = svc.update_script(s.id, &update).unwrap();
        assert_eq!(updated.description, None);
        assert_eq!(updated.name, "close");

        let out = svc
            .execute(ExecuteRequest {
                script_id: Some(s.id),
                column_name: Some("vol2".into()),
                symbols: vec!["SZ.000001".into()],
                ..ExecuteRequest::default()
            })
            .unwrap();
        assert_eq!(out.batch.results[0].value, ScriptValue::Integer(20_000));

        svc.delete_script(s.id).unwrap();
        assert!(svc.get_script(s.id).unwrap_err().is_not_found());
    }

    #[test]
    fn long_names_are_rejected() {
        let svc = service_with(market());
        let name = "n".repeat(101);
        assert!(matches!(
            svc.create_script(&name, "result = 1", None),
            Err(QuantscriptError::Parameter { .. })
        ));
    }
}

#[cfg(feature = "sqlite")]
mod sqlite_store {
    use super::*;
    use quantscript::adapters::sqlite_adapter::SqliteAdapter;
    use quantscript::domain::operations::CalculationService;
    use quantscript::domain::row::StockInfo;
    use std::sync::Arc;

    fn seeded() -> Arc<SqliteAdapter> {
        let db = SqliteAdapter::in_memory().unwrap();
        db.initialize_schema().unwrap();
        let mut rows = generate_series("SH.600519", 260, 100.0, 1.01);
        rows.extend(generate_series("SZ.159998", 10, 1.0, 1.0));
        db.insert_rows(&rows).unwrap();
        let infos = vec![
            StockInfo::from_row(&rows[0]),
            StockInfo::from_row(&rows[260]),
        ];
        db.upsert_stock_info(&infos).unwrap();
        Arc::new(db)
    }

    #[test]
    fn momentum_over_sqlite_history() {
        let db = seeded();
        let svc = CalculationService::new(db.clone(), db, SandboxConfig::default()).unwrap();
        let out = svc.execute(request(MOMENTUM, &[])).unwrap();
        assert_eq!(out.batch.results.len(), 2);
        assert_relative_eq!(
            out.batch.results[0].value.as_f64().unwrap(),
            steady_score(1.01),
            max_relative = 1e-9
        );
        assert!(out.batch.results[1].value.is_absent());
    }

    #[test]
    fn saved_scripts_round_through_sqlite() {
        let db = seeded();
        let svc = CalculationService::new(db.clone(), db, SandboxConfig::default()).unwrap();
        let s = svc
            .create_script("latest", "result = row['close_price']", None)
            .unwrap();
        let listing = svc.list_rows(&ListQuery::default(), &[s.id]).unwrap();
        assert_eq!(listing.count, 2);
        let first = &listing.rows[0];
        assert_eq!(first.row.trade_date, date(2024, 6, 28));
        assert_eq!(
            first.script_results.get(s.id),
            Some(Some(ScriptValue::Float(first.row.close_price)))
        );
    }
}

mod csv_source {
    use super::*;
    use quantscript::adapters::csv_adapter::{CsvAdapter, HEADER};
    use quantscript::domain::operations::CalculationService;
    use std::io::Write;
    use std::sync::Arc;

    #[test]
    fn executes_over_csv_rows() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", HEADER.join(",")).unwrap();
        writeln!(
            file,
            "SH.600519,Kweichow Moutai,2024-06-27,1500,1520,1490,1510.5,1000,1510500,10.5,0.7,,SH"
        )
        .unwrap();
        writeln!(
            file,
            "SH.600519,Kweichow Moutai,2024-06-28,1510,1530,1500,1525,1200,1830000,14.5,0.96,,SH"
        )
        .unwrap();
        file.flush().unwrap();

        let data = Arc::new(CsvAdapter::from_file(file.path()).unwrap());
        let svc = CalculationService::new(
            data,
            Arc::new(MockScriptStore::default()),
            SandboxConfig::default(),
        )
        .unwrap();
        let out = svc
            .execute(request(
                "h = get_history(row['symbol'], 5)\nresult = len(h) * 1000 + row['close_price']",
                &["SH.600519"],
            ))
            .unwrap();
        assert_eq!(out.batch.results[0].value, ScriptValue::Float(3525.0));
    }
}
