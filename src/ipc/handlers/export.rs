use crate::db::{self, StudentFilter, StudentSort};
use crate::export::export_legacy_cards;
use crate::ipc::error::ok;
use crate::ipc::handlers::setup::card_defaults;
use crate::ipc::helpers::{get_optional_str, get_required_str, workspace, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::info;

fn export_legacy(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let (_, conn) = workspace(state)?;
    let out_path = PathBuf::from(get_required_str(params, "outPath")?);
    let filter = StudentFilter {
        campus: get_optional_str(params, "campus"),
        ..StudentFilter::default()
    };
    let defaults =
        card_defaults(conn).map_err(|e| HandlerErr::new("db_query_failed", format!("{e:#}")))?;
    let students = db::list_students(conn, &filter, StudentSort::LastName, None, 0)
        .map_err(|e| HandlerErr::new("db_query_failed", format!("{e:#}")))?;

    let summary = export_legacy_cards(&students, &defaults, &out_path)
        .map_err(|e| HandlerErr::new("io_failed", format!("{e:#}")))?;
    info!(
        out = %out_path.display(),
        rows = summary.row_count,
        bundled = summary.bundled,
        "legacy card export written"
    );

    Ok(json!({
        "rowCount": summary.row_count,
        "outPath": out_path.to_string_lossy(),
        "bundled": summary.bundled,
        "sha256": summary.sha256
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "export.legacyCards" => export_legacy(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
