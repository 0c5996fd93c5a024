use crate::blob::LocalBlobStore;
use crate::ingest::{CsvStudentIngestor, IngestError, SqliteStudentSink};
use crate::ipc::error::ok;
use crate::ipc::handlers::setup::ingest_settings;
use crate::ipc::helpers::{get_required_str, workspace, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::jobs::UPLOADS_DIR;
use serde_json::{json, Value};
use std::path::PathBuf;

pub(crate) fn ingest_error(e: &IngestError) -> HandlerErr {
    let details = match e {
        IngestError::SourceNotFound { path } | IngestError::SourceUnreadable { path, .. } => {
            json!({ "path": path.to_string_lossy() })
        }
        IngestError::BatchInsert {
            batch,
            total_batches,
            committed_batches,
            inserted,
            ..
        } => json!({
            "batch": batch,
            "totalBatches": total_batches,
            "committedBatches": committed_batches,
            "inserted": inserted
        }),
    };
    HandlerErr::new(e.code(), e.to_string()).with_details(details)
}

fn ingest_run(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let (ws, conn) = workspace(state)?;
    let in_path = PathBuf::from(get_required_str(params, "inPath")?);
    let campus = get_required_str(params, "campus")?;
    let settings =
        ingest_settings(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let blobs = LocalBlobStore::new(ws.join(UPLOADS_DIR));
    let summary = CsvStudentIngestor::new(&blobs, SqliteStudentSink::new(conn))
        .with_batch_size(settings.batch_size)
        .ingest(&in_path, &campus)
        .map_err(|e| ingest_error(&e))?;
    serde_json::to_value(summary).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "ingest.run" => ingest_run(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
