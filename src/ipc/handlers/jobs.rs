use crate::ipc::error::ok;
use crate::ipc::handlers::setup::ingest_settings;
use crate::ipc::helpers::{get_optional_i64, get_optional_str, get_required_str, workspace, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::jobs::{self, JobStatus};
use serde_json::{json, Value};
use std::path::PathBuf;

fn db_err(e: anyhow::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", format!("{e:#}"))
}

fn jobs_enqueue(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let (ws, conn) = workspace(state)?;
    let in_path = PathBuf::from(get_required_str(params, "inPath")?);
    let campus = get_required_str(params, "campus")?;
    if !in_path.is_file() {
        return Err(HandlerErr::new(
            "source_not_found",
            format!("source file not found: {}", in_path.display()),
        )
        .with_details(json!({ "path": in_path.to_string_lossy() })));
    }
    let settings = ingest_settings(conn).map_err(db_err)?;
    let job = jobs::enqueue(conn, ws, &in_path, &campus, settings.max_attempts)
        .map_err(|e| HandlerErr::new("enqueue_failed", format!("{e:#}")))?;
    Ok(json!({ "job": job }))
}

fn jobs_run_pending(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let (ws, conn) = workspace(state)?;
    let limit = get_optional_i64(params, "limit", 1, 1000)?.map(|n| n as usize);
    let settings = ingest_settings(conn).map_err(db_err)?;
    let done = jobs::run_pending(
        conn,
        ws,
        settings.retry_policy(),
        settings.batch_size,
        limit,
    )
    .map_err(db_err)?;
    Ok(json!({ "jobs": done }))
}

fn jobs_list(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let (_, conn) = workspace(state)?;
    let status = match get_optional_str(params, "status") {
        None => None,
        Some(s) => Some(
            JobStatus::parse(&s)
                .ok_or_else(|| HandlerErr::bad_params(format!("unknown status: {}", s)))?,
        ),
    };
    let rows = jobs::list_jobs(conn, status).map_err(db_err)?;
    Ok(json!({ "jobs": rows }))
}

fn jobs_get(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let (_, conn) = workspace(state)?;
    let job_id = get_required_str(params, "jobId")?;
    match jobs::get_job(conn, &job_id).map_err(db_err)? {
        Some(job) => Ok(json!({ "job": job })),
        None => Err(HandlerErr::new("not_found", "job not found")
            .with_details(json!({ "jobId": job_id }))),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "jobs.enqueue" => jobs_enqueue(state, &req.params),
        "jobs.runPending" => jobs_run_pending(state, &req.params),
        "jobs.list" => jobs_list(state, &req.params),
        "jobs.get" => jobs_get(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
