use crate::db::{self, StudentFilter, StudentSort};
use crate::ipc::error::ok;
use crate::ipc::helpers::{get_optional_i64, get_optional_str, workspace, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};

const DEFAULT_PER_PAGE: i64 = 25;

fn db_err(e: anyhow::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", format!("{e:#}"))
}

fn parse_filter(params: &Value) -> StudentFilter {
    StudentFilter {
        campus: get_optional_str(params, "campus"),
        suffix: get_optional_str(params, "suffix"),
        search: get_optional_str(params, "search"),
    }
}

fn students_list(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let (_, conn) = workspace(state)?;
    let filter = parse_filter(params);
    let sort = match get_optional_str(params, "sort") {
        None => StudentSort::LastName,
        Some(s) => StudentSort::parse(&s)
            .ok_or_else(|| HandlerErr::bad_params(format!("unknown sort: {}", s)))?,
    };
    let page = get_optional_i64(params, "page", 1, i64::from(u32::MAX))?.unwrap_or(1);
    let per_page = get_optional_i64(params, "perPage", 1, 200)?.unwrap_or(DEFAULT_PER_PAGE);

    let total = db::count_students(conn, &filter).map_err(db_err)?;
    let rows = db::list_students(conn, &filter, sort, Some(per_page), (page - 1) * per_page)
        .map_err(db_err)?;
    let page_count = (total + per_page - 1) / per_page;

    Ok(json!({
        "students": rows,
        "total": total,
        "page": page,
        "perPage": per_page,
        "pageCount": page_count
    }))
}

fn students_stats(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let (_, conn) = workspace(state)?;
    let filter = StudentFilter {
        campus: get_optional_str(params, "campus"),
        ..StudentFilter::default()
    };
    let total = db::count_students(conn, &filter).map_err(db_err)?;
    let by_campus = db::count_by(conn, &filter, "campus").map_err(db_err)?;
    let by_suffix = db::count_by(conn, &filter, "COALESCE(suffix, 'NONE')").map_err(db_err)?;
    let mut by_day = db::count_by(conn, &filter, "substr(created_at, 1, 10)").map_err(db_err)?;
    by_day.sort_by(|a, b| a.key.cmp(&b.key));

    Ok(json!({
        "total": total,
        "byCampus": by_campus,
        "bySuffix": by_suffix,
        "byDay": by_day
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "students.list" => students_list(state, &req.params),
        "students.stats" => students_stats(state, &req.params),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
