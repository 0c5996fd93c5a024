use crate::ipc::error::err;
use crate::ipc::types::AppState;
use rusqlite::Connection;
use serde_json::Value;
use std::path::Path;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn workspace(state: &AppState) -> Result<(&Path, &Connection), HandlerErr> {
    match (state.workspace.as_deref(), state.db.as_ref()) {
        (Some(ws), Some(conn)) => Ok((ws, conn)),
        _ => Err(HandlerErr::new("no_workspace", "select a workspace first")),
    }
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn get_optional_i64(params: &Value, key: &str, min: i64, max: i64) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let n = v
                .as_i64()
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must be integer", key)))?;
            if !(min..=max).contains(&n) {
                return Err(HandlerErr::bad_params(format!(
                    "{} must be in {}..={}",
                    key, min, max
                )));
            }
            Ok(Some(n))
        }
    }
}
