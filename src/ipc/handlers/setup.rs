use crate::db;
use crate::export::CardDefaults;
use crate::ingest::DEFAULT_BATCH_SIZE;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::jobs::RetryPolicy;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

#[derive(Clone, Copy)]
enum SetupSection {
    Ingest,
    Export,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "ingest" => Some(Self::Ingest),
            "export" => Some(Self::Export),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Ingest => "setup.ingest",
            Self::Export => "setup.export",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Ingest => json!({
            "batchSize": DEFAULT_BATCH_SIZE,
            "maxAttempts": 3,
            "attemptTimeoutSecs": 600
        }),
        SetupSection::Export => json!({
            "cardColour": "",
            "cardLayout": ""
        }),
    }
}

/// Ingestion knobs as stored in the `ingest` setup section.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSettings {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub attempt_timeout_secs: u64,
}

impl IngestSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            timeout: Duration::from_secs(self.attempt_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportSettings {
    card_colour: String,
    card_layout: String,
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Ingest => match k.as_str() {
                "batchSize" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 1000)?));
                }
                "maxAttempts" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 10)?));
                }
                "attemptTimeoutSecs" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 86_400)?));
                }
                _ => return Err(format!("unknown ingest field: {}", k)),
            },
            SetupSection::Export => match k.as_str() {
                "cardColour" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 16)?.to_uppercase()));
                }
                "cardLayout" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 32)?));
                }
                _ => return Err(format!("unknown export field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: a malformed saved value falls back to defaults.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

pub fn ingest_settings(conn: &rusqlite::Connection) -> anyhow::Result<IngestSettings> {
    Ok(serde_json::from_value(load_section(conn, SetupSection::Ingest)?)?)
}

pub fn card_defaults(conn: &rusqlite::Connection) -> anyhow::Result<CardDefaults> {
    let s: ExportSettings = serde_json::from_value(load_section(conn, SetupSection::Export)?)?;
    Ok(CardDefaults {
        card_colour: s.card_colour,
        card_layout: s.card_layout,
    })
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let ingest = match load_section(conn, SetupSection::Ingest) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let export = match load_section(conn, SetupSection::Export) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "ingest": ingest, "export": export }))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
