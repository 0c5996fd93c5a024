use crate::roster::StudentRecord;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;

pub const DB_FILE: &str = "idcard.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    // Job workers open their own connection to the same file.
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            id_number TEXT NOT NULL UNIQUE,
            first_name TEXT NOT NULL,
            middle_initial TEXT,
            last_name TEXT NOT NULL,
            suffix TEXT,
            campus TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_campus ON students(campus)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_name ON students(last_name, first_name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS ingest_jobs(
            id TEXT PRIMARY KEY,
            campus TEXT NOT NULL,
            original_name TEXT NOT NULL,
            upload_path TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            status TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            last_error TEXT,
            summary_json TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ingest_jobs_status ON ingest_jobs(status, created_at)",
        [],
    )?;

    Ok(conn)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

/// Writes one batch in a single transaction. Rows whose id number already
/// exists are dropped by the UNIQUE constraint; returns how many were new.
pub fn insert_students_ignore_duplicates(
    conn: &Connection,
    records: &[StudentRecord],
) -> anyhow::Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut inserted = 0usize;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT OR IGNORE INTO students(
                id, id_number, first_name, middle_initial, last_name, suffix, campus, created_at, updated_at
            ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for r in records {
            inserted += stmt.execute(params![
                uuid::Uuid::new_v4().to_string(),
                r.id_number,
                r.first_name,
                r.middle_initial.map(|c| c.to_string()),
                r.last_name,
                r.suffix,
                r.campus,
                r.created_at,
                r.updated_at,
            ])?;
        }
    }
    tx.commit()?;
    Ok(inserted)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredStudent {
    pub id: String,
    #[serde(flatten)]
    pub record: StudentRecord,
}

#[derive(Debug, Clone, Default)]
pub struct StudentFilter {
    pub campus: Option<String>,
    pub suffix: Option<String>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudentSort {
    LastName,
    IdNumber,
    CreatedAt,
}

impl StudentSort {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lastName" => Some(Self::LastName),
            "idNumber" => Some(Self::IdNumber),
            "createdAt" => Some(Self::CreatedAt),
            _ => None,
        }
    }

    fn order_by(self) -> &'static str {
        match self {
            Self::LastName => "last_name, first_name, id_number",
            Self::IdNumber => "id_number",
            Self::CreatedAt => "created_at DESC, id_number",
        }
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if ch == '%' || ch == '_' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn filter_clause(filter: &StudentFilter) -> (String, Vec<String>) {
    let mut conds: Vec<&str> = Vec::new();
    let mut args: Vec<String> = Vec::new();
    if let Some(c) = filter.campus.as_deref() {
        conds.push("campus = ?");
        args.push(c.to_string());
    }
    if let Some(s) = filter.suffix.as_deref() {
        if s.eq_ignore_ascii_case("none") {
            conds.push("suffix IS NULL");
        } else {
            conds.push("suffix = ?");
            args.push(s.to_uppercase());
        }
    }
    if let Some(q) = filter.search.as_deref() {
        conds.push(
            "(id_number LIKE ? ESCAPE '\\' OR first_name LIKE ? ESCAPE '\\' OR last_name LIKE ? ESCAPE '\\')",
        );
        let pattern = format!("%{}%", escape_like(&q.to_uppercase()));
        for _ in 0..3 {
            args.push(pattern.clone());
        }
    }
    if conds.is_empty() {
        (String::new(), args)
    } else {
        (format!(" WHERE {}", conds.join(" AND ")), args)
    }
}

fn read_student(r: &rusqlite::Row<'_>) -> rusqlite::Result<StoredStudent> {
    let middle: Option<String> = r.get(3)?;
    Ok(StoredStudent {
        id: r.get(0)?,
        record: StudentRecord {
            id_number: r.get(1)?,
            first_name: r.get(2)?,
            middle_initial: middle.and_then(|m| m.chars().next()),
            last_name: r.get(4)?,
            suffix: r.get(5)?,
            campus: r.get(6)?,
            created_at: r.get::<_, DateTime<Utc>>(7)?,
            updated_at: r.get::<_, Option<DateTime<Utc>>>(8)?,
        },
    })
}

pub fn count_students(conn: &Connection, filter: &StudentFilter) -> anyhow::Result<i64> {
    let (clause, args) = filter_clause(filter);
    let sql = format!("SELECT COUNT(*) FROM students{}", clause);
    Ok(conn.query_row(&sql, params_from_iter(args.iter()), |r| r.get(0))?)
}

/// `limit = None` returns every matching row.
pub fn list_students(
    conn: &Connection,
    filter: &StudentFilter,
    sort: StudentSort,
    limit: Option<i64>,
    offset: i64,
) -> anyhow::Result<Vec<StoredStudent>> {
    let (clause, args) = filter_clause(filter);
    let sql = format!(
        "SELECT id, id_number, first_name, middle_initial, last_name, suffix, campus, created_at, updated_at
         FROM students{} ORDER BY {} LIMIT {} OFFSET {}",
        clause,
        sort.order_by(),
        limit.unwrap_or(-1),
        offset.max(0)
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args.iter()), read_student)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, Serialize)]
pub struct Bucket {
    pub key: String,
    pub count: i64,
}

/// Grouped counts for one expression over `students`, largest first.
pub fn count_by(conn: &Connection, filter: &StudentFilter, expr: &str) -> anyhow::Result<Vec<Bucket>> {
    let (clause, args) = filter_clause(filter);
    let sql = format!(
        "SELECT {expr} AS k, COUNT(*) AS n FROM students{clause} GROUP BY k ORDER BY n DESC, k"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args.iter()), |r| {
            Ok(Bucket {
                key: r.get(0)?,
                count: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::normalize_row;

    fn record(id: &str, first: &str, last: &str, campus: &str) -> StudentRecord {
        normalize_row(&[id, first, "", last], campus, Utc::now()).expect("valid row")
    }

    #[test]
    fn insert_ignores_existing_id_numbers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = open_db(dir.path()).expect("open db");
        let batch = vec![
            record("1", "ANA", "SANTOS", "MAIN"),
            record("2", "BEN", "REYES", "MAIN"),
            record("1", "ANA", "DUPLICATE", "MAIN"),
        ];
        assert_eq!(insert_students_ignore_duplicates(&conn, &batch).expect("insert"), 2);
        assert_eq!(insert_students_ignore_duplicates(&conn, &batch).expect("insert again"), 0);

        let all = list_students(&conn, &StudentFilter::default(), StudentSort::IdNumber, None, 0)
            .expect("list");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].record.last_name, "SANTOS");
    }

    #[test]
    fn filters_search_and_counts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = open_db(dir.path()).expect("open db");
        let batch = vec![
            record("A-1", "ANA", "SANTOS", "MAIN"),
            record("A-2", "BEN", "REYES JR", "MAIN"),
            record("B-1", "CARLA", "SANTOS", "NORTH"),
        ];
        insert_students_ignore_duplicates(&conn, &batch).expect("insert");

        let f = StudentFilter {
            search: Some("santos".into()),
            ..Default::default()
        };
        assert_eq!(count_students(&conn, &f).expect("count"), 2);

        let f = StudentFilter {
            campus: Some("MAIN".into()),
            suffix: Some("jr".into()),
            ..Default::default()
        };
        let rows = list_students(&conn, &f, StudentSort::LastName, Some(10), 0).expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.id_number, "A-2");

        let by_campus = count_by(&conn, &StudentFilter::default(), "campus").expect("count_by");
        assert_eq!(by_campus[0].key, "MAIN");
        assert_eq!(by_campus[0].count, 2);

        // LIKE wildcards in the search text are literal.
        let f = StudentFilter {
            search: Some("%".into()),
            ..Default::default()
        };
        assert_eq!(count_students(&conn, &f).expect("count"), 0);
    }

    #[test]
    fn settings_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = open_db(dir.path()).expect("open db");
        assert!(settings_get_json(&conn, "setup.ingest").expect("get").is_none());
        settings_set_json(&conn, "setup.ingest", &serde_json::json!({ "batchSize": 50 }))
            .expect("set");
        let v = settings_get_json(&conn, "setup.ingest").expect("get").expect("some");
        assert_eq!(v["batchSize"], 50);
    }
}
