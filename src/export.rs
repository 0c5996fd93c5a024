use crate::db::StoredStudent;
use anyhow::Context;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const EXPORT_FORMAT_V1: &str = "idcard-legacy-export-v1";
const MANIFEST_ENTRY: &str = "manifest.json";
const CARDS_ENTRY: &str = "cards.csv";

/// Column order expected by the card printing system. Do not reorder.
pub const LEGACY_COLUMNS: [&str; 28] = [
    "RecordID",
    "Field1",
    "Field2",
    "Field3",
    "Field4",
    "Field5",
    "Field6",
    "Field7",
    "Field8",
    "Field9",
    "Field10",
    "Field11",
    "Field12",
    "Field13",
    "Field14",
    "Field15",
    "Field16",
    "Field17",
    "CardColour",
    "DateCreated",
    "CardLayout",
    "PrintFlag",
    "Reprint",
    "LastPrinted",
    "Blank",
    "ExternalLink",
    "Dup",
    "ExcludeFlag",
];

#[derive(Debug, Clone, Default)]
pub struct CardDefaults {
    pub card_colour: String,
    pub card_layout: String,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub row_count: usize,
    pub bundled: bool,
    pub sha256: String,
}

fn card_row(s: &StoredStudent, defaults: &CardDefaults) -> Vec<String> {
    let r = &s.record;
    let mut row = vec![String::new(); LEGACY_COLUMNS.len()];
    row[0] = r.id_number.clone();
    row[1] = r.id_number.clone();
    row[2] = r.display_name();
    row[3] = r.sort_name();
    row[4] = r.campus.clone();
    // Field5..Field17 stay blank: address and program are not part of roster imports.
    row[18] = defaults.card_colour.clone();
    row[19] = r.created_at.format("%m/%d/%Y").to_string();
    row[20] = defaults.card_layout.clone();
    row[21] = "0".to_string();
    row[22] = "0".to_string();
    row[26] = "0".to_string();
    row[27] = "0".to_string();
    row
}

/// Renders the flat card file: header row plus one row per student, CRLF line endings.
pub fn render_legacy_cards(
    students: &[StoredStudent],
    defaults: &CardDefaults,
) -> anyhow::Result<Vec<u8>> {
    let mut w = csv::WriterBuilder::new()
        .terminator(csv::Terminator::CRLF)
        .from_writer(Vec::new());
    w.write_record(LEGACY_COLUMNS)
        .context("failed to write header row")?;
    for s in students {
        w.write_record(card_row(s, defaults))
            .with_context(|| format!("failed to write card row for {}", s.record.id_number))?;
    }
    w.into_inner()
        .map_err(|e| anyhow::anyhow!("failed to finish card file: {}", e.error()))
}

/// Writes the card file to `out_path`, or a zip bundle with a manifest when
/// the path ends in `.zip`.
pub fn export_legacy_cards(
    students: &[StoredStudent],
    defaults: &CardDefaults,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let csv_bytes = render_legacy_cards(students, defaults)?;
    let sha256 = format!("{:x}", Sha256::digest(&csv_bytes));

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    let bundled = out_path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("zip"))
        .unwrap_or(false);

    if !bundled {
        std::fs::write(out_path, &csv_bytes).with_context(|| {
            format!("failed to write export file {}", out_path.to_string_lossy())
        })?;
        return Ok(ExportSummary {
            row_count: students.len(),
            bundled,
            sha256,
        });
    }

    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let exported_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let manifest = json!({
        "format": EXPORT_FORMAT_V1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": exported_at,
        "rowCount": students.len(),
        "cardsSha256": sha256,
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    zip.start_file(CARDS_ENTRY, opts)
        .context("failed to start cards entry")?;
    zip.write_all(&csv_bytes)
        .context("failed to write cards entry")?;

    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        row_count: students.len(),
        bundled,
        sha256,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::normalize_row;
    use chrono::{TimeZone, Utc};
    use std::io::Read;

    fn student(cells: &[&str]) -> StoredStudent {
        let created = Utc.with_ymd_and_hms(2024, 3, 7, 9, 30, 0).unwrap();
        StoredStudent {
            id: "x".to_string(),
            record: normalize_row(cells, "MAIN", created).expect("valid row"),
        }
    }

    #[test]
    fn card_rows_follow_legacy_layout() {
        let rows = vec![student(&["2021-001", "juan", "liza", "dela cruz", "jr"])];
        let defaults = CardDefaults {
            card_colour: "BLUE".into(),
            card_layout: "STUDENT".into(),
        };
        let bytes = render_legacy_cards(&rows, &defaults).expect("render");
        let text = String::from_utf8(bytes).expect("utf8");
        let lines = text.split("\r\n").collect::<Vec<_>>();
        assert_eq!(lines.len(), 3, "header, one row, trailing empty");
        assert_eq!(lines[0], LEGACY_COLUMNS.join(","));
        assert_eq!(
            lines[1],
            "2021-001,2021-001,JUAN L. DELA CRUZ JR,\"DELA CRUZ, JUAN L.\",MAIN,,,,,,,,,,,,,,BLUE,03/07/2024,STUDENT,0,0,,,,0,0"
        );
        assert_eq!(lines[1].matches(',').count(), 28, "27 separators plus one quoted comma");
    }

    #[test]
    fn zip_bundle_carries_manifest_and_cards() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("out").join("cards.zip");
        let rows = vec![
            student(&["1", "ana", "", "santos"]),
            student(&["2", "ben", "", "reyes"]),
        ];
        let summary = export_legacy_cards(&rows, &CardDefaults::default(), &out).expect("export");
        assert!(summary.bundled);
        assert_eq!(summary.row_count, 2);

        let mut archive = zip::ZipArchive::new(File::open(&out).expect("open zip")).expect("zip");
        let mut manifest = String::new();
        archive
            .by_name(MANIFEST_ENTRY)
            .expect("manifest")
            .read_to_string(&mut manifest)
            .expect("read manifest");
        let manifest: serde_json::Value = serde_json::from_str(&manifest).expect("json");
        assert_eq!(manifest["format"], EXPORT_FORMAT_V1);
        assert_eq!(manifest["rowCount"], 2);
        assert_eq!(manifest["cardsSha256"], summary.sha256.as_str());

        let mut cards = String::new();
        archive
            .by_name(CARDS_ENTRY)
            .expect("cards")
            .read_to_string(&mut cards)
            .expect("read cards");
        assert!(cards.contains("ANA SANTOS"));
    }
}
