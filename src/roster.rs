use chrono::{DateTime, Utc};
use serde::Serialize;

/// Generational suffixes recognised at the end of a first or last name.
pub const NAME_SUFFIXES: [&str; 6] = ["JR", "SR", "II", "III", "IV", "V"];

/// id number, first name, middle name. The last name may span every cell after that.
pub const MIN_ROW_CELLS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRecord {
    pub id_number: String,
    pub first_name: String,
    pub middle_initial: Option<char>,
    pub last_name: String,
    pub suffix: Option<String>,
    pub campus: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl StudentRecord {
    /// `JUAN L. DELA CRUZ JR`
    pub fn display_name(&self) -> String {
        let mut parts = vec![self.first_name.clone()];
        if let Some(m) = self.middle_initial {
            parts.push(format!("{m}."));
        }
        parts.push(self.last_name.clone());
        if let Some(s) = self.suffix.as_deref() {
            parts.push(s.to_string());
        }
        parts.join(" ")
    }

    /// `DELA CRUZ, JUAN L.`
    pub fn sort_name(&self) -> String {
        match self.middle_initial {
            Some(m) => format!("{}, {} {}.", self.last_name, self.first_name, m),
            None => format!("{}, {}", self.last_name, self.first_name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    TooFewCells,
    MissingIdNumber,
    MissingFirstName,
    EmptyFirstName,
    EmptyLastName,
    RowError,
}

impl SkipReason {
    pub fn code(self) -> &'static str {
        match self {
            Self::TooFewCells => "too_few_cells",
            Self::MissingIdNumber => "missing_id_number",
            Self::MissingFirstName => "missing_first_name",
            Self::EmptyFirstName => "empty_first_name",
            Self::EmptyLastName => "empty_last_name",
            Self::RowError => "row_error",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::TooFewCells => "row has fewer than 3 cells",
            Self::MissingIdNumber => "id number is empty",
            Self::MissingFirstName => "first name is empty",
            Self::EmptyFirstName => "first name is empty after removing the suffix",
            Self::EmptyLastName => "last name is empty after removing the suffix",
            Self::RowError => "row could not be processed",
        }
    }
}

/// Turns one roster row into a storage-ready record.
///
/// Cells past the middle name are rejoined with commas and treated as the
/// last name, so a last name split by an unquoted comma survives. A suffix
/// found at the end of the last name replaces one found at the end of the
/// first name; both are removed from their names either way.
pub fn normalize_row(
    cells: &[&str],
    campus: &str,
    now: DateTime<Utc>,
) -> Result<StudentRecord, SkipReason> {
    if cells.len() < MIN_ROW_CELLS {
        return Err(SkipReason::TooFewCells);
    }
    let id_number = cells[0].trim();
    if id_number.is_empty() {
        return Err(SkipReason::MissingIdNumber);
    }
    let first_raw = cells[1].trim().to_uppercase();
    if first_raw.is_empty() {
        return Err(SkipReason::MissingFirstName);
    }
    let middle_raw = cells[2].trim().to_uppercase();
    let last_raw = cells[3..].join(",").trim().to_uppercase();

    let (first_name, first_suffix) = split_suffix(first_raw.split_whitespace());
    // Commas inside the last name are separators ("DELA CRUZ, SR").
    let last_spaced = last_raw.replace(',', " ");
    let (last_name, last_suffix) = split_suffix(last_spaced.split_whitespace());

    if first_name.is_empty() {
        return Err(SkipReason::EmptyFirstName);
    }
    if last_name.is_empty() {
        return Err(SkipReason::EmptyLastName);
    }

    Ok(StudentRecord {
        id_number: id_number.to_string(),
        first_name,
        middle_initial: middle_raw.chars().next(),
        last_name,
        suffix: last_suffix.or(first_suffix).map(str::to_string),
        campus: campus.to_string(),
        created_at: now,
        updated_at: None,
    })
}

/// Matches a single token against the suffix set, ignoring one trailing period.
pub fn match_suffix(token: &str) -> Option<&'static str> {
    let bare = token.strip_suffix('.').unwrap_or(token);
    NAME_SUFFIXES.iter().copied().find(|s| *s == bare)
}

fn split_suffix<'a>(tokens: impl Iterator<Item = &'a str>) -> (String, Option<&'static str>) {
    let mut tokens = tokens.collect::<Vec<_>>();
    let suffix = tokens.last().and_then(|t| match_suffix(t));
    if suffix.is_some() {
        tokens.pop();
    }
    (tokens.join(" "), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(cells: &[&str]) -> Result<StudentRecord, SkipReason> {
        normalize_row(cells, "MAIN", Utc::now())
    }

    #[test]
    fn last_name_suffix_wins_and_both_are_stripped() {
        let r = norm(&["2021-001", "JUAN JR", "", "DELA CRUZ, SR"]).expect("record");
        assert_eq!(r.suffix.as_deref(), Some("SR"));
        assert_eq!(r.first_name, "JUAN");
        assert_eq!(r.last_name, "DELA CRUZ");
    }

    #[test]
    fn first_name_suffix_kept_when_last_name_has_none() {
        let r = norm(&["7", "jose iii.", "m", "rizal"]).expect("record");
        assert_eq!(r.first_name, "JOSE");
        assert_eq!(r.last_name, "RIZAL");
        assert_eq!(r.suffix.as_deref(), Some("III"));
    }

    #[test]
    fn minimum_cell_count() {
        assert_eq!(norm(&["12345"]), Err(SkipReason::TooFewCells));
        assert_eq!(norm(&["12345", "JUAN"]), Err(SkipReason::TooFewCells));
        let r = norm(&["12345", "JUAN", "", "DELA CRUZ"]).expect("four cells accepted");
        assert_eq!(r.middle_initial, None);
        // Three cells pass the count check but leave no last name.
        assert_eq!(norm(&["12345", "JUAN", ""]), Err(SkipReason::EmptyLastName));
    }

    #[test]
    fn split_last_name_cells_rejoin_without_comma() {
        let r = norm(&["001", "MARIA", "L", "DELA", " CRUZ"]).expect("record");
        assert_eq!(r.last_name, "DELA CRUZ");
        let r = norm(&["002", "MARIA", "L", "DELA", "CRUZ"]).expect("record");
        assert_eq!(r.last_name, "DELA CRUZ");
    }

    #[test]
    fn middle_initial_is_first_upper_char() {
        let r = norm(&["1", "ana", "liza", "santos"]).expect("record");
        assert_eq!(r.middle_initial, Some('L'));
        let r = norm(&["2", "ana", "  édith", "santos"]).expect("record");
        assert_eq!(r.middle_initial, Some('É'));
    }

    #[test]
    fn suffix_only_names_are_rejected() {
        assert_eq!(norm(&["1", "JR", "", "SANTOS"]), Err(SkipReason::EmptyFirstName));
        assert_eq!(norm(&["1", "ANA", "", " Sr. "]), Err(SkipReason::EmptyLastName));
    }

    #[test]
    fn blank_identity_cells_are_rejected() {
        assert_eq!(norm(&["  ", "ANA", "", "SANTOS"]), Err(SkipReason::MissingIdNumber));
        assert_eq!(norm(&["9", " ", "", "SANTOS"]), Err(SkipReason::MissingFirstName));
    }

    #[test]
    fn suffix_match_is_exact_after_uppercase() {
        assert_eq!(match_suffix("JR."), Some("JR"));
        assert_eq!(match_suffix("IV"), Some("IV"));
        assert_eq!(match_suffix("JR.."), None);
        assert_eq!(match_suffix("VI"), None);
        // Only the last token is considered.
        let r = norm(&["5", "II MARCO", "", "REYES"]).expect("record");
        assert_eq!(r.first_name, "II MARCO");
        assert_eq!(r.suffix, None);
    }

    #[test]
    fn display_and_sort_names() {
        let r = norm(&["5", "juan", "p", "dela cruz", "jr"]).expect("record");
        assert_eq!(r.display_name(), "JUAN P. DELA CRUZ JR");
        assert_eq!(r.sort_name(), "DELA CRUZ, JUAN P.");
    }
}
