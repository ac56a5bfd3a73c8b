use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};

use super::diff::preprocess_diffs;
use crate::types::{Facet, FacetMap};

/// A historical defect report.
///
/// Field names follow the tracker export; the aliases accept the legacy
/// export names so existing JSON dumps load unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefectRecord {
    /// Externally assigned ticket key, e.g. `BUG-2024-001`.
    #[serde(alias = "bug_id")]
    pub identifier: String,
    pub summary: String,
    pub description: String,
    pub file_paths: Vec<String>,
    pub code_diffs: Vec<String>,
    pub aggregated_added_code: String,
    pub aggregated_removed_code: String,
    pub test_steps: String,
    pub expected_result: String,
    pub actual_result: String,
    pub log_info: String,
    pub severity: String,
    #[serde(alias = "is_reappear")]
    pub reproducibility: String,
    pub environment: String,
    pub root_cause: Option<String>,
    pub fix_solution: Option<String>,
    pub related_issues: Vec<String>,
    #[serde(alias = "fix_person")]
    pub fix_owner: Option<String>,
    #[serde(alias = "create_at", deserialize_with = "lenient_timestamp")]
    pub created_at: Option<NaiveDateTime>,
    #[serde(alias = "fix_date", deserialize_with = "lenient_timestamp")]
    pub fixed_at: Option<NaiveDateTime>,
    pub reopen_count: u32,
    pub handlers: Vec<String>,
    pub project_id: String,
}

impl DefectRecord {
    pub fn new(identifier: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            summary: summary.into(),
            ..Self::default()
        }
    }

    /// Text that feeds the embedding of `facet`, or `None` when the record
    /// carries nothing for it.
    pub fn facet_text(&self, facet: Facet) -> Option<String> {
        let text = match facet {
            Facet::Summary => join_nonblank(&[self.summary.as_str(), self.description.as_str()]),
            Facet::Code => {
                let aggregated = join_nonblank(&[
                    self.aggregated_added_code.as_str(),
                    self.aggregated_removed_code.as_str(),
                ]);
                if aggregated.is_empty() {
                    let diffs: Vec<&str> = self.code_diffs.iter().map(String::as_str).collect();
                    join_nonblank(&diffs)
                } else {
                    aggregated
                }
            }
            Facet::TestSteps => self.test_steps.trim().to_string(),
            Facet::ExpectedResult => self.expected_result.trim().to_string(),
            Facet::ActualResult => self.actual_result.trim().to_string(),
            Facet::LogInfo => self.log_info.trim().to_string(),
            Facet::Environment => self.environment.trim().to_string(),
        };
        (!text.is_empty()).then_some(text)
    }

    /// Every populated facet text of this record.
    pub fn facet_texts(&self) -> FacetMap<String> {
        Facet::ALL
            .into_iter()
            .filter_map(|facet| self.facet_text(facet).map(|text| (facet, text)))
            .collect()
    }

    /// Derives aggregated code and file paths from the raw diffs when the
    /// export left them empty.
    pub fn normalize(&mut self) {
        let needs_code =
            self.aggregated_added_code.is_empty() && self.aggregated_removed_code.is_empty();
        let needs_files = self.file_paths.is_empty();
        if !(needs_code || needs_files) || self.code_diffs.is_empty() {
            return;
        }

        let Some(summary) = preprocess_diffs(&self.code_diffs.join("\n")) else {
            return;
        };
        if needs_code {
            self.aggregated_added_code = summary.aggregated_added_code;
            self.aggregated_removed_code = summary.aggregated_removed_code;
        }
        if needs_files {
            self.file_paths = summary.changed_files;
        }
    }

    /// Interprets the free-form reproducibility field.
    pub fn is_reproducible(&self) -> bool {
        matches!(
            self.reproducibility.trim().to_lowercase().as_str(),
            "yes" | "y" | "true" | "1" | "always" | "是"
        )
    }
}

fn join_nonblank(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Accepts ISO-8601 or `YYYY-MM-DD HH:MM:SS` timestamps, a bare date, or an
/// empty string.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    let Some(raw) = raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };

    const FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"];
    for format in FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(&raw, format) {
            return Ok(Some(ts));
        }
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(&raw, "%Y-%m-%d") {
        return Ok(date.and_hms_opt(0, 0, 0));
    }
    Err(serde::de::Error::custom(format!("invalid timestamp '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_field_names_are_accepted() {
        let json = r#"{
            "bug_id": "BUG-2024-001",
            "summary": "Memory keeps growing",
            "description": "After long runs the process is killed",
            "is_reappear": "yes",
            "fix_person": "alice",
            "create_at": "2024-03-01T10:00:00",
            "fix_date": "",
            "handlers": ["alice", "bob"],
            "reopen_count": 2
        }"#;
        let record: DefectRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.identifier, "BUG-2024-001");
        assert!(record.is_reproducible());
        assert_eq!(record.fix_owner.as_deref(), Some("alice"));
        assert_eq!(
            record.created_at.unwrap().to_string(),
            "2024-03-01 10:00:00"
        );
        assert!(record.fixed_at.is_none());
        assert_eq!(record.reopen_count, 2);
    }

    #[test]
    fn test_facet_text_selection() {
        let mut record = DefectRecord::new("BUG-1", "Crash on login");
        record.description = "Happens after upgrade".to_string();
        record.log_info = "  ".to_string();
        record.code_diffs = vec!["+fix()".to_string()];

        assert_eq!(
            record.facet_text(Facet::Summary).as_deref(),
            Some("Crash on login\nHappens after upgrade")
        );
        assert!(record.facet_text(Facet::LogInfo).is_none());
        // Falls back to raw diffs while aggregated code is empty
        assert_eq!(record.facet_text(Facet::Code).as_deref(), Some("+fix()"));

        let texts = record.facet_texts();
        assert_eq!(texts.len(), 2);
    }

    #[test]
    fn test_normalize_fills_code_and_files_from_diffs() {
        let mut record = DefectRecord::new("BUG-2", "Wrong total");
        record.code_diffs = vec![
            "--- a/src/cart.rs".to_string(),
            "+++ b/src/cart.rs".to_string(),
            "@@ -1 +1 @@".to_string(),
            "-total - discount".to_string(),
            "+total.saturating_sub(discount)".to_string(),
        ];
        record.normalize();

        assert_eq!(record.aggregated_added_code, "total.saturating_sub(discount)");
        assert_eq!(record.aggregated_removed_code, "total - discount");
        assert_eq!(record.file_paths, vec!["src/cart.rs"]);
        assert_eq!(
            record.facet_text(Facet::Code).as_deref(),
            Some("total.saturating_sub(discount)\ntotal - discount")
        );
    }

    #[test]
    fn test_normalize_keeps_existing_values() {
        let mut record = DefectRecord::new("BUG-3", "x");
        record.aggregated_added_code = "kept".to_string();
        record.file_paths = vec!["a.rs".to_string()];
        record.code_diffs = vec!["--- a/b.rs\n+++ b/b.rs\n@@ -1 +1 @@\n-a\n+b".to_string()];
        record.normalize();
        assert_eq!(record.aggregated_added_code, "kept");
        assert_eq!(record.file_paths, vec!["a.rs"]);
    }

    #[test]
    fn test_invalid_timestamp_is_rejected() {
        let json = r#"{"bug_id": "BUG-4", "create_at": "yesterday"}"#;
        assert!(serde_json::from_str::<DefectRecord>(json).is_err());
    }
}
