//! Unified diff preprocessing.
//!
//! Collapses one or more file diffs into the aggregated added code, the
//! aggregated removed code and the list of touched files. The aggregated text
//! is what feeds the `code` facet embedding.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub aggregated_added_code: String,
    pub aggregated_removed_code: String,
    /// Sorted and de-duplicated.
    pub changed_files: Vec<String>,
}

#[derive(Default)]
struct FileSection {
    source: Option<String>,
    target: Option<String>,
    binary: bool,
    has_hunks: bool,
}

impl FileSection {
    fn path(&self) -> Option<String> {
        fn clean(path: &str, prefix: &str) -> Option<String> {
            let path = path.split('\t').next().unwrap_or(path).trim();
            if path.is_empty() || path == "/dev/null" {
                return None;
            }
            Some(path.strip_prefix(prefix).unwrap_or(path).to_string())
        }

        self.target
            .as_deref()
            .and_then(|p| clean(p, "b/"))
            .or_else(|| self.source.as_deref().and_then(|p| clean(p, "a/")))
    }

    fn is_started(&self) -> bool {
        self.source.is_some() || self.target.is_some()
    }
}

/// Remaining line budget of the hunk being read.
struct Hunk {
    old: usize,
    new: usize,
}

impl Hunk {
    /// Parses `@@ -a[,b] +c[,d] @@`. Unparsable counts leave the hunk open
    /// until a line that cannot belong to it.
    fn parse(header: &str) -> Self {
        fn count(range: Option<&str>) -> usize {
            range
                .map(|r| match r.split_once(',') {
                    Some((_, n)) => n.parse().unwrap_or(usize::MAX),
                    None => 1,
                })
                .unwrap_or(usize::MAX)
        }

        let mut parts = header.split_whitespace().skip(1);
        let old = count(parts.next().and_then(|p| p.strip_prefix('-')));
        let new = count(parts.next().and_then(|p| p.strip_prefix('+')));
        Self { old, new }
    }

    fn is_done(&self) -> bool {
        self.old == 0 && self.new == 0
    }
}

/// Parses unified diff text.
///
/// Returns `None` for empty or whitespace-only input. Context lines are
/// ignored and binary file sections contribute only their path.
pub fn preprocess_diffs(text: &str) -> Option<DiffSummary> {
    if text.trim().is_empty() {
        warn!("diff text is empty or whitespace only");
        return None;
    }

    let mut added = Vec::new();
    let mut removed = Vec::new();
    let mut files = BTreeSet::new();
    let mut section = FileSection::default();
    let mut hunk: Option<Hunk> = None;

    let finish = |section: &mut FileSection, files: &mut BTreeSet<String>| {
        match section.path() {
            Some(path) => {
                if section.binary {
                    debug!(path = %path, "skipping binary file diff");
                }
                files.insert(path);
            }
            None if section.is_started() => {
                warn!(
                    source = ?section.source,
                    target = ?section.target,
                    "could not determine file path for diff section"
                );
            }
            None => {}
        }
        *section = FileSection::default();
    };

    for line in text.lines() {
        let line = line.trim_end_matches('\r');

        if let Some(current) = hunk.as_mut() {
            let consumed = match line.chars().next() {
                Some('+') => {
                    added.push(line[1..].to_string());
                    current.new = current.new.saturating_sub(1);
                    true
                }
                Some('-') => {
                    removed.push(line[1..].to_string());
                    current.old = current.old.saturating_sub(1);
                    true
                }
                Some(' ') | None => {
                    current.old = current.old.saturating_sub(1);
                    current.new = current.new.saturating_sub(1);
                    true
                }
                Some('\\') => true,
                Some(_) => false,
            };
            if consumed {
                if current.is_done() {
                    hunk = None;
                }
                continue;
            }
            hunk = None;
        }

        if let Some(rest) = line.strip_prefix("diff --git ") {
            finish(&mut section, &mut files);
            // Fallback paths for sections without ---/+++ headers (binary diffs)
            let mut parts = rest.split_whitespace();
            section.source = parts.next().map(str::to_string);
            section.target = parts.next().map(str::to_string);
        } else if let Some(path) = line.strip_prefix("--- ") {
            if section.has_hunks {
                finish(&mut section, &mut files);
            }
            section.source = Some(path.to_string());
        } else if let Some(path) = line.strip_prefix("+++ ") {
            section.target = Some(path.to_string());
        } else if line.starts_with("Binary files ") || line == "GIT binary patch" {
            section.binary = true;
        } else if line.starts_with("@@") && !section.binary {
            section.has_hunks = true;
            hunk = Some(Hunk::parse(line));
        }
    }
    finish(&mut section, &mut files);

    Some(DiffSummary {
        aggregated_added_code: added.join("\n"),
        aggregated_removed_code: removed.join("\n"),
        changed_files: files.into_iter().collect(),
    })
}
