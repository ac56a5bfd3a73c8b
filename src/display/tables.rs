//! Table formatting for search results and store reports.

use comfy_table::{
    Attribute, Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL,
};

use crate::index::{FacetHealth, FacetOutcome, WriteReport};
use crate::knowledge::{ConsistencyReport, KbStats};
use crate::search::{FacetStatus, SearchResponse, SkipReason};

const SUMMARY_WIDTH: usize = 60;

fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.apply_modifier(UTF8_ROUND_CORNERS);
    table.set_header(
        headers
            .iter()
            .map(|h| Cell::new(h).add_attribute(Attribute::Bold))
            .collect::<Vec<_>>(),
    );
    table
}

fn truncate(text: &str, width: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= width {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Ranked hits. Rows at or above `threshold` similarity are marked green.
pub fn create_results_table(response: &SearchResponse, threshold: f32) -> String {
    let mut table = new_table(&["#", "Row", "Identifier", "Summary", "Similarity", "Facets"]);

    for (rank, hit) in response.hits.iter().enumerate() {
        let similarity = hit.similarity();
        let facets = hit
            .facet_distances
            .iter()
            .map(|fd| format!("{}={:.3}", fd.facet, fd.distance))
            .collect::<Vec<_>>()
            .join(" ");
        let similarity_cell = Cell::new(format!("{:.1}%", similarity * 100.0));
        let similarity_cell = if hit.is_duplicate(threshold) {
            similarity_cell.fg(Color::Green).add_attribute(Attribute::Bold)
        } else {
            similarity_cell
        };

        table.add_row(vec![
            Cell::new(rank + 1),
            Cell::new(hit.row_id),
            Cell::new(&hit.record.identifier),
            Cell::new(truncate(&hit.record.summary, SUMMARY_WIDTH)),
            similarity_cell,
            Cell::new(facets),
        ]);
    }

    table.to_string()
}

/// One line per facet a search skipped.
pub fn skipped_facets(response: &SearchResponse) -> Vec<String> {
    response
        .facets
        .iter()
        .filter_map(|report| match &report.status {
            FacetStatus::Skipped(SkipReason::Unavailable { detail }) => {
                Some(format!("{}: unavailable ({detail})", report.facet))
            }
            FacetStatus::Skipped(SkipReason::DimensionMismatch { expected, actual }) => Some(
                format!("{}: query has {actual} dimensions, index has {expected}", report.facet),
            ),
            _ => None,
        })
        .collect()
}

pub fn create_stats_table(stats: &KbStats) -> String {
    let mut table = new_table(&["Facet", "State", "Items", "File"]);

    for facet in &stats.facets {
        let (state, color, items) = match &facet.health {
            FacetHealth::Ready { items } => ("ready", Color::Green, items.to_string()),
            FacetHealth::Empty => ("empty", Color::DarkGrey, "-".to_string()),
            FacetHealth::Unavailable { .. } => ("unavailable", Color::Red, "-".to_string()),
        };
        table.add_row(vec![
            Cell::new(facet.facet),
            Cell::new(state).fg(color),
            Cell::new(items),
            Cell::new(facet.path.display()),
        ]);
    }

    table.add_row(vec![
        Cell::new("records").add_attribute(Attribute::Bold),
        Cell::new(format!("{} active", stats.active_records)),
        Cell::new(stats.records).add_attribute(Attribute::Bold),
        Cell::new(format!("next id {}", stats.next_id)),
    ]);

    table.to_string()
}

pub fn create_write_report_table(report: &WriteReport) -> String {
    let mut table = new_table(&["Facet", "Outcome", "Detail"]);

    for (facet, outcome) in &report.facets {
        let (label, color, detail) = match outcome {
            FacetOutcome::Rebuilt { items, rejected } if rejected.is_empty() => {
                ("rebuilt", Color::Green, format!("{items} items"))
            }
            FacetOutcome::Rebuilt { items, rejected } => (
                "rebuilt",
                Color::Yellow,
                format!("{items} items, {} rejected", rejected.len()),
            ),
            FacetOutcome::Unchanged => ("unchanged", Color::DarkGrey, String::new()),
            FacetOutcome::Failed { kind, message } => {
                ("failed", Color::Red, format!("{kind}: {message}"))
            }
        };
        table.add_row(vec![
            Cell::new(facet),
            Cell::new(label).fg(color),
            Cell::new(detail),
        ]);
    }

    table.to_string()
}

pub fn create_consistency_table(report: &ConsistencyReport) -> String {
    let mut table = new_table(&["Facet", "Problem", "Rows"]);

    for (facet, orphans) in &report.orphans {
        let rows = orphans
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        table.add_row(vec![
            Cell::new(facet),
            Cell::new("orphaned rows").fg(Color::Red),
            Cell::new(truncate(&rows, SUMMARY_WIDTH)),
        ]);
    }
    for (facet, reason) in &report.unavailable {
        table.add_row(vec![
            Cell::new(facet),
            Cell::new("unavailable").fg(Color::Yellow),
            Cell::new(truncate(reason, SUMMARY_WIDTH)),
        ]);
    }

    table.to_string()
}
