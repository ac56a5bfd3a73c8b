//! Terminal display for CLI output: styled tables and a color theme.

pub mod tables;
pub mod theme;

pub use tables::{
    create_consistency_table, create_results_table, create_stats_table,
    create_write_report_table, skipped_facets,
};
pub use theme::{THEME, Theme};
