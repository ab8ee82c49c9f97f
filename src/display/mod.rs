//! Terminal output for the CLI: progress bars and result tables.

pub mod progress;
pub mod tables;

pub use progress::{BuildProgress, create_spinner, with_spinner};
pub use tables::{
    TableBuilder, create_build_summary_table, create_index_info_table, create_search_table,
};
