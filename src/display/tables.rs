//! Table formatting utilities for structured output.

use comfy_table::{
    Attribute, Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL,
};

use crate::vector::{BuildReport, ExternalHit, MergedIndexMeta};

/// Builder for creating formatted tables.
pub struct TableBuilder {
    table: Table,
}

impl Default for TableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TableBuilder {
    /// Create a new table builder.
    pub fn new() -> Self {
        Self {
            table: styled_table(),
        }
    }

    /// Set the table headers.
    pub fn set_headers(mut self, headers: Vec<&str>) -> Self {
        self.table.set_header(bold_cells(headers));
        self
    }

    /// Add a row to the table.
    pub fn add_row(mut self, row: Vec<String>) -> Self {
        self.table.add_row(row);
        self
    }

    /// Build and return the formatted table.
    pub fn build(self) -> String {
        self.table.to_string()
    }
}

fn styled_table() -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.apply_modifier(UTF8_ROUND_CORNERS);
    table
}

fn bold_cells(headers: Vec<&str>) -> Vec<Cell> {
    headers
        .into_iter()
        .map(|h| Cell::new(h).add_attribute(Attribute::Bold))
        .collect()
}

/// Ranked search results.
pub fn create_search_table(hits: &[ExternalHit]) -> String {
    let mut table = styled_table();
    table.set_header(bold_cells(vec!["Rank", "Id", "Internal id", "Distance"]));

    for (rank, hit) in hits.iter().enumerate() {
        table.add_row(vec![
            Cell::new(rank + 1),
            Cell::new(hit.id.to_string()),
            Cell::new(hit.internal_id),
            Cell::new(format!("{:.4}", hit.distance)),
        ]);
    }

    table.to_string()
}

/// Per-segment summary of a finished build.
pub fn create_build_summary_table(report: &BuildReport) -> String {
    let mut table = styled_table();
    table.set_header(bold_cells(vec!["Partition", "Ids", "Vectors", "Status"]));

    for segment in &report.segments {
        let range = segment.id_range();
        let status = if segment.reused {
            Cell::new("reused").fg(Color::Yellow)
        } else {
            Cell::new("built").fg(Color::Green)
        };
        table.add_row(vec![
            Cell::new(segment.partition),
            Cell::new(format!("{}..{}", range.start, range.end())),
            Cell::new(segment.count),
            status,
        ]);
    }

    let elapsed = report.elapsed.as_secs_f64();
    let rate = if elapsed > 0.0 {
        report.meta.vector_count as f64 / elapsed
    } else {
        0.0
    };
    table.add_row(vec![
        Cell::new("TOTAL").add_attribute(Attribute::Bold),
        Cell::new(format!("0..{}", report.meta.vector_count)).add_attribute(Attribute::Bold),
        Cell::new(report.meta.vector_count).add_attribute(Attribute::Bold),
        Cell::new(format!("{elapsed:.1}s ({rate:.0}/s)")).add_attribute(Attribute::Bold),
    ]);

    table.to_string()
}

/// Key facts about a merged index.
pub fn create_index_info_table(meta: &MergedIndexMeta) -> String {
    let populated = meta.cells.iter().filter(|c| c.len > 0).count();
    let largest = meta.cells.iter().map(|c| c.len).max().unwrap_or(0);

    let mut table = styled_table();
    table.set_header(bold_cells(vec!["Property", "Value"]));
    table.add_row(vec!["Vectors".to_string(), meta.vector_count.to_string()]);
    table.add_row(vec!["Dimension".to_string(), meta.dimension.to_string()]);
    table.add_row(vec![
        "Cells".to_string(),
        format!("{} ({populated} populated, largest {largest})", meta.nlist),
    ]);
    table.add_row(vec!["Code size".to_string(), format!("{} bytes", meta.code_size)]);
    table.add_row(vec!["Partitions".to_string(), meta.partitions.len().to_string()]);
    table.add_row(vec!["Codebook".to_string(), meta.fingerprint.to_hex()]);
    table.add_row(vec!["Created".to_string(), meta.created_at.clone()]);
    table.to_string()
}
