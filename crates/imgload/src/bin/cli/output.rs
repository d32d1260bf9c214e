//! Output formatting utilities for the CLI.
//!
//! Every listing is either a table for humans or JSON for scripts.

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use serde::Serialize;

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// Machine-parseable JSON format.
    Json,
}

/// A value that can be shown as one row of a table.
pub trait TableRow {
    /// Column headers.
    fn headers() -> &'static [&'static str];
    /// Cell contents, in header order.
    fn cells(&self) -> Vec<String>;
}

/// Image list entry for CLI output.
#[derive(Debug, Serialize)]
pub struct ImageListEntry {
    /// Repository name (e.g., "docker.io/library/alpine").
    pub repository: String,
    /// Image tag (e.g., "latest").
    pub tag: String,
    /// Image ID, possibly truncated.
    pub id: String,
    /// Full image ID.
    pub full_id: String,
    /// Pre-formatted creation time (e.g., "2 hours ago").
    pub created: String,
    /// Total size of the image's layers in bytes.
    pub size: u64,
    /// Number of layers.
    pub layers: usize,
}

impl TableRow for ImageListEntry {
    fn headers() -> &'static [&'static str] {
        &["REPOSITORY", "TAG", "IMAGE ID", "CREATED", "SIZE", "LAYERS"]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.repository.clone(),
            self.tag.clone(),
            self.id.clone(),
            self.created.clone(),
            format_size(self.size),
            self.layers.to_string(),
        ]
    }
}

/// Layer list entry for CLI output.
#[derive(Debug, Serialize)]
pub struct LayerListEntry {
    /// Chain ID, possibly truncated.
    pub id: String,
    /// Full chain ID.
    pub full_id: String,
    /// Diff ID, possibly truncated.
    pub diff_id: String,
    /// Parent chain ID, possibly truncated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Graph driver directory.
    pub cache_id: String,
    /// Outstanding references.
    pub references: u64,
    /// Uncompressed size in bytes.
    pub size: u64,
}

impl TableRow for LayerListEntry {
    fn headers() -> &'static [&'static str] {
        &["LAYER ID", "DIFF ID", "PARENT", "REFS", "SIZE"]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.diff_id.clone(),
            self.parent.clone().unwrap_or_else(|| "-".to_string()),
            self.references.to_string(),
            format_size(self.size),
        ]
    }
}

/// Format a byte count as human-readable size.
///
/// ```ignore
/// assert_eq!(format_size(512), "512 B");
/// assert_eq!(format_size(1_500_000), "1.4 MB");
/// ```
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    match bytes {
        b if b >= GB => format!("{:.1} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.1} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.1} KB", b as f64 / KB as f64),
        b => format!("{b} B"),
    }
}

/// Format a datetime relative to now, e.g. "3 days ago".
pub fn format_time_ago(dt: DateTime<Utc>) -> String {
    let duration = Utc::now().signed_duration_since(dt);
    if duration.num_seconds() < 0 {
        return "in the future".to_string();
    }

    let plural = |n: i64, unit: &str| {
        if n == 1 {
            format!("1 {unit} ago")
        } else {
            format!("{n} {unit}s ago")
        }
    };
    let days = duration.num_days();
    match () {
        _ if duration.num_seconds() < 60 => "just now".to_string(),
        _ if duration.num_minutes() < 60 => plural(duration.num_minutes(), "minute"),
        _ if duration.num_hours() < 24 => plural(duration.num_hours(), "hour"),
        _ if days < 7 => plural(days, "day"),
        _ if days < 30 => plural(days / 7, "week"),
        _ if days < 365 => plural(days / 30, "month"),
        _ => plural(days / 365, "year"),
    }
}

/// Create a styled table with consistent formatting.
pub fn create_styled_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Render rows as a table.
pub fn table_from_slice<T: TableRow>(items: &[T]) -> Table {
    let mut table = create_styled_table();
    table.set_header(T::headers().to_vec());
    for item in items {
        table.add_row(item.cells());
    }
    table
}

/// Output a slice of items in the specified format.
pub fn output_slice<T>(items: &[T], format: OutputFormat) -> Result<(), serde_json::Error>
where
    T: Serialize + TableRow,
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string(items)?;
            println!("{json}");
        }
        OutputFormat::Table => println!("{}", table_from_slice(items)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(1_500_000), "1.4 MB");
        assert_eq!(format_size(2_500_000_000), "2.3 GB");
    }

    #[test]
    fn test_format_time_ago() {
        let now = Utc::now();
        assert_eq!(format_time_ago(now), "just now");
        assert_eq!(format_time_ago(now - chrono::Duration::minutes(1)), "1 minute ago");
        assert_eq!(format_time_ago(now - chrono::Duration::hours(5)), "5 hours ago");
        assert_eq!(format_time_ago(now - chrono::Duration::days(14)), "2 weeks ago");
        assert_eq!(format_time_ago(now + chrono::Duration::hours(1)), "in the future");
    }

    #[test]
    fn test_table_has_headers_and_rows() {
        let entry = LayerListEntry {
            id: "abc123def456".to_string(),
            full_id: "sha256:abc123def456".to_string(),
            diff_id: "abc123def456".to_string(),
            parent: None,
            cache_id: "x".to_string(),
            references: 2,
            size: 2048,
        };
        let rendered = table_from_slice(&[entry]).to_string();
        assert!(rendered.contains("LAYER ID"));
        assert!(rendered.contains("abc123def456"));
        assert!(rendered.contains("2.0 KB"));
    }
}
