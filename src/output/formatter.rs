//! Output formatters for session results
//!
//! Provides JSON, table, CSV and summary renderings of session summaries,
//! status records, batch plans and pool usage.

use serde::Serialize;

use crate::batch::Batch;
use crate::models::{SessionSummary, StatusName, StatusRecord};
use crate::resource::PoolUsage;

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    JsonPretty,
    Csv,
    Summary,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "table" => Some(OutputFormat::Table),
            "json" => Some(OutputFormat::Json),
            "json-pretty" | "jsonpretty" => Some(OutputFormat::JsonPretty),
            "csv" => Some(OutputFormat::Csv),
            "summary" => Some(OutputFormat::Summary),
            _ => None,
        }
    }
}

/// Result formatter
pub struct ResultFormatter {
    format: OutputFormat,
    colorize: bool,
}

impl ResultFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            colorize: true,
        }
    }

    pub fn no_color(mut self) -> Self {
        self.colorize = false;
        self
    }

    fn json<T: Serialize + ?Sized>(&self, value: &T) -> String {
        let rendered = if self.format == OutputFormat::JsonPretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        };
        rendered.unwrap_or_default()
    }

    fn paint(&self, name: StatusName, text: &str) -> String {
        if !self.colorize {
            return text.to_string();
        }
        let color = match name {
            StatusName::Success => "32",
            StatusName::Fail | StatusName::Timeout | StatusName::Cancelled => "31",
            StatusName::Diff | StatusName::Skipped | StatusName::NotRun => "33",
            _ => return text.to_string(),
        };
        format!("\x1b[{color}m{text}\x1b[0m")
    }

    /// Format one status record
    pub fn format_record(&self, record: &StatusRecord) -> String {
        match self.format {
            OutputFormat::Json | OutputFormat::JsonPretty => self.json(record),
            OutputFormat::Csv => csv_rows(std::slice::from_ref(record)),
            OutputFormat::Table | OutputFormat::Summary => self.format_record_line(record),
        }
    }

    fn format_record_line(&self, record: &StatusRecord) -> String {
        let status = format!("{} {:9}", record.status_name.symbol(), record.status_name);
        let mut line = format!("{} {}", self.paint(record.status_name, &status), record.id);
        if let Some(code) = record.code {
            line.push_str(&format!(" [exit {code}]"));
        }
        if let Some(message) = &record.message {
            line.push_str(&format!(" - {message}"));
        }
        line
    }

    /// Format a list of status records
    pub fn format_records(&self, records: &[StatusRecord]) -> String {
        match self.format {
            OutputFormat::Json | OutputFormat::JsonPretty => self.json(records),
            OutputFormat::Csv => csv_rows(records),
            OutputFormat::Table | OutputFormat::Summary => {
                let mut output = String::new();
                for record in records {
                    output.push_str(&self.format_record_line(record));
                    output.push('\n');
                }
                output
            }
        }
    }

    /// Format a finished session
    pub fn format_summary(&self, summary: &SessionSummary) -> String {
        match self.format {
            OutputFormat::Table => self.format_summary_table(summary),
            OutputFormat::Json | OutputFormat::JsonPretty => self.json(summary),
            OutputFormat::Csv => csv_rows(&summary.records),
            OutputFormat::Summary => self.format_summary_brief(summary),
        }
    }

    fn format_summary_table(&self, summary: &SessionSummary) -> String {
        let mut output = String::new();

        output.push_str("\n╔══════════════════════════════════════════════════════════════╗\n");
        output.push_str(&format!(
            "║  Session {:28} {:>22}  ║\n",
            summary.session_id, summary.state
        ));
        output.push_str("╠══════════════════════════════════════════════════════════════╣\n");

        for record in &summary.records {
            output.push_str(&format!("  {}\n", self.format_record_line(record)));
        }

        output.push_str("╠══════════════════════════════════════════════════════════════╣\n");
        let counts: Vec<String> = summary
            .counts
            .iter()
            .map(|(name, n)| self.paint(*name, &format!("{name}: {n}")))
            .collect();
        output.push_str(&format!("  Total: {} | {}\n", summary.total, counts.join(" | ")));
        output.push_str(&format!(
            "  Pass Rate: {:5.1}% | Duration: {}ms | Exit code: {}\n",
            summary.pass_rate(),
            summary.duration_ms(),
            summary.exit_code
        ));
        output.push_str("╚══════════════════════════════════════════════════════════════╝\n");

        output
    }

    fn format_summary_brief(&self, summary: &SessionSummary) -> String {
        format!(
            "Session {} {}: {}/{} succeeded ({:.1}%) in {}ms, exit code {}",
            summary.session_id,
            summary.state,
            summary.count(StatusName::Success),
            summary.total,
            summary.pass_rate(),
            summary.duration_ms(),
            summary.exit_code
        )
    }

    /// Format a batch plan
    pub fn format_plan(&self, batches: &[Batch]) -> String {
        match self.format {
            OutputFormat::Json | OutputFormat::JsonPretty => self.json(batches),
            OutputFormat::Csv => {
                let mut output = String::from("batch,members,duration,resources,depends_on\n");
                for batch in batches {
                    output.push_str(&format!(
                        "{},\"{}\",{},\"{}\",\"{}\"\n",
                        batch.id,
                        join(&batch.members),
                        batch.duration,
                        requirement(batch),
                        join(&batch.depends_on),
                    ));
                }
                output
            }
            OutputFormat::Summary => {
                let cases: usize = batches.iter().map(|b| b.len()).sum();
                format!("{} batches for {} cases", batches.len(), cases)
            }
            OutputFormat::Table => {
                let mut output = String::new();
                for batch in batches {
                    output.push_str(&format!(
                        "{} ({} cases, {:.1}s, {}, affinity {})\n",
                        batch.id,
                        batch.len(),
                        batch.duration,
                        requirement(batch),
                        batch.affinity
                    ));
                    if !batch.depends_on.is_empty() {
                        output.push_str(&format!("  after: {}\n", join(&batch.depends_on)));
                    }
                    for member in &batch.members {
                        output.push_str(&format!("  - {member}\n"));
                    }
                }
                output
            }
        }
    }

    /// Format pool usage
    pub fn format_usage(&self, usage: &PoolUsage) -> String {
        match self.format {
            OutputFormat::Json | OutputFormat::JsonPretty => self.json(usage),
            OutputFormat::Csv => {
                let mut output = String::from("type,held,capacity\n");
                for (rtype, capacity) in &usage.capacity {
                    let held = usage.held.get(rtype).copied().unwrap_or(0);
                    output.push_str(&format!("{rtype},{held},{capacity}\n"));
                }
                output
            }
            OutputFormat::Table | OutputFormat::Summary => {
                let mut output = String::new();
                output.push_str("┌──────────────────┬──────────┬──────────┐\n");
                output.push_str("│ Type             │ Held     │ Capacity │\n");
                output.push_str("├──────────────────┼──────────┼──────────┤\n");
                for (rtype, capacity) in &usage.capacity {
                    let held = usage.held.get(rtype).copied().unwrap_or(0);
                    output.push_str(&format!("│ {rtype:16} │ {held:>8} │ {capacity:>8} │\n"));
                }
                output.push_str("└──────────────────┴──────────┴──────────┘\n");
                output.push_str(&format!(
                    "Grants: {} | Waiting: {}\n",
                    usage.grants, usage.waiters
                ));
                output
            }
        }
    }
}

impl Default for ResultFormatter {
    fn default() -> Self {
        Self::new(OutputFormat::Table)
    }
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn requirement(batch: &Batch) -> String {
    let parts: Vec<String> = batch
        .requirement()
        .iter()
        .map(|(rtype, slots)| format!("{rtype}={slots}"))
        .collect();
    if parts.is_empty() {
        "no resources".to_string()
    } else {
        parts.join(",")
    }
}

fn csv_rows(records: &[StatusRecord]) -> String {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let _ = writer.write_record(["id", "status", "code", "message"]);
    for record in records {
        let _ = writer.write_record([
            record.id.to_string(),
            record.status_name.to_string(),
            record.code.map(|c| c.to_string()).unwrap_or_default(),
            record.message.clone().unwrap_or_default(),
        ]);
    }
    writer
        .into_inner()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NodeAffinity, ResourceDemand, Status, TestCase};
    use std::collections::BTreeMap;

    fn record(id: &str, name: StatusName, message: Option<&str>) -> StatusRecord {
        let mut case = TestCase::new(id);
        case.status = Status::new(name);
        case.status.message = message.map(String::from);
        StatusRecord::from_case(&case)
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!(OutputFormat::from_str("json"), Some(OutputFormat::Json));
        assert_eq!(OutputFormat::from_str("TABLE"), Some(OutputFormat::Table));
        assert_eq!(OutputFormat::from_str("unknown"), None);
    }

    #[test]
    fn test_formatter_creation() {
        let formatter = ResultFormatter::new(OutputFormat::Json).no_color();
        assert_eq!(formatter.format, OutputFormat::Json);
        assert!(!formatter.colorize);
    }

    #[test]
    fn test_format_record_line() {
        let formatter = ResultFormatter::new(OutputFormat::Table).no_color();
        let line = formatter.format_record(&record("t.n=1", StatusName::Fail, Some("boom")));
        assert!(line.contains("FAIL"));
        assert!(line.contains("t.n=1"));
        assert!(line.ends_with("- boom"));
    }

    #[test]
    fn test_summary_formats() {
        let summary = SessionSummary::new(
            "s1",
            crate::models::SessionState::Complete,
            chrono::Utc::now(),
            vec![
                record("a", StatusName::Success, None),
                record("b", StatusName::Diff, Some("output differs")),
            ],
        );

        let brief = ResultFormatter::new(OutputFormat::Summary).format_summary(&summary);
        assert!(brief.contains("1/2 succeeded"));
        assert!(brief.contains("exit code 2"));

        let json = ResultFormatter::new(OutputFormat::Json).format_summary(&summary);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["exit_code"], 2);

        let csv = ResultFormatter::new(OutputFormat::Csv).format_summary(&summary);
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("id,status,code,message"));
        assert_eq!(lines.count(), 2);
    }

    #[test]
    fn test_format_plan() {
        let first = TestCase::new("a")
            .with_duration(5.0)
            .with_resource(ResourceDemand::new("cpu", 2));
        let second = TestCase::new("b").with_duration(1.0);
        let mut batch = Batch::new(0, NodeAffinity::Any);
        batch.push(&first);
        batch.push(&second);

        let table = ResultFormatter::new(OutputFormat::Table)
            .no_color()
            .format_plan(&[batch.clone()]);
        assert!(table.contains("batch-000 (2 cases, 6.0s, cpu=2"));
        assert!(table.contains("  - b"));

        let brief = ResultFormatter::new(OutputFormat::Summary).format_plan(&[batch]);
        assert_eq!(brief, "1 batches for 2 cases");
    }

    #[test]
    fn test_format_usage() {
        let usage = PoolUsage {
            capacity: BTreeMap::from([("cpu".to_string(), 8)]),
            held: BTreeMap::from([("cpu".to_string(), 3)]),
            grants: 2,
            waiters: 1,
        };
        let csv = ResultFormatter::new(OutputFormat::Csv).format_usage(&usage);
        assert_eq!(csv, "type,held,capacity\ncpu,3,8\n");

        let table = ResultFormatter::new(OutputFormat::Table).format_usage(&usage);
        assert!(table.contains("Grants: 2 | Waiting: 1"));
    }
}
