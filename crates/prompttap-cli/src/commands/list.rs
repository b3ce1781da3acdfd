use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};

use prompttap::storage::{DEFAULT_PAGE_LIMIT, Page, PromptRecord, RecordSink};

use super::FilterArgs;
use crate::error::CliResult;
use crate::output::{OutputFormat, format_timestamp, truncate_string};

#[derive(Parser)]
pub struct ListCommand {
    #[clap(long, short, default_value_t = DEFAULT_PAGE_LIMIT, help = "Maximum number of records to display")]
    pub limit: usize,

    #[clap(long, default_value_t = 0, help = "Number of newest records to skip")]
    pub skip: usize,

    #[clap(long, help = "Show full prompt and response text")]
    pub full: bool,

    #[clap(flatten)]
    pub filter: FilterArgs,
}

impl ListCommand {
    pub async fn execute(&self, sink: &dyn RecordSink, format: OutputFormat) -> CliResult<()> {
        let records = sink
            .list(&self.filter.to_filter(), Page::new(self.limit, self.skip))
            .await?;

        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
            OutputFormat::Table if records.is_empty() => println!("No records found."),
            OutputFormat::Table if self.full => {
                for record in &records {
                    print_full(record);
                }
            }
            OutputFormat::Table => {
                println!("{}", render_table(&records));
                println!("Showing {} record(s) from {}", records.len(), sink.name());
            }
        }

        Ok(())
    }
}

fn render_table(records: &[PromptRecord]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(["Time", "Source", "Model", "Cascade", "Words", "Prompt"]);

    for record in records {
        table.add_row([
            format_timestamp(&record.timestamp),
            record.source.clone(),
            or_dash(&record.model),
            truncate_string(&or_dash(&record.cascade_id), 12),
            record.word_count.to_string(),
            truncate_string(&record.prompt, 60),
        ]);
    }
    table
}

fn print_full(record: &PromptRecord) {
    println!("{} [{}] {}", format_timestamp(&record.timestamp), record.source, record.fingerprint);
    if !record.model.is_empty() {
        println!("Model:   {}", record.model);
    }
    if !record.cascade_id.is_empty() {
        println!("Cascade: {}", record.cascade_id);
    }
    if record.pending_reconciliation {
        println!("Pending reconciliation with the primary store");
    }
    println!("\n{}\n", record.prompt);
    if let Some(ref response) = record.response {
        println!("--- response ---\n{response}\n");
    }
    println!("{}", "=".repeat(40));
}

fn or_dash(value: &str) -> String {
    if value.is_empty() {
        "-".to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use prompttap::testing::record_at;

    #[test]
    fn test_table_has_row_per_record() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 4, 10, 0, 0).unwrap();
        let records = vec![record_at("first", ts), record_at("second", ts)];

        let rendered = render_table(&records).to_string();
        assert!(rendered.contains("first"));
        assert!(rendered.contains("second"));
        assert!(rendered.contains("2025-03-04 10:00"));
    }
}
