use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};

use prompttap::storage::{RecordFilter, RecordSink, RecordStats};

use crate::error::CliResult;
use crate::output::{OutputFormat, format_timestamp};

/// Widest bar in the hourly histogram
const HISTOGRAM_WIDTH: u64 = 40;

#[derive(Parser)]
pub struct StatsCommand {
    #[clap(long, help = "Restrict statistics to one user")]
    pub user: Option<String>,
}

impl StatsCommand {
    pub async fn execute(&self, sink: &dyn RecordSink, format: OutputFormat) -> CliResult<()> {
        let mut filter = RecordFilter::new();
        if let Some(ref user) = self.user {
            filter = filter.with_user(user.clone());
        }
        let stats = sink.stats(&filter).await?;

        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
            OutputFormat::Table => {
                println!("prompttap statistics ({})", sink.name());
                println!("======================\n");
                println!("{}\n", summary_table(&stats));

                if !stats.per_model.is_empty() {
                    let mut models = Table::new();
                    models
                        .load_preset(UTF8_FULL_CONDENSED)
                        .set_content_arrangement(ContentArrangement::Dynamic)
                        .set_header(["Model", "Prompts"]);
                    for entry in &stats.per_model {
                        models.add_row([entry.model.clone(), entry.count.to_string()]);
                    }
                    println!("{models}\n");
                }

                if stats.total > 0 {
                    println!("Prompts by hour (UTC)");
                    for line in histogram(&stats.hourly) {
                        println!("{line}");
                    }
                }
            }
        }

        Ok(())
    }
}

fn summary_table(stats: &RecordStats) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(["Metric", "Value"]);

    let first = stats
        .first_timestamp
        .as_ref()
        .map(format_timestamp)
        .unwrap_or_else(|| "-".to_string());
    let last = stats
        .last_timestamp
        .as_ref()
        .map(format_timestamp)
        .unwrap_or_else(|| "-".to_string());

    for (metric, value) in [
        ("Total prompts", stats.total.to_string()),
        ("Users", stats.unique_users.to_string()),
        ("Models", stats.unique_models.to_string()),
        ("Cascades", stats.unique_cascades.to_string()),
        ("Total words", stats.total_words.to_string()),
        ("Avg prompt length", format!("{:.1}", stats.avg_prompt_length)),
        ("Avg words", format!("{:.1}", stats.avg_word_count)),
        ("Brain enabled", stats.brain_enabled.to_string()),
        ("First", first),
        ("Last", last),
    ] {
        table.add_row([metric.to_string(), value]);
    }
    table
}

fn histogram(hourly: &[u64]) -> Vec<String> {
    let peak = hourly.iter().copied().max().unwrap_or(0).max(1);
    hourly
        .iter()
        .enumerate()
        .map(|(hour, count)| {
            let width = (count * HISTOGRAM_WIDTH).div_ceil(peak) as usize;
            format!("{hour:02} {:<w$} {count}", "#".repeat(width), w = HISTOGRAM_WIDTH as usize)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_scales_to_peak() {
        let mut hourly = vec![0; 24];
        hourly[9] = 4;
        hourly[17] = 2;

        let lines = histogram(&hourly);
        assert_eq!(lines.len(), 24);
        assert!(lines[9].contains(&"#".repeat(40)));
        assert!(lines[17].contains(&"#".repeat(20)));
        assert!(!lines[0].contains('#'));
    }

    #[test]
    fn test_summary_handles_empty_stats() {
        let rendered = summary_table(&RecordStats::default()).to_string();
        assert!(rendered.contains("Total prompts"));
        assert!(rendered.contains('-'));
    }
}
