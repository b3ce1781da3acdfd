use clap::Parser;

use prompttap::storage::RecordSink;

use super::FilterArgs;
use crate::error::CliResult;
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct CountCommand {
    #[clap(flatten)]
    pub filter: FilterArgs,
}

impl CountCommand {
    pub async fn execute(&self, sink: &dyn RecordSink, format: OutputFormat) -> CliResult<()> {
        let count = sink.count(&self.filter.to_filter()).await?;

        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({ "count": count, "store": sink.name() });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => println!("{count}"),
        }
        Ok(())
    }
}
