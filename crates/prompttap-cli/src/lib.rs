pub mod commands;
pub mod error;
pub mod output;

pub use commands::{CountCommand, FilterArgs, ListCommand, StatsCommand, open_sink};
pub use error::{CliError, CliResult};
pub use output::{OutputFormat, format_timestamp, parse_time, truncate_string};
