//! Subcommands of the `tally` binary.

pub mod commit;
pub mod list;
pub mod record;

use clap::Subcommand;

use crate::error::MetricsError;
use crate::runtime::MetricsRuntime;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Record one observation of a metric
    Record(record::RecordArgs),
    /// Commit buffered metrics to the database
    Commit,
    /// Show persisted metrics
    List(list::ListArgs),
}

impl Commands {
    pub fn run(self, runtime: &MetricsRuntime) -> Result<(), MetricsError> {
        match self {
            Commands::Record(args) => record::handle_record(runtime, args)?,
            Commands::Commit => commit::handle_commit(runtime)?,
            Commands::List(args) => list::handle_list(runtime, args)?,
        }
        runtime.finish()?;
        Ok(())
    }
}
