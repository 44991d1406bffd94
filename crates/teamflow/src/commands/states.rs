use std::fmt::Write as _;
use std::path::Path;

use clap::Subcommand;
use teamflow_saga::{
    SagaExecutionRecord, SagaStateSummary, SagaStatus, list_saga_states, load_saga_state,
};
use tracing::debug;

use crate::error::{CliError, Result};

#[derive(Subcommand)]
pub(crate) enum StatesCommand {
    /// List every saga snapshot in the state directory
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show one saga snapshot
    Show {
        /// Id of the saga to show
        saga_id: String,

        /// Print the full snapshot as JSON
        #[arg(long)]
        json: bool,
    },
}

impl StatesCommand {
    pub(crate) fn execute(self, state_dir: &Path) -> Result<()> {
        match self {
            Self::List { json } => list(state_dir, json),
            Self::Show { saga_id, json } => show(state_dir, &saga_id, json),
        }
    }
}

fn list(state_dir: &Path, json: bool) -> Result<()> {
    debug!(state_dir = %state_dir.display(), "listing saga snapshots");
    let states = list_saga_states(state_dir)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&states)?);
    } else {
        print!("{}", render_list(&states));
    }
    Ok(())
}

fn show(state_dir: &Path, saga_id: &str, json: bool) -> Result<()> {
    debug!(state_dir = %state_dir.display(), saga_id, "loading saga snapshot");
    let record = load_saga_state(state_dir, saga_id)?.ok_or_else(|| CliError::SagaNotFound {
        saga_id: saga_id.to_string(),
        dir: state_dir.to_path_buf(),
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print!("{}", render_record(&record));
    }
    Ok(())
}

fn render_list(states: &[SagaStateSummary]) -> String {
    if states.is_empty() {
        return "No saga snapshots.\n".to_string();
    }

    let width = states.iter().map(|s| s.saga_id.len()).max().unwrap_or(0);
    let mut out = String::new();
    for state in states {
        let status = state.status.map_or("unknown", SagaStatus::as_str);
        let timestamp = state
            .timestamp
            .map_or_else(|| "-".to_string(), |t| t.to_rfc3339());
        let _ = writeln!(out, "{:<width$}  {status:<12}  {timestamp}", state.saga_id);
    }
    out
}

fn render_record(record: &SagaExecutionRecord) -> String {
    let mut out = record.summary();
    out.push('\n');

    if let Some(name) = &record.saga_name {
        let _ = writeln!(out, "name: {name}");
    }
    if let Some(start) = record.start_time {
        let _ = writeln!(out, "started: {}", start.to_rfc3339());
    }
    if let Some(end) = record.end_time {
        let _ = writeln!(out, "finished: {}", end.to_rfc3339());
    }
    if let Some(failed) = &record.failed_step_id {
        let _ = writeln!(out, "failed step: {failed}");
    }
    out
}
