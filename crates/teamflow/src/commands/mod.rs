mod states;

use std::path::Path;

use clap::Subcommand;

use crate::error::Result;

pub(crate) use states::StatesCommand;

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Inspect persisted saga snapshots
    States {
        #[command(subcommand)]
        command: StatesCommand,
    },
}

impl Commands {
    pub(crate) fn execute(self, state_dir: &Path) -> Result<()> {
        match self {
            Self::States { command } => command.execute(state_dir),
        }
    }
}
