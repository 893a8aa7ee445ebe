use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "sheet-agent")]
#[command(about = "Turn spreadsheet instructions into deployed Apps Script and run it")]
pub struct CliArgs {
    #[arg(long, short, default_value = "sheet-agent.toml")]
    pub config: PathBuf,

    /// Bearer token to use instead of the cached OAuth credential
    #[arg(long, env = "SHEET_AGENT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    #[arg(long, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, help = "Emit logs as JSON lines")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Create a script project bound to a spreadsheet
    Provision {
        #[arg(long)]
        spreadsheet: String,
    },
    /// Generate code for an instruction, deploy it and run it
    Run {
        #[command(flatten)]
        target: TargetArgs,
        instruction: String,
    },
    /// Deploy and run an existing code file
    Push {
        #[command(flatten)]
        target: TargetArgs,
        file: PathBuf,
        #[arg(long)]
        entry_point: Option<String>,
    },
    /// List what a push would upload, without contacting the platform
    Bundle {
        dir: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, clap::Args)]
#[group(required = true, multiple = false)]
pub struct TargetArgs {
    /// Existing script project id
    #[arg(long)]
    pub script_id: Option<String>,

    /// Spreadsheet id; its project is created on first use
    #[arg(long)]
    pub spreadsheet: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_script_id() {
        let args = CliArgs::try_parse_from([
            "sheet-agent",
            "--verbose",
            "run",
            "--script-id",
            "abc",
            "add a button",
        ])
        .unwrap();

        assert!(args.verbose);
        match args.command {
            Command::Run {
                target,
                instruction,
            } => {
                assert_eq!(target.script_id.as_deref(), Some("abc"));
                assert!(target.spreadsheet.is_none());
                assert_eq!(instruction, "add a button");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_run_requires_exactly_one_target() {
        assert!(CliArgs::try_parse_from(["sheet-agent", "run", "x"]).is_err());
        assert!(CliArgs::try_parse_from([
            "sheet-agent",
            "run",
            "--script-id",
            "a",
            "--spreadsheet",
            "b",
            "x"
        ])
        .is_err());
    }

    #[test]
    fn test_bundle_dir_is_optional() {
        let args = CliArgs::try_parse_from(["sheet-agent", "bundle"]).unwrap();
        assert!(matches!(args.command, Command::Bundle { dir: None }));
    }
}
