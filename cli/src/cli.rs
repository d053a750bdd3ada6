use std::path::PathBuf;

use clap::Parser;
use clap::ValueEnum;
use sable_core::config::ReasoningEffort;
use sable_core::config::ThinkingMode;
use sable_core::policy::PermissionMode;

#[derive(Parser, Debug)]
#[command(name = "sable", version, about = "Local coding agent")]
pub struct Cli {
    /// Workspace directory the agent operates in.
    #[arg(value_name = "WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Application name; prefixes config files and session metadata.
    #[arg(long)]
    pub app: Option<String>,

    /// Model the agent should use.
    #[arg(long, short = 'm')]
    pub model: Option<String>,

    /// Provider id from the built-in or user-defined provider table.
    #[arg(long)]
    pub provider: Option<String>,

    /// How much the agent may do without asking.
    #[arg(long = "permission-mode", value_enum)]
    pub permission_mode: Option<PermissionModeArg>,

    /// Sandbox backend to request (e.g. docker, seatbelt).
    #[arg(long = "sandbox-type")]
    pub sandbox_type: Option<String>,

    /// Comma-separated base commands the approval broker auto-allows.
    #[arg(long = "safe-commands", value_delimiter = ',')]
    pub safe_commands: Option<Vec<String>>,

    /// Stream partial output as it arrives.
    #[arg(long, value_enum)]
    pub stream: Option<OnOff>,

    #[arg(long = "thinking-mode", value_enum)]
    pub thinking_mode: Option<ThinkingModeArg>,

    /// Thinking budget in tokens, for providers with explicit budgets.
    #[arg(long = "thinking-budget")]
    pub thinking_budget: Option<u32>,

    #[arg(long = "reasoning-effort", value_enum)]
    pub reasoning_effort: Option<ReasoningEffortArg>,

    /// Window-usage ratio that triggers compaction (clamped to 0.5..0.9).
    #[arg(long = "compact-watermark")]
    pub compact_watermark: Option<f32>,

    /// Context window budget in tokens.
    #[arg(long = "context-window")]
    pub context_window: Option<u32>,

    /// Resume an existing session id.
    #[arg(long)]
    pub session: Option<String>,

    /// One-shot mode: run this input and exit.
    #[arg(long, short = 'i')]
    pub input: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum PermissionModeArg {
    Default,
    FullControl,
}

impl From<PermissionModeArg> for PermissionMode {
    fn from(value: PermissionModeArg) -> Self {
        match value {
            PermissionModeArg::Default => PermissionMode::Default,
            PermissionModeArg::FullControl => PermissionMode::FullControl,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum OnOff {
    On,
    Off,
}

impl From<OnOff> for bool {
    fn from(value: OnOff) -> Self {
        matches!(value, OnOff::On)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum ThinkingModeArg {
    Auto,
    On,
    Off,
}

impl From<ThinkingModeArg> for ThinkingMode {
    fn from(value: ThinkingModeArg) -> Self {
        match value {
            ThinkingModeArg::Auto => ThinkingMode::Auto,
            ThinkingModeArg::On => ThinkingMode::On,
            ThinkingModeArg::Off => ThinkingMode::Off,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum ReasoningEffortArg {
    Low,
    Medium,
    High,
}

impl From<ReasoningEffortArg> for ReasoningEffort {
    fn from(value: ReasoningEffortArg) -> Self {
        match value {
            ReasoningEffortArg::Low => ReasoningEffort::Low,
            ReasoningEffortArg::Medium => ReasoningEffort::Medium,
            ReasoningEffortArg::High => ReasoningEffort::High,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_spec_flags() {
        let cli = Cli::parse_from([
            "sable",
            "/tmp/ws",
            "--permission-mode",
            "full-control",
            "--sandbox-type",
            "docker",
            "--safe-commands",
            "ls,cat",
            "--stream",
            "off",
            "--thinking-mode",
            "on",
            "--thinking-budget",
            "2048",
            "--reasoning-effort",
            "high",
            "--compact-watermark",
            "0.6",
            "--context-window",
            "64000",
            "--input",
            "say hi",
        ]);
        assert_eq!(Some(PermissionModeArg::FullControl), cli.permission_mode);
        assert_eq!(Some(vec!["ls".to_string(), "cat".to_string()]), cli.safe_commands);
        assert_eq!(Some(OnOff::Off), cli.stream);
        assert_eq!(Some(2048), cli.thinking_budget);
        assert_eq!(Some("say hi".to_string()), cli.input);
    }
}
