use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;
use tracing::warn;

use crate::error::Result;
use crate::error::SableErr;
use crate::flags::SABLE_HOME;
use crate::policy::PermissionMode;
use crate::providers::ModelProviderInfo;
use crate::providers::built_in_model_providers;

pub const DEFAULT_APP_NAME: &str = "sable";
pub const DEFAULT_CONTEXT_WINDOW_TOKENS: u32 = 128_000;
pub const DEFAULT_COMPACT_WATERMARK: f32 = 0.7;

/// Whether extended thinking is requested from providers that support it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ThinkingMode {
    #[default]
    Auto,
    On,
    Off,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReasoningEffort {
    Low,
    #[default]
    Medium,
    High,
}

/// Fully-resolved runtime configuration: file values overlaid with CLI
/// overrides, every knob clamped to its valid range.
#[derive(Debug, Clone)]
pub struct Config {
    pub workspace: PathBuf,
    pub app_name: String,
    pub model: String,
    pub provider_id: String,
    pub provider: ModelProviderInfo,
    pub permission_mode: PermissionMode,
    pub sandbox_type: Option<String>,
    pub safe_commands: Vec<String>,
    pub stream: bool,
    pub thinking_mode: ThinkingMode,
    pub thinking_budget: Option<u32>,
    pub reasoning_effort: ReasoningEffort,
    pub compact_watermark: f32,
    pub context_window_tokens: u32,
    pub session_id: Option<String>,
    pub home: PathBuf,
}

/// Values the CLI layer can override; `None` keeps the file/default value.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub workspace: Option<PathBuf>,
    pub app_name: Option<String>,
    pub model: Option<String>,
    pub provider_id: Option<String>,
    pub permission_mode: Option<PermissionMode>,
    pub sandbox_type: Option<String>,
    pub safe_commands: Option<Vec<String>>,
    pub stream: Option<bool>,
    pub thinking_mode: Option<ThinkingMode>,
    pub thinking_budget: Option<u32>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub compact_watermark: Option<f32>,
    pub context_window_tokens: Option<u32>,
    pub session_id: Option<String>,
}

/// On-disk shape of `<home>/<app>_config.json`.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ConfigFile {
    model: Option<String>,
    provider: Option<String>,
    permission_mode: Option<PermissionMode>,
    sandbox_type: Option<String>,
    safe_commands: Vec<String>,
    stream: Option<bool>,
    thinking_mode: Option<ThinkingMode>,
    thinking_budget: Option<u32>,
    reasoning_effort: Option<ReasoningEffort>,
    compact_watermark: Option<f32>,
    context_window_tokens: Option<u32>,

    /// Short aliases for long model names, applied before provider lookup.
    model_aliases: HashMap<String, String>,

    /// User-defined providers that extend or override the built-ins.
    providers: HashMap<String, ModelProviderInfo>,
}

impl Config {
    pub fn load(overrides: ConfigOverrides) -> Result<Self> {
        let home = resolve_home()?;
        let app_name = overrides
            .app_name
            .clone()
            .unwrap_or_else(|| DEFAULT_APP_NAME.to_string());
        let file = load_config_file(&config_path(&home, &app_name));
        Self::from_parts(home, app_name, file, overrides)
    }

    fn from_parts(
        home: PathBuf,
        app_name: String,
        file: ConfigFile,
        overrides: ConfigOverrides,
    ) -> Result<Self> {
        let workspace = match overrides.workspace {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };

        let mut providers = built_in_model_providers();
        providers.extend(file.providers.clone());

        let provider_id = overrides
            .provider_id
            .or(file.provider.clone())
            .unwrap_or_else(|| "openai".to_string());
        let provider = providers.get(&provider_id).cloned().ok_or_else(|| {
            SableErr::ProviderDecode(format!("unknown provider `{provider_id}`"))
        })?;

        let mut model = overrides
            .model
            .or(file.model.clone())
            .unwrap_or_else(|| provider.default_model.clone());
        if let Some(expanded) = file.model_aliases.get(&model) {
            model = expanded.clone();
        }

        let compact_watermark = clamp_watermark(
            overrides
                .compact_watermark
                .or(file.compact_watermark)
                .unwrap_or(DEFAULT_COMPACT_WATERMARK),
        );

        let mut safe_commands = file.safe_commands;
        if let Some(extra) = overrides.safe_commands {
            safe_commands = extra;
        }

        Ok(Self {
            workspace,
            app_name,
            model,
            provider_id,
            provider,
            permission_mode: overrides
                .permission_mode
                .or(file.permission_mode)
                .unwrap_or_default(),
            sandbox_type: overrides.sandbox_type.or(file.sandbox_type),
            safe_commands,
            stream: overrides.stream.or(file.stream).unwrap_or(true),
            thinking_mode: overrides
                .thinking_mode
                .or(file.thinking_mode)
                .unwrap_or_default(),
            thinking_budget: overrides.thinking_budget.or(file.thinking_budget),
            reasoning_effort: overrides
                .reasoning_effort
                .or(file.reasoning_effort)
                .unwrap_or_default(),
            compact_watermark,
            context_window_tokens: overrides
                .context_window_tokens
                .or(file.context_window_tokens)
                .unwrap_or(DEFAULT_CONTEXT_WINDOW_TOKENS),
            session_id: overrides.session_id,
            home,
        })
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.home.join("sessions")
    }

    pub fn session_index_path(&self) -> PathBuf {
        self.sessions_dir().join("session_index.db")
    }
}

fn resolve_home() -> Result<PathBuf> {
    if let Some(home) = &*SABLE_HOME {
        return Ok(PathBuf::from(home));
    }
    let Some(home) = dirs::home_dir() else {
        return Err(SableErr::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "could not resolve home directory",
        )));
    };
    Ok(home.join(".sable"))
}

fn config_path(home: &Path, app_name: &str) -> PathBuf {
    home.join(format!("{app_name}_config.json"))
}

fn load_config_file(path: &Path) -> ConfigFile {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(file) => file,
            Err(e) => {
                warn!("ignoring malformed config at {}: {e}", path.display());
                ConfigFile::default()
            }
        },
        Err(_) => ConfigFile::default(),
    }
}

/// Persist user config with an atomic replace so a crash mid-write never
/// leaves a truncated file.
pub fn save_config_json(home: &Path, app_name: &str, value: &serde_json::Value) -> Result<()> {
    std::fs::create_dir_all(home)?;
    let path = config_path(home, app_name);
    let mut tmp = tempfile::NamedTempFile::new_in(home)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.persist(&path)
        .map_err(|e| SableErr::StoreWrite(format!("replace {}: {}", path.display(), e.error)))?;
    Ok(())
}

pub fn clamp_watermark(value: f32) -> f32 {
    value.clamp(0.5, 0.9)
}
