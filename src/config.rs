use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::classify::{default_text_rules, TextRule};
use crate::error::{Result, SessionError};

/// Listening socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// First port to try when binding the listener
    #[serde(default = "default_port")]
    pub port: u16,
    /// How many consecutive ports to try before giving up
    #[serde(default = "default_max_port_attempts")]
    pub max_port_attempts: u16,
    /// Address the listener binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_port() -> u16 {
    4010
}

fn default_max_port_attempts() -> u16 {
    50
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_port_attempts: default_max_port_attempts(),
            bind_address: default_bind_address(),
        }
    }
}

/// Process supervision configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisionConfig {
    /// Crash penalty above which automatic restarts stop
    #[serde(default = "default_restart_threshold")]
    pub restart_threshold: u32,
    /// Interval of the safety-net timer that drains the socket and probes the process
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Sample CPU usage every this many timer ticks (0 disables sampling)
    #[serde(default = "default_cpu_poll_every")]
    pub cpu_poll_every: u32,
    /// How long a graceful quit may take before the engine is killed
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Command sent to ask the engine to exit
    #[serde(default = "default_quit_command")]
    pub quit_command: String,
}

fn default_restart_threshold() -> u32 {
    4
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_cpu_poll_every() -> u32 {
    10
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

fn default_quit_command() -> String {
    "quit();".to_string()
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            restart_threshold: default_restart_threshold(),
            poll_interval_ms: default_poll_interval_ms(),
            cpu_poll_every: default_cpu_poll_every(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            quit_command: default_quit_command(),
        }
    }
}

/// Wire protocol markers and prompt classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_prompt_prefix")]
    pub prompt_prefix: String,
    #[serde(default = "default_prompt_suffix")]
    pub prompt_suffix: String,
    #[serde(default = "default_symbols_prefix")]
    pub symbols_prefix: String,
    #[serde(default = "default_symbols_suffix")]
    pub symbols_suffix: String,
    #[serde(default = "default_variables_prefix")]
    pub variables_prefix: String,
    #[serde(default = "default_variables_suffix")]
    pub variables_suffix: String,
    /// Prompt texts matching any of these regexes are main prompts; all others are questions
    #[serde(default = "default_main_prompt_patterns")]
    pub main_prompt_patterns: Vec<String>,
    /// Ordered catalogue used to assign a severity to untagged text
    #[serde(default = "default_text_rules")]
    pub text_rules: Vec<TextRule>,
}

fn default_prompt_prefix() -> String {
    "<PROMPT-P/>".to_string()
}

fn default_prompt_suffix() -> String {
    "<PROMPT-S/>".to_string()
}

fn default_symbols_prefix() -> String {
    "<wxxml-symbols>".to_string()
}

fn default_symbols_suffix() -> String {
    "</wxxml-symbols>".to_string()
}

fn default_variables_prefix() -> String {
    "<variables>".to_string()
}

fn default_variables_suffix() -> String {
    "</variables>".to_string()
}

fn default_main_prompt_patterns() -> Vec<String> {
    vec![r"^\(%i\d+\)\s*$".to_string(), r"^MAXIMA>\s*$".to_string()]
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            prompt_prefix: default_prompt_prefix(),
            prompt_suffix: default_prompt_suffix(),
            symbols_prefix: default_symbols_prefix(),
            symbols_suffix: default_symbols_suffix(),
            variables_prefix: default_variables_prefix(),
            variables_suffix: default_variables_suffix(),
            main_prompt_patterns: default_main_prompt_patterns(),
            text_rules: default_text_rules(),
        }
    }
}

/// Evaluation queue policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of content events forwarded per command
    #[serde(default = "default_max_output_events")]
    pub max_output_events: usize,
    /// Clear the whole queue when the engine reports an error
    #[serde(default)]
    pub abort_on_error: bool,
    /// Append `;` to commands that lack a statement terminator
    #[serde(default = "default_true")]
    pub auto_terminate: bool,
}

fn default_max_output_events() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_output_events: default_max_output_events(),
            abort_on_error: false,
            auto_terminate: true,
        }
    }
}

/// Pre-transmission command validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Reject commands that do not end in `;` or `$`
    #[serde(default)]
    pub require_terminator: bool,
    /// Reject empty statements such as the one in `1;;2`
    #[serde(default)]
    pub reject_empty_statements: bool,
    /// Prefixes that mark a raw directive for the engine's underlying interpreter
    #[serde(default = "default_passthrough_prefixes")]
    pub passthrough_prefixes: Vec<String>,
}

fn default_passthrough_prefixes() -> Vec<String> {
    vec![":lisp".to_string(), ":lisp-quiet".to_string()]
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            require_terminator: false,
            reject_empty_statements: false,
            passthrough_prefixes: default_passthrough_prefixes(),
        }
    }
}

/// Main configuration for a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the engine executable
    #[serde(default = "default_engine_path")]
    pub engine_path: String,
    /// Extra arguments passed before the port flag
    #[serde(default)]
    pub engine_args: Vec<String>,
    /// Flag that carries the negotiated port number
    #[serde(default = "default_port_flag")]
    pub port_flag: String,
    /// Environment variables set for the engine process
    #[serde(default)]
    pub engine_env: HashMap<String, String>,
    /// Commands prefixed to the first transmission after the engine starts
    #[serde(default)]
    pub setup_commands: Vec<String>,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub supervision: SupervisionConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
}

fn default_engine_path() -> String {
    "maxima".to_string()
}

fn default_port_flag() -> String {
    "-s".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine_path: default_engine_path(),
            engine_args: Vec::new(),
            port_flag: default_port_flag(),
            engine_env: HashMap::new(),
            setup_commands: Vec::new(),
            network: NetworkConfig::default(),
            supervision: SupervisionConfig::default(),
            protocol: ProtocolConfig::default(),
            queue: QueueConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| SessionError::Config(e.to_string()))?;
        toml::from_str(&content).map_err(|e| SessionError::Config(e.to_string()))
    }

    /// Default location of the user configuration file, if a config dir exists
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("cas-session").join("config.toml"))
    }

    /// Merge CLI arguments into this configuration
    /// CLI arguments take precedence over config file values
    pub fn merge_cli_args(
        &mut self,
        engine_path: Option<String>,
        port: Option<u16>,
        max_output_events: Option<usize>,
        abort_on_error: bool,
    ) {
        if let Some(path) = engine_path {
            self.engine_path = path;
        }
        if let Some(p) = port {
            self.network.port = p;
        }
        if let Some(max) = max_output_events {
            self.queue.max_output_events = max;
        }
        if abort_on_error {
            self.queue.abort_on_error = true;
        }
    }

    /// Full argument list for the engine, ending with the port flag
    pub fn engine_command_args(&self, port: u16) -> Vec<String> {
        let mut args = self.engine_args.clone();
        if !self.port_flag.is_empty() {
            args.push(self.port_flag.clone());
        }
        args.push(port.to_string());
        args
    }
}
