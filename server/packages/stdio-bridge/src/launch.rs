use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// How to start the engine process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("invalid launch json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("launch json must contain either `command` or `npx`")]
    MissingLaunchTarget,
    #[error("launch json contains both `command` and `npx`")]
    AmbiguousLaunchTarget,
    #[error("engine command is empty")]
    EmptyCommand,
    #[error("invalid environment entry '{0}', expected KEY=VALUE")]
    InvalidEnv(String),
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Parses a launch blob, either
    /// `{"command": "...", "args": [...], "env": {...}, "cwd": "..."}` or
    /// `{"npx": {"package": "...", "args": [...], "env": {...}}}`.
    pub fn from_json(blob: &str) -> Result<Self, LaunchError> {
        let value: Value = serde_json::from_str(blob)?;
        let doc: LaunchDocument = serde_json::from_value(value)?;

        match (doc.command, doc.npx) {
            (Some(_), Some(_)) => Err(LaunchError::AmbiguousLaunchTarget),
            (None, None) => Err(LaunchError::MissingLaunchTarget),
            (Some(command), None) => {
                if command.trim().is_empty() {
                    return Err(LaunchError::EmptyCommand);
                }
                Ok(Self {
                    program: PathBuf::from(command),
                    args: doc.args,
                    env: doc.env,
                    cwd: doc.cwd,
                })
            }
            (None, Some(npx)) => {
                let mut args = vec!["-y".to_string(), npx.package];
                args.extend(npx.args);
                let mut env = doc.env;
                env.extend(npx.env);
                Ok(Self {
                    program: PathBuf::from("npx"),
                    args,
                    env,
                    cwd: doc.cwd,
                })
            }
        }
    }

    /// Adds `KEY=VALUE` pairs as given on the command line.
    pub fn with_env_pairs<I, S>(mut self, pairs: I) -> Result<Self, LaunchError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pair in pairs {
            let pair = pair.as_ref();
            let (key, value) = pair
                .split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .ok_or_else(|| LaunchError::InvalidEnv(pair.to_string()))?;
            self.env.insert(key.to_string(), value.to_string());
        }
        Ok(self)
    }

    /// Shell-quoted command line, for logs and error messages.
    pub fn display(&self) -> String {
        format_command_for_display(&self.program, &self.args)
    }
}

fn format_command_for_display(program: &Path, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(shell_quote(program.to_string_lossy().as_ref()));
    for arg in args {
        parts.push(shell_quote(arg));
    }
    parts.join(" ")
}

fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LaunchDocument {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    npx: Option<LaunchNpx>,
}

#[derive(Debug, Deserialize)]
struct LaunchNpx {
    package: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}
