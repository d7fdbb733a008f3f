//! Project configuration (`config.json`)
//!
//! Read from the project directory by the uploader, sent to the receiver in
//! the `CONFIG` phase and used there to place and launch the project.

use crate::storage::{expand_home, home_dir};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

pub const CONFIG_FILE: &str = "config.json";

#[cfg(windows)]
const DEFAULT_COM_PORT: &str = "COM7";
#[cfg(not(windows))]
const DEFAULT_COM_PORT: &str = "/dev/ttyACM0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Host serial port the uploader opens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub com_port: Option<String>,
    /// Deploy directory on the receiver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    /// Entry point, relative to the deploy directory
    #[serde(default = "default_main")]
    pub main: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Program and leading arguments used to launch `main`
    #[serde(default = "default_runner")]
    pub runner: Vec<String>,
    #[serde(default = "default_include")]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Keys this tool does not interpret; kept so they survive the trip
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_main() -> String {
    "main.py".to_string()
}

fn default_runner() -> Vec<String> {
    vec!["python3".to_string(), "-u".to_string()]
}

fn default_include() -> Vec<String> {
    vec!["**".to_string()]
}

impl ProjectConfig {
    /// Load `config.json` from a project directory
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(CONFIG_FILE);
        if !path.exists() {
            anyhow::bail!("{} not found in project folder: {}", CONFIG_FILE, project_dir.display());
        }

        let content = fs::read(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_slice(&content).with_context(|| format!("Invalid {}", path.display()))
    }

    pub fn from_slice(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }

    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Starting point for a new project
    pub fn template() -> Self {
        Self {
            com_port: Some(DEFAULT_COM_PORT.to_string()),
            directory: Some("~/app".to_string()),
            main: default_main(),
            args: Vec::new(),
            runner: default_runner(),
            include: default_include(),
            exclude: vec![
                "__pycache__/*".to_string(),
                "*.pyc".to_string(),
                ".git/*".to_string(),
            ],
            extra: serde_json::Map::new(),
        }
    }

    /// Serial port the uploader should open
    pub fn port_name(&self) -> &str {
        self.com_port.as_deref().unwrap_or(DEFAULT_COM_PORT)
    }

    /// Where the receiver extracts the project.
    ///
    /// Unset means `app_dir`; relative paths resolve against the home
    /// directory.
    pub fn deploy_dir(&self, app_dir: &Path) -> PathBuf {
        let dir = match self.directory.as_deref().map(str::trim) {
            Some(d) if !d.is_empty() => expand_home(d),
            _ => return app_dir.to_path_buf(),
        };

        if dir.is_absolute() {
            dir
        } else {
            match home_dir() {
                Some(home) => home.join(dir),
                None => app_dir.join(dir),
            }
        }
    }

    /// Command that launches the entry point with the configured runner
    pub fn launch_command(&self, main_path: &Path) -> Command {
        let mut runner = self.runner.iter();
        let mut command = match runner.next() {
            Some(program) => {
                let mut command = Command::new(program);
                command.args(runner).arg(main_path);
                command
            }
            None => Command::new(main_path),
        };
        command.args(&self.args);
        command
    }
}
