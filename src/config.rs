//! Server launch configuration
//!
//! Reads the conventional MCP servers file:
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "files": {
//!       "command": "mcp-files",
//!       "args": ["--root", "/srv"],
//!       "env": { "LOG": "debug" },
//!       "cwd": "/srv"
//!     }
//!   }
//! }
//! ```
//!
//! Only the launch parameters are interpreted; unknown fields are ignored.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Launch parameters for one stdio server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

/// The `mcpServers` map, keyed by logical server name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServersConfig {
    #[serde(rename = "mcpServers", default)]
    pub servers: BTreeMap<String, ServerEntry>,
}

impl ServersConfig {
    /// Load and parse a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Transport(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_json(&text)?;
        tracing::debug!(path = %path.display(), servers = config.servers.len(), "Loaded server config");
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        for (name, entry) in &config.servers {
            if entry.command.trim().is_empty() {
                return Err(Error::InvalidMessage(format!(
                    "Server {} has an empty command",
                    name
                )));
            }
        }
        Ok(config)
    }

    pub fn get(&self, name: &str) -> Option<&ServerEntry> {
        self.servers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    /// Build a child process transport for the named server.
    #[cfg(feature = "childproc")]
    pub fn transport(&self, name: &str) -> Result<crate::transport::ChildProcessTransport> {
        self.get(name)
            .map(ServerEntry::transport)
            .ok_or_else(|| Error::Transport(format!("No server named {} in config", name)))
    }
}

impl ServerEntry {
    #[cfg(feature = "childproc")]
    pub fn transport(&self) -> crate::transport::ChildProcessTransport {
        let mut transport =
            crate::transport::ChildProcessTransport::new(&self.command).args(self.args.clone());
        for (key, value) in &self.env {
            transport = transport.env(key, value);
        }
        if let Some(cwd) = &self.cwd {
            transport = transport.current_dir(cwd);
        }
        transport
    }
}
