//! TOML configuration.
//!
//! Every section and key is optional; missing values fall back to the
//! defaults below. Invalid values are rejected at load time.
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:8080"
//!
//! [compiler]
//! compiler = "g++"
//! compile_flags = ["-std=c++17", "-O2"]
//! compile_timeout_secs = 10
//! run_timeout_secs = 5
//! max_output_bytes = 65536
//!
//! [[auth.tokens]]
//! token = "s3cret"
//! username = "alice"
//! display_name = "Alice"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_INITIAL_CODE: &str = "// Shared editor: write your C++ code here\n\n\
#include <bits/stdc++.h>\n\
using namespace std;\n\n\
int main() {\n    int n;\n    cin >> n;\n    cout << n * n << '\\n';\n    return 0;\n}\n";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    pub server: ServerSection,
    pub compiler: CompilerConfig,
    pub websocket: WebSocketConfig,
    pub auth: AuthConfig,
    pub document: DocumentConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Address to bind to
    pub bind_addr: String,
    /// Request path accepted for the WebSocket upgrade
    pub ws_path: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            ws_path: "/ws".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Compiler executable
    pub compiler: String,
    /// Flags passed before `<source> -o <output>`
    pub compile_flags: Vec<String>,
    pub compile_timeout_secs: u64,
    pub run_timeout_secs: u64,
    /// Directory for scratch artifacts
    pub scratch_dir: PathBuf,
    /// Cap on captured stdout and on stderr; a process writing more is killed
    pub max_output_bytes: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            compiler: "g++".to_string(),
            compile_flags: vec!["-std=c++17".to_string(), "-O2".to_string()],
            compile_timeout_secs: 10,
            run_timeout_secs: 5,
            scratch_dir: std::env::temp_dir().join("cocode"),
            max_output_bytes: 64 * 1024,
        }
    }
}

impl CompilerConfig {
    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Keep-alive ping interval in seconds
    pub ping_interval_secs: u64,
    /// Liveness deadline, extended on every inbound frame
    pub read_timeout_secs: u64,
    /// Deadline for a single outbound write
    pub write_timeout_secs: u64,
    /// Outbound queue depth per connection; a full queue evicts the connection
    pub outbound_capacity: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 54,
            read_timeout_secs: 60,
            write_timeout_secs: 10,
            outbound_capacity: 256,
        }
    }
}

impl WebSocketConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Username allowed to kick other users
    pub admin: String,
    pub tokens: Vec<TokenEntry>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin: "admin".to_string(),
            tokens: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub username: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentConfig {
    pub initial_code: String,
    pub initial_compile_log: String,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            initial_code: DEFAULT_INITIAL_CODE.to_string(),
            initial_compile_log: "Waiting for compile...\n".to_string(),
        }
    }
}

impl CollabConfig {
    /// Read and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse and validate config text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if !self.server.ws_path.starts_with('/') {
            return invalid("server.ws_path must start with '/'");
        }
        if self.compiler.compiler.trim().is_empty() {
            return invalid("compiler.compiler must not be empty");
        }
        if self.compiler.compile_timeout_secs == 0 || self.compiler.run_timeout_secs == 0 {
            return invalid("compiler timeouts must be at least one second");
        }
        if self.compiler.max_output_bytes == 0 {
            return invalid("compiler.max_output_bytes must be at least 1");
        }
        if self.websocket.outbound_capacity == 0 {
            return invalid("websocket.outbound_capacity must be at least 1");
        }
        if self.websocket.ping_interval_secs == 0 || self.websocket.read_timeout_secs == 0 {
            return invalid("websocket intervals must be at least one second");
        }
        if self.websocket.ping_interval_secs >= self.websocket.read_timeout_secs {
            return invalid("websocket.ping_interval_secs must be below read_timeout_secs");
        }
        Ok(())
    }
}
