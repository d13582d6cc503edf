//! YAML controller configuration for the daemon front-end.

#[cfg(test)]
pub mod config_test;

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bluetooth::l2cap::BdAddr;
use crate::constants::DEFAULT_FREQUENCY;
use crate::controller::ControllerKind;
use crate::manager::CreateController;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {err}")]
    Read { path: String, err: std::io::Error },
    #[error("failed to parse {path}: {err}")]
    Parse {
        path: String,
        err: serde_yaml::Error,
    },
    #[error("invalid colour {0:?} (expected 6 hex digits, e.g. \"828282\")")]
    InvalidColour(String),
    #[error(transparent)]
    InvalidAddress(#[from] crate::bluetooth::l2cap::AddrParseError),
}

/// Top-level daemon configuration: the set of controllers to bring up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    pub controllers: Vec<ControllerConfig>,
}

/// One controller definition.
///
/// ```yaml
/// controllers:
///   - kind: pro_controller
///     colour_body: "32A852"
///     colour_buttons: "0F0F0F"
///     frequency: 120
///     reconnect:
///       - "DC:68:EB:10:20:30"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    pub kind: ControllerKind,
    /// D-Bus adapter path; first free adapter when omitted
    #[serde(default)]
    pub adapter: Option<String>,
    #[serde(default)]
    pub colour_body: Option<String>,
    #[serde(default)]
    pub colour_buttons: Option<String>,
    #[serde(default = "default_frequency")]
    pub frequency: u32,
    /// Switch addresses to reconnect to before advertising
    #[serde(default)]
    pub reconnect: Vec<String>,
}

fn default_frequency() -> u32 {
    DEFAULT_FREQUENCY
}

impl ControllerConfig {
    /// Validates the config entry into controller-creation parameters.
    pub fn to_request(&self) -> Result<CreateController, ConfigError> {
        let mut request = CreateController::new(self.kind);
        request.adapter_path = self.adapter.clone();
        request.colour_body = self
            .colour_body
            .as_deref()
            .map(parse_colour)
            .transpose()?;
        request.colour_buttons = self
            .colour_buttons
            .as_deref()
            .map(parse_colour)
            .transpose()?;
        request.frequency = self.frequency;
        request.reconnect = self
            .reconnect
            .iter()
            .map(|address| address.parse::<BdAddr>())
            .collect::<Result<_, _>>()?;
        Ok(request)
    }
}

/// Loads a [DaemonConfig] from a YAML file.
pub fn load(path: &Path) -> Result<DaemonConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|err| ConfigError::Read {
        path: path.display().to_string(),
        err,
    })?;
    serde_yaml::from_str(&text).map_err(|err| ConfigError::Parse {
        path: path.display().to_string(),
        err,
    })
}

/// Parses a 6-hex-digit colour like "828282" into its three bytes.
pub fn parse_colour(hex: &str) -> Result<[u8; 3], ConfigError> {
    let hex = hex.trim_start_matches('#');
    if hex.len() != 6 {
        return Err(ConfigError::InvalidColour(hex.to_string()));
    }
    let mut colour = [0u8; 3];
    for (i, chunk) in colour.iter_mut().enumerate() {
        *chunk = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| ConfigError::InvalidColour(hex.to_string()))?;
    }
    Ok(colour)
}
