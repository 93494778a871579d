use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use tern::toolkit::remote::ServerConfig;

pub const PROFILE_CONFIG_PATH: &str = ".config/tern/profile.yaml";

/// On-disk profile: provider settings plus the remote tool servers to bring
/// up for a run.
#[derive(Debug, Default, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderSettings {
    pub host: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
}

/// Load the profile from the given path, or from the default location when
/// none is given. A missing default profile is not an error: the run simply
/// starts without remote tool servers.
pub fn load_profile(path: Option<&Path>) -> Result<Profile> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let Some(default) = default_profile_path() else {
                return Ok(Profile::default());
            };
            if !default.exists() {
                return Ok(Profile::default());
            }
            default
        }
    };

    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read profile {}", path.display()))?;
    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse profile {}", path.display()))
}

pub fn default_profile_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(PROFILE_CONFIG_PATH))
}
