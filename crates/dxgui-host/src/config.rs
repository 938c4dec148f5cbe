use anyhow::{Context, Result};
use dxgui_window::GuiConfig;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Manifest {
    #[serde(default)]
    pub app: App,
    #[serde(default)]
    pub gui: GuiConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct App {
    pub name: String,
}

impl Default for App {
    fn default() -> Self {
        Self {
            name: "dxgui".to_string(),
        }
    }
}

impl Manifest {
    /// Read the manifest at `path`. A missing file means every default.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No manifest at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading manifest at {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing manifest at {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}
