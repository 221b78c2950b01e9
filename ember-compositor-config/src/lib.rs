// SPDX-License-Identifier: MPL-2.0-only

//! Config for ember-compositor

use std::fs::File;

use serde::{Deserialize, Serialize};
use tracing::warn;
use xdg::BaseDirectories;

static CONFIG_PATH: &str = "ember-compositor/config.ron";

/// XKB keymap names; empty strings select the system defaults.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct XkbConfig {
    pub rules: String,
    pub model: String,
    pub layout: String,
    pub variant: String,
    pub options: String,
}

/// Host configuration for the compositor core.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CompositorConfig {
    /// Seat whose devices the compositor drives.
    pub seat: String,
    /// VT to acquire at startup; 0 asks the kernel for a free one.
    pub vt: u16,
    /// Keymap names handed to the XKB compiler.
    pub xkb: XkbConfig,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            seat: "seat0".to_string(),
            vt: 2,
            xkb: XkbConfig::default(),
        }
    }
}

impl CompositorConfig {
    /// Load the config from the XDG config directories, falling back to the
    /// defaults when no file exists.
    pub fn load() -> anyhow::Result<Self> {
        let path = match BaseDirectories::new()?.find_config_file(CONFIG_PATH) {
            Some(path) => path,
            None => {
                warn!("no config file found, using defaults");
                return Ok(Self::default());
            }
        };
        let file = File::open(&path)?;
        Ok(ron::de::from_reader(file)?)
    }

    /// Write the config to the XDG config directory.
    pub fn write(&self) -> anyhow::Result<()> {
        let path = BaseDirectories::new()?.place_config_file(CONFIG_PATH)?;
        let file = File::create(path)?;
        ron::ser::to_writer_pretty(&file, self, ron::ser::PrettyConfig::default())?;
        Ok(())
    }
}
