//! Global settings for `chain_dict`.
//! These only tune diagnostics; they never change what a lookup resolves to.
use std::collections::HashMap;

use camino::Utf8PathBuf;
use config::{Config, Environment, File};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::Result;

/// Lookups that walk more layers than this get a warning, unless overridden
pub const DEFAULT_DEEP_CHAIN_WARNING: usize = 10_000;

const DEEP_CHAIN_WARNING: &str = "deep_chain_warning";

/// Global config variable for `Settings`
pub static CHAIN_DICT_CONFIG: OnceCell<Settings> = OnceCell::new();

/// Global path variable for the configuration file
pub static CHAIN_DICT_CONFIG_FILE: OnceCell<Utf8PathBuf> = OnceCell::new();

/// Gets the `CHAIN_DICT_CONFIG` settings. If uninitialized, sets the global
/// variable in the following order (greatest to least precedence):
/// - `settings` map if provided, e.g. with key ("deep_chain_warning", "500")
/// - Env var per setting, e.g. `CHAIN_DICT_DEEP_CHAIN_WARNING`
/// - Config file (see `chain_dict_config_file()`), e.g. in TOML:
///   ```toml
///   deep_chain_warning = 500
///   ```
/// - Default values
///
/// A settings source that fails to load is logged and the defaults are used.
pub fn chain_dict_config(
    file: Option<&Utf8PathBuf>,
    settings: Option<&HashMap<&str, String>>,
) -> &'static Settings {
    CHAIN_DICT_CONFIG.get_or_init(|| {
        Settings::from_config(chain_dict_config_file(file), settings).unwrap_or_else(|e| {
            warn!("falling back to default settings: {e}");
            Settings::default()
        })
    })
}

/// The `deep_chain_warning` threshold of the settings loaded so far, or
/// `DEFAULT_DEEP_CHAIN_WARNING` if `chain_dict_config` was never called.
/// Never loads settings itself, so lookups stay free of env and file reads.
pub fn deep_chain_warning() -> usize {
    CHAIN_DICT_CONFIG
        .get()
        .map_or(DEFAULT_DEEP_CHAIN_WARNING, |s| s.deep_chain_warning)
}

/// Gets the `CHAIN_DICT_CONFIG_FILE` path. If uninitialized, sets the global
/// variable in the following order (greatest to least precedence):
/// - `config_file` parameter if provided
/// - `CHAIN_DICT_CONFIG_FILE` env var
/// - `chain-dict.toml` in the current directory
pub fn chain_dict_config_file(config_file: Option<&Utf8PathBuf>) -> &'static Utf8PathBuf {
    CHAIN_DICT_CONFIG_FILE.get_or_init(|| {
        if let Some(file) = config_file {
            file.clone()
        } else if let Ok(file) = std::env::var("CHAIN_DICT_CONFIG_FILE") {
            Utf8PathBuf::from(file)
        } else {
            Utf8PathBuf::from("chain-dict.toml")
        }
    })
}

/// Contains the `chain_dict` settings
#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Number of layers a single lookup may walk before a warning is logged.
    /// `0` turns the warning off.
    pub deep_chain_warning: usize,
}

impl Settings {
    /// Loads settings from a file, env vars and explicit overrides.
    /// The file is optional; a missing one is not an error.
    pub fn from_config(
        config_file: &Utf8PathBuf,
        settings: Option<&HashMap<&str, String>>,
    ) -> Result<Self> {
        // Sources are read first to last, in order of increasing precedence.
        let loaded: Settings = Config::builder()
            .set_default(DEEP_CHAIN_WARNING, DEFAULT_DEEP_CHAIN_WARNING as u64)?
            .add_source(File::with_name(config_file.as_str()).required(false))
            .add_source(Environment::with_prefix("CHAIN_DICT").try_parsing(true))
            .set_override_option(
                DEEP_CHAIN_WARNING,
                settings.and_then(|s| s.get(DEEP_CHAIN_WARNING).cloned()),
            )?
            .build()?
            .try_deserialize()?;
        debug!(settings = ?loaded, %config_file, "loaded settings");
        Ok(loaded)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            deep_chain_warning: DEFAULT_DEEP_CHAIN_WARNING,
        }
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8Path;
    use std::io::prelude::*;
    use std::{collections::HashMap, fs::File};
    use tempfile::Builder;

    use super::{Settings, DEFAULT_DEEP_CHAIN_WARNING};

    // Doesn't test `OnceCell` behavior as the tests share memory, nor env vars
    // as they can leak into other tests running in parallel
    #[test]
    fn test_config_file() {
        let tmp_dir = Builder::new().prefix("tmp").tempdir().unwrap();
        let tmp_dir = Utf8Path::from_path(tmp_dir.path()).unwrap();
        let config_path = tmp_dir.join("chain-dict.toml");

        let mut config_file = File::create(config_path.clone()).unwrap();
        config_file
            .write_all("deep_chain_warning = 64\n".as_bytes())
            .unwrap();

        let config = Settings::from_config(&config_path, None).unwrap();
        assert_eq!(config.deep_chain_warning, 64);
    }

    #[test]
    fn test_config_missing_file() {
        let tmp_dir = Builder::new().prefix("tmp").tempdir().unwrap();
        let tmp_dir = Utf8Path::from_path(tmp_dir.path()).unwrap();
        let config_path = tmp_dir.join("absent.toml");

        let config = Settings::from_config(&config_path, None).unwrap();
        assert_eq!(config, Settings::default());
        assert_eq!(config.deep_chain_warning, DEFAULT_DEEP_CHAIN_WARNING);
    }

    #[test]
    fn test_config_override() {
        let tmp_dir = Builder::new().prefix("tmp").tempdir().unwrap();
        let tmp_dir = Utf8Path::from_path(tmp_dir.path()).unwrap();
        let config_path = tmp_dir.join("chain-dict.toml");

        let mut config_file = File::create(config_path.clone()).unwrap();
        config_file
            .write_all("deep_chain_warning = 64\n".as_bytes())
            .unwrap();

        let mut overrides = HashMap::new();
        overrides.insert("deep_chain_warning", "0".to_string());

        let config = Settings::from_config(&config_path, Some(&overrides)).unwrap();
        assert_eq!(config.deep_chain_warning, 0);
    }

    #[test]
    fn test_config_rejects_garbage() {
        let tmp_dir = Builder::new().prefix("tmp").tempdir().unwrap();
        let tmp_dir = Utf8Path::from_path(tmp_dir.path()).unwrap();
        let config_path = tmp_dir.join("chain-dict.toml");

        let mut config_file = File::create(config_path.clone()).unwrap();
        config_file
            .write_all("deep_chain_warning = \"lots\"\n".as_bytes())
            .unwrap();

        assert!(Settings::from_config(&config_path, None).is_err())
    }
}
