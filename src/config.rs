use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};
use confique::Config as _;
use secrecy::ExposeSecret;

use crate::prelude::*;


/// The locations where notes-api will look for a configuration file. The
/// first existing file in this list is used.
const DEFAULT_PATHS: &[&str] = &["config.toml", "/etc/notes-api/config.toml"];

const CONFIG_PATH_ENV: &str = "NOTES_API_CONFIG_PATH";

/// Configuration for notes-api.
///
/// All relative paths are relative to the location of this configuration file.
#[derive(Debug, confique::Config)]
pub(crate) struct Config {
    #[config(nested)]
    pub(crate) db: crate::db::DbConfig,

    #[config(nested)]
    pub(crate) http: crate::http::HttpConfig,

    #[config(nested)]
    pub(crate) log: crate::logger::LogConfig,
}

/// Problems with the configuration that are reported all at once.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ConfigError {
    #[error("missing required configuration values: {}", .0.join(", "))]
    MissingKeys(Vec<&'static str>),
}


impl Config {
    /// Tries to find a config file by checking `NOTES_API_CONFIG_PATH` and
    /// the list of default locations. The first config file is loaded via
    /// [`Self::load_from`]. Returns the loaded config and the path that it
    /// was loaded from.
    pub(crate) fn from_env_or_default_locations() -> Result<(Self, PathBuf)> {
        let path = if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
            PathBuf::from(path)
        } else {
            DEFAULT_PATHS.iter()
                .map(PathBuf::from)
                .find(|p| p.exists())
                .ok_or(anyhow!(
                    "no configuration file found. Note: we checked the following paths: {}",
                    DEFAULT_PATHS.join(", "),
                ))?
        };

        let config = Self::load_from(&path)
            .context(format!("failed to load configuration from '{}'", path.display()))?;

        Ok((config, path))
    }

    /// Loads the configuration from a specific TOML file and validates it.
    pub(crate) fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Config::from_file(path)
            .context(format!("failed to read config file '{}'", path.display()))?;

        config.validate().context("invalid configuration")?;
        config.fix_paths(path)?;

        Ok(config)
    }

    /// Checks that all required values are present, reporting all missing
    /// ones together, and checks the values of the individual sections.
    pub(crate) fn validate(&self) -> Result<()> {
        debug!("Validating configuration...");

        let mut missing = Vec::new();
        if self.db.url.as_ref().map_or(true, |url| url.expose_secret().trim().is_empty()) {
            missing.push("db.url");
        }
        if self.http.cors.allowed_origins.as_ref().map_or(true, |origins| origins.is_empty()) {
            missing.push("http.cors.allowed_origins");
        }
        if !missing.is_empty() {
            return Err(ConfigError::MissingKeys(missing).into());
        }

        self.db.validate()?;
        self.http.validate()?;

        Ok(())
    }

    /// Goes through all paths in the configuration and changes relative paths
    /// to be absolute based on the path of the configuration file itself.
    fn fix_paths(&mut self, config_path: &Path) -> Result<()> {
        fn fix_path(base_path: &Path, path: &mut PathBuf) {
            if path.is_relative() {
                *path = base_path.join(&path);
            }
        }

        let absolute_config_path = config_path.canonicalize()
            .context("failed to canonicalize config path")?;
        let base = absolute_config_path.parent()
            .ok_or_else(|| anyhow!("config file path has no parent"))?;

        if let Some(p) = &mut self.http.unix_socket {
            fix_path(base, p);
        }
        if let Some(p) = &mut self.log.file {
            fix_path(base, p);
        }
        if let Some(p) = &mut self.db.server_cert {
            fix_path(base, p);
        }

        Ok(())
    }
}

/// Writes the generated TOML config template file to the given destination or
/// stdout.
pub(crate) fn write_template(path: Option<&PathBuf>) -> Result<()> {
    use confique::toml::FormatOptions;

    info!(
        "Writing configuration template to '{}'",
        path.map(|p| p.display().to_string()).unwrap_or("<stdout>".into()),
    );

    let template = confique::toml::template::<Config>(FormatOptions::default());
    match path {
        Some(path) => fs::write(path, template)?,
        None => io::stdout().write_all(template.as_bytes())?,
    }

    Ok(())
}
