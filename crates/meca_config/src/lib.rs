use std::{
    collections::BTreeSet as Set,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use indexmap::IndexSet;
use meca_consts::consts;
use miette::{IntoDiagnostic, miette};
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("no file was found at {0}")]
    FileNotFound(PathBuf),
    #[error("failed to read config from '{0}'")]
    ReadError(std::io::Error),
    #[error("failed to parse config of {1}: {0}")]
    ParseError(miette::Report, PathBuf),
    #[error("validation error of {1}: {0}")]
    ValidationError(miette::Report, PathBuf),
}

/// Configuration consumed by the MECA repo and content providers.
///
/// Every field is optional so that configuration files can be layered on top
/// of each other, use the accessor methods to get the effective values.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Hostnames a bundle URL may point at. An empty set allows any origin.
    #[serde(default)]
    #[serde(skip_serializing_if = "IndexSet::is_empty")]
    pub allowed_origins: IndexSet<String>,

    /// Verify every entry of a downloaded bundle instead of only its central
    /// directory.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validate_bundle: Option<bool>,

    /// Seconds to wait for the reachability probe.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_timeout: Option<u64>,

    /// Seconds a single read of the bundle download may stall.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_timeout: Option<u64>,

    /// If set to true, the TLS certificate of the server is not verified.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_no_verify: Option<bool>,

    /// Directory in which the temporary working directories are created.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,

    #[serde(skip)]
    pub loaded_from: Vec<PathBuf>,
}

impl Config {
    /// Parse the given toml string and return the config and the keys that
    /// were not recognized.
    pub fn from_toml(
        toml: &str,
        source_path: Option<&Path>,
    ) -> miette::Result<(Config, Set<String>)> {
        let de = toml_edit::de::Deserializer::from_str(toml).into_diagnostic()?;

        let mut unused_keys = Set::new();
        let mut config: Config = serde_ignored::deserialize(de, |path| {
            unused_keys.insert(path.to_string());
        })
        .into_diagnostic()?;

        if let Some(path) = source_path {
            config.loaded_from.push(path.to_path_buf());
        }

        Ok((config, unused_keys))
    }

    /// Load the config from the given path.
    pub fn from_path(path: &Path) -> Result<Config, ConfigError> {
        tracing::debug!("Loading config from {}", path.display());
        let s = match fs_err::read_to_string(path) {
            Ok(content) => content,
            Err(e)
                if e.kind() == std::io::ErrorKind::NotFound
                    || e.kind() == std::io::ErrorKind::NotADirectory =>
            {
                return Err(ConfigError::FileNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(ConfigError::ReadError(e)),
        };

        let (config, unused_keys) = Config::from_toml(&s, Some(path))
            .map_err(|e| ConfigError::ParseError(e, path.to_path_buf()))?;

        if !unused_keys.is_empty() {
            tracing::warn!(
                "Ignoring '{}' in {}",
                console::style(
                    unused_keys
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
                .yellow(),
                path.display()
            );
        }

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e, path.to_path_buf()))?;

        Ok(config)
    }

    /// Load the system config, then the user config, then the file named by
    /// the `MECA_CONFIG` environment variable. Later files take precedence.
    pub fn load_global() -> Config {
        let mut config = Config::default();

        for p in std::iter::once(config_path_system()).chain(config_path_global()) {
            match Self::from_path(&p) {
                Ok(c) => config = config.merge_config(c),
                Err(ConfigError::FileNotFound(_)) => (),
                Err(e) => tracing::error!(
                    "Failed to load global config '{}' with error: {}",
                    p.display(),
                    e
                ),
            }
        }

        config
    }

    /// Checks that the values in this config make sense.
    pub fn validate(&self) -> miette::Result<()> {
        for origin in &self.allowed_origins {
            if origin.is_empty() {
                return Err(miette!("`allowed-origins` must not contain empty hostnames"));
            }
            if origin.contains(['/', ':', '@']) {
                return Err(miette!("`allowed-origins` must list bare hostnames, not '{origin}'"));
            }
            if origin.chars().any(|c| c.is_ascii_uppercase()) {
                return Err(miette!("`allowed-origins` must be lowercase, not '{origin}'"));
            }
        }

        if self.probe_timeout == Some(0) {
            return Err(miette!("`probe-timeout` must be at least one second"));
        }
        if self.download_timeout == Some(0) {
            return Err(miette!("`download-timeout` must be at least one second"));
        }

        Ok(())
    }

    /// Merge the given config into the current one, values of `other` take
    /// precedence.
    #[must_use]
    pub fn merge_config(self, other: Config) -> Self {
        let mut loaded_from = self.loaded_from;
        loaded_from.extend(other.loaded_from);

        Self {
            allowed_origins: if other.allowed_origins.is_empty() {
                self.allowed_origins
            } else {
                other.allowed_origins
            },
            validate_bundle: other.validate_bundle.or(self.validate_bundle),
            probe_timeout: other.probe_timeout.or(self.probe_timeout),
            download_timeout: other.download_timeout.or(self.download_timeout),
            tls_no_verify: other.tls_no_verify.or(self.tls_no_verify),
            temp_dir: other.temp_dir.or(self.temp_dir),
            loaded_from,
        }
    }

    /// Restrict bundle URLs to the given hostnames.
    #[must_use]
    pub fn with_allowed_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    pub fn allowed_origins(&self) -> &IndexSet<String> {
        &self.allowed_origins
    }

    /// Whether bundles are verified entry by entry, defaults to `true`.
    pub fn validate_bundle(&self) -> bool {
        self.validate_bundle.unwrap_or(true)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(
            self.probe_timeout
                .unwrap_or(consts::DEFAULT_PROBE_TIMEOUT_SECS),
        )
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(
            self.download_timeout
                .unwrap_or(consts::DEFAULT_DOWNLOAD_TIMEOUT_SECS),
        )
    }

    pub fn tls_no_verify(&self) -> bool {
        self.tls_no_verify.unwrap_or(false)
    }

    /// The directory temporary working directories are created in, `None`
    /// means the system default.
    pub fn temp_dir(&self) -> Option<&Path> {
        self.temp_dir.as_deref()
    }
}

/// Returns the path to the system-level config file.
pub fn config_path_system() -> PathBuf {
    #[cfg(target_os = "windows")]
    let base_path = PathBuf::from("C:\\ProgramData");
    #[cfg(not(target_os = "windows"))]
    let base_path = PathBuf::from("/etc");

    base_path.join(consts::CONFIG_DIR).join(consts::CONFIG_FILE)
}

/// Returns the path(s) to the user-level config files, in order of increasing
/// precedence.
pub fn config_path_global() -> Vec<PathBuf> {
    vec![
        dirs::config_dir().map(|d| d.join(consts::CONFIG_DIR).join(consts::CONFIG_FILE)),
        std::env::var_os(consts::CONFIG_ENV_VAR).map(PathBuf::from),
    ]
    .into_iter()
    .flatten()
    .collect()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_config_parse() {
        let toml = r#"allowed-origins = ["journals.curvenote.com", "journal.agu.com"]
validate-bundle = false
probe-timeout = 3
download-timeout = 60
tls-no-verify = true
temp-dir = "/var/tmp"
UNUSED = "unused"
        "#;
        let (config, unused) = Config::from_toml(toml, None).unwrap();
        assert_eq!(
            config.allowed_origins().iter().collect::<Vec<_>>(),
            vec!["journals.curvenote.com", "journal.agu.com"]
        );
        assert!(!config.validate_bundle());
        assert_eq!(config.probe_timeout(), Duration::from_secs(3));
        assert_eq!(config.download_timeout(), Duration::from_secs(60));
        assert!(config.tls_no_verify());
        assert_eq!(config.temp_dir(), Some(Path::new("/var/tmp")));
        assert!(unused.contains("UNUSED"));
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.allowed_origins().is_empty());
        assert!(config.validate_bundle());
        assert_eq!(
            config.probe_timeout(),
            Duration::from_secs(consts::DEFAULT_PROBE_TIMEOUT_SECS)
        );
        assert_eq!(
            config.download_timeout(),
            Duration::from_secs(consts::DEFAULT_DOWNLOAD_TIMEOUT_SECS)
        );
        assert!(!config.tls_no_verify());
        assert_eq!(config.temp_dir(), None);
    }

    #[test]
    fn test_merge() {
        let base = Config::default()
            .with_allowed_origins(["journals.curvenote.com"])
            .merge_config(Config {
                probe_timeout: Some(2),
                ..Config::default()
            });
        assert_eq!(base.allowed_origins().len(), 1);
        assert_eq!(base.probe_timeout(), Duration::from_secs(2));

        let merged = base.merge_config(Config {
            validate_bundle: Some(false),
            probe_timeout: Some(7),
            ..Config::default().with_allowed_origins(["journal.agu.com"])
        });
        assert_eq!(
            merged.allowed_origins().iter().collect::<Vec<_>>(),
            vec!["journal.agu.com"]
        );
        assert!(!merged.validate_bundle());
        assert_eq!(merged.probe_timeout(), Duration::from_secs(7));
    }

    #[rstest]
    #[case::scheme("https://journals.curvenote.com")]
    #[case::path("journals.curvenote.com/agu")]
    #[case::port("journals.curvenote.com:443")]
    #[case::uppercase("Journals.Curvenote.com")]
    #[case::empty("")]
    fn test_invalid_origins(#[case] origin: &str) {
        let config = Config::default().with_allowed_origins([origin]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_is_invalid() {
        let (config, _) = Config::from_toml("probe-timeout = 0", None).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(consts::CONFIG_FILE);
        fs_err::write(&path, "allowed-origins = [\"journal.agu.com\"]\n").unwrap();

        let config = Config::from_path(&path).unwrap();
        assert!(config.allowed_origins().contains("journal.agu.com"));
        assert_eq!(config.loaded_from, vec![path.clone()]);

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            Config::from_path(&missing),
            Err(ConfigError::FileNotFound(p)) if p == missing
        ));

        fs_err::write(&path, "allowed-origins = \"not-a-list\"").unwrap();
        assert!(matches!(
            Config::from_path(&path),
            Err(ConfigError::ParseError(_, _))
        ));

        fs_err::write(&path, "allowed-origins = [\"https://journal.agu.com\"]").unwrap();
        assert!(matches!(
            Config::from_path(&path),
            Err(ConfigError::ValidationError(_, _))
        ));
    }

    #[test]
    fn test_load_global_reads_env_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meca.toml");
        fs_err::write(&path, "validate-bundle = false\nprobe-timeout = 4\n").unwrap();

        temp_env::with_var(consts::CONFIG_ENV_VAR, Some(&path), || {
            let config = Config::load_global();
            assert!(!config.validate_bundle());
            assert_eq!(config.probe_timeout(), Duration::from_secs(4));
            assert!(config.loaded_from.contains(&path));
        });
    }
}
