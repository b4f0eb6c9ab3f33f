// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Data structures and helper methods around influencing the configuration
//! of the server.

use ini::Ini;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 57890;

/// Options that can come from the command line or from a config file, with
/// the command line taking precedence.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub port: Option<u16>,
    pub log_to_file: Option<bool>,
}

impl AppConfig {
    pub fn from_config_file(config_file: &Path) -> Option<Self> {
        if config_file.exists() {
            let conf = Ini::load_from_file(config_file)
                .expect("Could not access config file, even though it exists");
            let general_section = conf.general_section();
            Some(Self {
                port: general_section.get("port").map(|p| {
                    p.parse()
                        .expect("Failed to parse config parameter `port` as a port number")
                }),
                log_to_file: general_section.get("log").map(|p| {
                    p.parse()
                        .expect("Failed to parse config parameter `log` as bool")
                }),
            })
        } else {
            None
        }
    }

    #[must_use]
    pub fn merge(self, other: Option<Self>) -> Self {
        let other = other.unwrap_or_default();
        Self {
            port: self.port.or(other.port),
            log_to_file: self.log_to_file.or(other.log_to_file),
        }
    }
}

/// Everything the server needs to run, fully resolved.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub log_to_file: bool,
    /// The `logs/` directory is created below this.
    pub root_dir: PathBuf,
    /// Hex digest of the session password; peers authenticate by sending
    /// the same digest.
    pub secret_digest: String,
}

impl Settings {
    #[must_use]
    pub fn digest(password: &str) -> String {
        hex::encode(Sha256::digest(password.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use temp_dir::TempDir;

    #[test]
    fn config_file_fills_in_missing_options() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let config_file = dir.path().join("config");
        std::fs::write(&config_file, "port=4000\nlog=true\n").unwrap();

        let from_file = AppConfig::from_config_file(&config_file);
        let merged = AppConfig {
            port: Some(5000),
            log_to_file: None,
        }
        .merge(from_file);

        assert_eq!(merged.port, Some(5000));
        assert_eq!(merged.log_to_file, Some(true));
    }

    #[test]
    fn missing_config_file_is_fine() {
        assert!(AppConfig::from_config_file(Path::new("/nonexistent/config")).is_none());
    }

    #[test]
    fn password_digests_are_stable_hex() {
        let digest = Settings::digest("sesame");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, Settings::digest("sesame"));
        assert_ne!(digest, Settings::digest(""));
    }
}
