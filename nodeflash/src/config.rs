use crate::Result;
use directories_next::ProjectDirs;
use serde::Deserialize;
use std::fs::read;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub connection: Connection,
    #[serde(default)]
    pub flash: Flash,
}

#[derive(Debug, Deserialize, Default, PartialEq)]
pub struct Connection {
    pub serial: Option<String>,
    pub baud: Option<usize>,
}

#[derive(Debug, Deserialize, Default, PartialEq)]
pub struct Flash {
    /// Flash size such as "4M", "512K" or "0x400000".
    pub size: Option<String>,
}

impl Config {
    pub fn path() -> Option<PathBuf> {
        ProjectDirs::from("rs", "", "nodeflash").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Loads the user configuration, falling back to defaults when there is
    /// none or it can not be parsed.
    pub fn load() -> Self {
        let path = match Self::path() {
            Some(path) => path,
            None => return Self::default(),
        };
        match read(&path) {
            Ok(data) => Self::from_slice(&data).unwrap_or_else(|e| {
                log::warn!("Ignoring {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        Ok(toml::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_keys() {
        let config = Config::from_slice(
            br#"
            [connection]
            serial = "/dev/ttyUSB0"
            baud = 460800

            [flash]
            size = "4M"
            "#,
        )
        .unwrap();
        assert_eq!(config.connection.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.connection.baud, Some(460800));
        assert_eq!(config.flash.size.as_deref(), Some("4M"));
    }

    #[test]
    fn missing_tables_default() {
        assert_eq!(Config::from_slice(b"").unwrap(), Config::default());
        assert!(Config::from_slice(b"[connection]\nbaud = \"fast\"").is_err());
    }
}
