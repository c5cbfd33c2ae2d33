//! `$BEDSIDE_HOME/config.json`
//!
//! Every section is optional, missing fields take their defaults. The file is
//! read once at startup and never reloaded.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bedside_ble::{InvalidMacAddress, MacAddress, PeripheralIdentity, RetryPolicy, SessionConfig};
use bedside_proto::{Codec, DEFAULT_MODEL, DeviceProfile, ProfileError, ProfileTable};

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: String,
    pub bed: BedConfig,
    pub ble: BleConfig,
    pub gpio: GpioConfig,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".to_string(),
            bed: BedConfig::default(),
            ble: BleConfig::default(),
            gpio: GpioConfig::default(),
            log: LogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BedConfig {
    pub address: String,
    /// Local adapter, e.g. `hci0`. Unset picks the first one.
    pub adapter: Option<String>,
    pub model: String,
    /// Extra firmware profiles, merged over the built-in ones
    pub profiles: BTreeMap<String, DeviceProfile>,
}

impl Default for BedConfig {
    fn default() -> Self {
        Self {
            address: "F8:68:CE:13:C3:DF".to_string(),
            adapter: None,
            model: DEFAULT_MODEL.to_string(),
            profiles: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BleConfig {
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub busy_max_attempts: u32,
    pub busy_initial_backoff_ms: u64,
    pub busy_max_backoff_ms: u64,
    /// 0 keeps the connection open forever
    pub idle_disconnect_secs: u64,
    pub preset_step_delay_ms: u64,
    pub confirm_writes: bool,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            io_timeout_ms: 5_000,
            busy_max_attempts: 5,
            busy_initial_backoff_ms: 500,
            busy_max_backoff_ms: 5_000,
            idle_disconnect_secs: 60,
            preset_step_delay_ms: 1_000,
            confirm_writes: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GpioConfig {
    /// BCM pin driving the night light relay, `null` disables `/GPIOlight`
    pub pin: Option<u8>,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self { pin: Some(10) }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive, `RUST_LOG` wins when set
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("config already exists at {0}")]
    Exists(PathBuf),
    #[error("invalid listen address {0:?}")]
    Listen(String),
    #[error(transparent)]
    Address(#[from] InvalidMacAddress),
    #[error(transparent)]
    Profile(#[from] ProfileError),
}

pub fn config_path(home: &str) -> PathBuf {
    Path::new(home).join(CONFIG_FILE)
}

impl Config {
    /// Load `path`, `None` if the file does not exist yet
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Write the defaults to `path`, never over an existing file
    pub fn write_default(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Err(ConfigError::Exists(path.to_path_buf()));
        }
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        let content = serde_json::to_string_pretty(&Self::default())
            .map_err(|e| write_err(std::io::Error::other(e)))?;
        std::fs::write(path, content + "\n").map_err(write_err)
    }

    /// Everything that can be wrong in a syntactically valid file
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;
        self.identity()?;
        self.codec()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|_| ConfigError::Listen(self.listen.clone()))
    }

    pub fn identity(&self) -> Result<PeripheralIdentity, ConfigError> {
        let address: MacAddress = self.bed.address.parse()?;
        Ok(PeripheralIdentity {
            address,
            adapter: self.bed.adapter.clone(),
        })
    }

    pub fn profiles(&self) -> Result<ProfileTable, ConfigError> {
        let mut table = ProfileTable::builtin();
        for (model, profile) in &self.bed.profiles {
            table.insert(model, profile.clone())?;
        }
        Ok(table)
    }

    pub fn codec(&self) -> Result<Codec, ConfigError> {
        let model = &self.bed.model;
        Ok(Codec::new(model, self.profiles()?.resolve(model)?)?)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.ble.io_timeout_ms)
    }

    pub fn session(&self) -> SessionConfig {
        let ble = &self.ble;
        SessionConfig {
            connect_timeout: Duration::from_millis(ble.connect_timeout_ms),
            idle_disconnect: Duration::from_secs(ble.idle_disconnect_secs),
            busy_retry: RetryPolicy {
                max_attempts: ble.busy_max_attempts,
                initial_backoff: Duration::from_millis(ble.busy_initial_backoff_ms),
                max_backoff: Duration::from_millis(ble.busy_max_backoff_ms),
            },
            preset_step_delay: Duration::from_millis(ble.preset_step_delay_ms),
            confirm_writes: ble.confirm_writes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bedside_proto::NativeRange;

    #[test]
    fn defaults_match_the_known_bed() {
        let config = Config::default();
        assert_eq!(config.listen_addr().unwrap().port(), 8000);
        assert_eq!(config.identity().unwrap().address.to_string(), "F8:68:CE:13:C3:DF");
        assert_eq!(config.gpio.pin, Some(10));

        let session = config.session();
        assert_eq!(session.connect_timeout, Duration::from_secs(10));
        assert_eq!(session.busy_retry, RetryPolicy::default());
        assert_eq!(session.preset_step_delay, Duration::from_secs(1));
        assert!(session.confirm_writes);
        assert_eq!(config.codec().unwrap().profile(), &DeviceProfile::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"{
                "bed": {
                    "model": "okin",
                    "profiles": {"okin": {"lift": {"min": 0, "max": 1000}, "vibration": {"min": 0, "max": 10}}}
                },
                "gpio": {"pin": null},
                "ble": {"idle_disconnect_secs": 0}
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap().unwrap();
        assert_eq!(config.listen, "0.0.0.0:8000");
        assert_eq!(config.gpio.pin, None);
        assert!(config.session().idle_disconnect.is_zero());
        assert_eq!(config.ble.io_timeout_ms, 5_000);

        let profile = config.codec().unwrap().profile().clone();
        assert_eq!(profile.lift, NativeRange::new(0, 1000));
        assert_eq!(profile.light_on, 0x64);
    }

    #[test]
    fn unknown_model_is_rejected_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, r#"{"bed": {"model": "nope"}}"#).unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::Profile(ProfileError::UnknownModel(_)))
        ));

        std::fs::write(&path, r#"{"bed": {"address": "F8:68:CE"}}"#).unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Address(_))));

        std::fs::write(&path, r#"{"listen": 8000}"#).unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn missing_file_is_reported_not_logged() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Config::load(&dir.path().join(CONFIG_FILE)).unwrap(), None);
    }

    #[test]
    fn init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().to_string_lossy().to_string();
        let path = config_path(&home);

        Config::write_default(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), Some(Config::default()));
        assert!(matches!(
            Config::write_default(&path),
            Err(ConfigError::Exists(_))
        ));
    }
}
