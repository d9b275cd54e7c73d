//! Configuration Vault – reads/writes `~/.ivcore/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ivcore_hal::{RegistryOptions, SmuType};
use ivcore_runtime::{EngineOptions, MonitorConfig, ServiceOptions};

/// Persisted user configuration stored in `~/.ivcore/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Instrument resource string, e.g. `TCPIP0::192.168.1.50::INSTR`.
    #[serde(default = "default_address")]
    pub smu_address: String,

    /// Driver type tag (`keysight_b2902`, ...) or `auto`.
    #[serde(default = "default_smu_type")]
    pub smu_type: String,

    /// Use simulated drivers instead of talking to hardware.
    #[serde(default)]
    pub mock: bool,

    #[serde(default = "default_channel")]
    pub default_channel: u8,

    #[serde(default = "default_protocols_dir")]
    pub protocols_dir: PathBuf,

    /// Where `data/save` writes when a step names no folder.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_monitor_rate")]
    pub monitor_rate_hz: f64,

    #[serde(default = "default_monitor_capacity")]
    pub monitor_buffer_capacity: usize,

    /// How long an operation waits for the instrument before reporting busy.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,

    /// Abort-flag polling interval for interruptible waits.
    #[serde(default = "default_abort_poll")]
    pub abort_poll_ms: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_address() -> String {
    "MOCK".to_string()
}
fn default_smu_type() -> String {
    "auto".to_string()
}
fn default_channel() -> u8 {
    1
}
fn default_protocols_dir() -> PathBuf {
    PathBuf::from("protocols")
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_monitor_rate() -> f64 {
    10.0
}
fn default_monitor_capacity() -> usize {
    1000
}
fn default_lock_timeout() -> u64 {
    2000
}
fn default_abort_poll() -> u64 {
    50
}
fn default_connect_timeout() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            smu_address: default_address(),
            smu_type: default_smu_type(),
            mock: true,
            default_channel: default_channel(),
            protocols_dir: default_protocols_dir(),
            data_dir: default_data_dir(),
            monitor_rate_hz: default_monitor_rate(),
            monitor_buffer_capacity: default_monitor_capacity(),
            lock_timeout_ms: default_lock_timeout(),
            abort_poll_ms: default_abort_poll(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl Config {
    /// Build the service options this configuration describes.
    ///
    /// # Errors
    ///
    /// Returns a message when `smu_type` is not a known tag.
    pub fn service_options(&self) -> Result<ServiceOptions, String> {
        let smu_type = SmuType::parse_tag(&self.smu_type).map_err(|e| e.to_string())?;
        let defaults = ServiceOptions::default();
        Ok(ServiceOptions {
            registry: RegistryOptions {
                lock_timeout: Duration::from_millis(self.lock_timeout_ms),
                ..defaults.registry
            },
            abort_poll_interval: Duration::from_millis(self.abort_poll_ms.max(1)),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            io_timeout: defaults.io_timeout,
            engine: EngineOptions {
                default_address: self.smu_address.clone(),
                default_smu_type: smu_type,
                default_mock: self.mock,
                data_dir: self.data_dir.clone(),
            },
            protocols_dir: self.protocols_dir.clone(),
        })
    }

    /// Live-monitor settings on the default channel.
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            channel: self.default_channel,
            rate_hz: self.monitor_rate_hz,
            capacity: self.monitor_buffer_capacity,
            ..MonitorConfig::default()
        }
    }
}

/// Return the path to `~/.ivcore/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".ivcore").join("config.toml")
}

/// Load the config from disk with environment overrides applied.  Returns
/// `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

/// The effective configuration: file (or defaults) plus environment.
pub fn effective() -> Result<Config, String> {
    let mut cfg = load_from(&config_path())?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from a specific path, without environment overrides.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `IVCORE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `IVCORE_SMU_ADDRESS` | `smu_address` |
/// | `IVCORE_SMU_TYPE` | `smu_type` |
/// | `IVCORE_MOCK` | `mock` (`true`/`false`/`1`/`0`) |
/// | `IVCORE_PROTOCOLS_DIR` | `protocols_dir` |
/// | `IVCORE_DATA_DIR` | `data_dir` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("IVCORE_SMU_ADDRESS")
        && !v.trim().is_empty()
    {
        cfg.smu_address = v.trim().to_string();
    }
    if let Some(v) = var("IVCORE_SMU_TYPE")
        && SmuType::parse_tag(&v).is_ok()
    {
        cfg.smu_type = v.trim().to_lowercase();
    }
    if let Some(v) = var("IVCORE_MOCK")
        && let Some(mock) = parse_bool(&v)
    {
        cfg.mock = mock;
    }
    if let Some(v) = var("IVCORE_PROTOCOLS_DIR")
        && !v.is_empty()
    {
        cfg.protocols_dir = PathBuf::from(v);
    }
    if let Some(v) = var("IVCORE_DATA_DIR")
        && !v.is_empty()
    {
        cfg.data_dir = PathBuf::from(v);
    }
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Save the config to disk, creating `~/.ivcore/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let mut cfg = Config::default();
        apply_overrides(&mut cfg, |key| vars.get(key).cloned());
        cfg
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .expect("dir metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700, "config directory must have 0o700 permissions");
    }

    #[test]
    fn roundtrip_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let cfg = Config {
            smu_address: "TCPIP0::10.0.0.7::INSTR".into(),
            smu_type: "keysight_b2902".into(),
            mock: false,
            default_channel: 2,
            ..Config::default()
        };
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: Config = toml::from_str("smu_address = \"10.0.0.7:5025\"\n").unwrap();
        assert_eq!(cfg.smu_address, "10.0.0.7:5025");
        assert_eq!(cfg.smu_type, "auto");
        assert!(!cfg.mock);
        assert_eq!(cfg.monitor_buffer_capacity, 1000);
        assert_eq!(cfg.abort_poll_ms, 50);
    }

    #[test]
    fn config_path_points_to_ivcore_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".ivcore"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn load_from_reports_parse_errors() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "mock = \"definitely\"").unwrap();
        assert!(load_from(&path).is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = overrides(&[
            ("IVCORE_SMU_ADDRESS", "TCPIP0::lab-smu::INSTR"),
            ("IVCORE_SMU_TYPE", "KEITHLEY_2400"),
            ("IVCORE_MOCK", "0"),
            ("IVCORE_PROTOCOLS_DIR", "/srv/protocols"),
            ("IVCORE_DATA_DIR", "/srv/data"),
        ]);
        assert_eq!(cfg.smu_address, "TCPIP0::lab-smu::INSTR");
        assert_eq!(cfg.smu_type, "keithley_2400");
        assert!(!cfg.mock);
        assert_eq!(cfg.protocols_dir, PathBuf::from("/srv/protocols"));
        assert_eq!(cfg.data_dir, PathBuf::from("/srv/data"));
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let cfg = overrides(&[
            ("IVCORE_SMU_TYPE", "hp_4145"),
            ("IVCORE_MOCK", "sometimes"),
            ("IVCORE_SMU_ADDRESS", "   "),
        ]);
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn apply_env_overrides_reads_process_env() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("IVCORE_DATA_DIR", "/tmp/ivcore-env-test") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/ivcore-env-test"));
        unsafe { std::env::remove_var("IVCORE_DATA_DIR") };
    }

    #[test]
    fn service_options_follow_config() {
        let cfg = Config {
            smu_type: "keysight_b2901".into(),
            lock_timeout_ms: 750,
            abort_poll_ms: 0,
            ..Config::default()
        };
        let opts = cfg.service_options().unwrap();
        assert_eq!(opts.registry.lock_timeout, Duration::from_millis(750));
        assert_eq!(opts.abort_poll_interval, Duration::from_millis(1));
        assert_eq!(opts.engine.default_smu_type, Some(SmuType::KeysightB2901));
        assert!(opts.engine.default_mock);
        assert_eq!(opts.engine.default_address, "MOCK");

        let bad = Config {
            smu_type: "hp_4145".into(),
            ..Config::default()
        };
        assert!(bad.service_options().is_err());
    }

    #[test]
    fn monitor_config_uses_default_channel() {
        let cfg = Config {
            default_channel: 2,
            monitor_rate_hz: 4.0,
            monitor_buffer_capacity: 64,
            ..Config::default()
        };
        let m = cfg.monitor_config();
        assert_eq!(m.channel, 2);
        assert_eq!(m.rate_hz, 4.0);
        assert_eq!(m.capacity, 64);
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" off "), Some(false));
        assert_eq!(parse_bool("2"), None);
    }
}
