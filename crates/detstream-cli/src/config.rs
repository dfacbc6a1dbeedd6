//! Configuration vault – reads/writes `~/.detstream/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use detstream_hal::SimConfig;
use detstream_middleware::MonitorPolicy;
use detstream_runtime::{PollerConfig, StreamerConfig};

/// Where the data stream and the monitor socket live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// In-process bus; nothing leaves the CLI.
    #[default]
    Inproc,
    /// ZeroMQ PUB (data) and REP (monitor) sockets on TCP.
    Zmq,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Inproc => write!(f, "inproc"),
            Transport::Zmq => write!(f, "zmq"),
        }
    }
}

impl std::str::FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inproc" => Ok(Transport::Inproc),
            "zmq" => Ok(Transport::Zmq),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

/// Simulated detector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimSection {
    #[serde(default = "default_channels")]
    pub channels: usize,
    #[serde(default = "default_bins")]
    pub bins: usize,
    /// Capacity of the circular buffer in frames.
    #[serde(default = "default_buffer_frames")]
    pub buffer_frames: u64,
    /// Default frame time for `/start` when none is given.
    #[serde(default = "default_exposure_s")]
    pub exposure_s: f64,
}

impl Default for SimSection {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            bins: default_bins(),
            buffer_frames: default_buffer_frames(),
            exposure_s: default_exposure_s(),
        }
    }
}

/// Persisted configuration stored in `~/.detstream/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub transport: Transport,

    /// TCP port of the PUB data socket (zmq transport only).
    #[serde(default = "default_data_port")]
    pub data_port: u16,

    /// TCP port of the REP monitor socket (zmq transport only).
    #[serde(default = "default_monitor_port")]
    pub monitor_port: u16,

    /// Send high-water mark of the data socket, in messages.
    #[serde(default = "default_send_hwm")]
    pub send_hwm: i32,

    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,

    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Answer monitor requests only with frames newer than the request.
    #[serde(default)]
    pub monitor_fresh_only: bool,

    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,

    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,

    #[serde(default)]
    pub sim: SimSection,
}

fn default_data_port() -> u16 {
    9999
}
fn default_monitor_port() -> u16 {
    9998
}
fn default_send_hwm() -> i32 {
    50_000
}
fn default_idle_sleep_ms() -> u64 {
    1
}
fn default_progress_interval_ms() -> u64 {
    1000
}
fn default_command_capacity() -> usize {
    16
}
fn default_stall_timeout_ms() -> u64 {
    2000
}
fn default_channels() -> usize {
    4
}
fn default_bins() -> usize {
    4096
}
fn default_buffer_frames() -> u64 {
    16_384
}
fn default_exposure_s() -> f64 {
    0.1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: Transport::default(),
            data_port: default_data_port(),
            monitor_port: default_monitor_port(),
            send_hwm: default_send_hwm(),
            idle_sleep_ms: default_idle_sleep_ms(),
            progress_interval_ms: default_progress_interval_ms(),
            monitor_fresh_only: false,
            command_capacity: default_command_capacity(),
            stall_timeout_ms: default_stall_timeout_ms(),
            sim: SimSection::default(),
        }
    }
}

impl Config {
    pub fn streamer_config(&self) -> StreamerConfig {
        StreamerConfig {
            poller: PollerConfig {
                idle_sleep: Duration::from_millis(self.idle_sleep_ms),
                progress_interval: Duration::from_millis(self.progress_interval_ms),
                monitor_policy: if self.monitor_fresh_only {
                    MonitorPolicy::FreshOnly
                } else {
                    MonitorPolicy::Latest
                },
            },
            command_capacity: self.command_capacity,
            stall_timeout: Duration::from_millis(self.stall_timeout_ms),
        }
    }

    pub fn sim_config(&self) -> SimConfig {
        SimConfig {
            channels: self.sim.channels,
            bins: self.sim.bins,
            buffer_frames: self.sim.buffer_frames,
            exposure_s: self.sim.exposure_s,
            ..SimConfig::default()
        }
    }
}

/// Return the path to `~/.detstream/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".detstream").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &PathBuf) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `DETSTREAM_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `DETSTREAM_TRANSPORT` | `transport` (`inproc` or `zmq`) |
/// | `DETSTREAM_DATA_PORT` | `data_port` |
/// | `DETSTREAM_MONITOR_PORT` | `monitor_port` |
/// | `DETSTREAM_IDLE_SLEEP_MS` | `idle_sleep_ms` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("DETSTREAM_TRANSPORT")
        && let Ok(transport) = v.parse::<Transport>()
    {
        cfg.transport = transport;
    }
    if let Ok(v) = std::env::var("DETSTREAM_DATA_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.data_port = port;
    }
    if let Ok(v) = std::env::var("DETSTREAM_MONITOR_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.monitor_port = port;
    }
    if let Ok(v) = std::env::var("DETSTREAM_IDLE_SLEEP_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.idle_sleep_ms = ms;
    }
}

/// Save the config to disk, creating `~/.detstream/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &PathBuf) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
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
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");
        let loaded = load_from(&path).expect("load ok").expect("some");
        // Transport and data port are left out: env-override tests may run
        // concurrently.
        assert_eq!(loaded.monitor_port, 9998);
        assert_eq!(loaded.send_hwm, 50_000);
        assert_eq!(loaded.sim, SimSection::default());
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("meta").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .expect("meta")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "transport = \"zmq\"\n[sim]\nchannels = 2\n").expect("write");

        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.transport, Transport::Zmq);
        assert_eq!(cfg.sim.channels, 2);
        assert_eq!(cfg.sim.bins, 4096);
        assert_eq!(cfg.send_hwm, 50_000);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "data_port = \"not a number\"").expect("write");
        assert!(load_from(&path).is_err());
    }

    #[test]
    fn config_path_points_to_detstream_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".detstream"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn streamer_config_maps_fields() {
        let cfg = Config {
            idle_sleep_ms: 5,
            monitor_fresh_only: true,
            command_capacity: 4,
            stall_timeout_ms: 250,
            ..Config::default()
        };
        let sc = cfg.streamer_config();
        assert_eq!(sc.poller.idle_sleep, Duration::from_millis(5));
        assert_eq!(sc.poller.monitor_policy, MonitorPolicy::FreshOnly);
        assert_eq!(sc.command_capacity, 4);
        assert_eq!(sc.stall_timeout, Duration::from_millis(250));
    }

    #[test]
    fn transport_parses_case_insensitively() {
        assert_eq!("ZMQ".parse::<Transport>(), Ok(Transport::Zmq));
        assert_eq!(" inproc ".parse::<Transport>(), Ok(Transport::Inproc));
        assert!("udp".parse::<Transport>().is_err());
    }

    #[test]
    fn apply_env_overrides_changes_transport_and_ports() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe {
            std::env::set_var("DETSTREAM_TRANSPORT", "zmq");
            std::env::set_var("DETSTREAM_DATA_PORT", "7001");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.transport, Transport::Zmq);
        assert_eq!(cfg.data_port, 7001);
        unsafe {
            std::env::remove_var("DETSTREAM_TRANSPORT");
            std::env::remove_var("DETSTREAM_DATA_PORT");
        }
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_port() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("DETSTREAM_MONITOR_PORT", "not-a-port") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.monitor_port, 9998);
        unsafe { std::env::remove_var("DETSTREAM_MONITOR_PORT") };
    }
}
