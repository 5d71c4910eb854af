//! Host application configuration

use crate::usb::{DeviceConfig, DriverConfig};
use crate::usb::device::{DEFAULT_BUFFER_SIZE, DEFAULT_CONNECTION_TIMEOUT, DEFAULT_LATENCY_MS};
use crate::usb::manager::{DEFAULT_EVENT_QUEUE_DEPTH, DEFAULT_TASK_STACK_SIZE};
use anyhow::{Context, Result, anyhow};
use protocol::{DataBits, FTDI_VID, MIN_BAUDRATE, Parity, StopBits};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    pub host: HostSettings,
    #[serde(default)]
    pub driver: DriverSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub serial: SerialSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSettings {
    pub log_level: String,
}

/// Registry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverSettings {
    /// Vendor ID reported through the new-device notification ("0x0403")
    #[serde(default = "DriverSettings::default_vendor_id")]
    pub vendor_id: String,
    #[serde(default = "DriverSettings::default_event_queue_depth")]
    pub event_queue_depth: usize,
    #[serde(default = "DriverSettings::default_task_stack_size")]
    pub task_stack_size: usize,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            vendor_id: Self::default_vendor_id(),
            event_queue_depth: Self::default_event_queue_depth(),
            task_stack_size: Self::default_task_stack_size(),
        }
    }
}

impl DriverSettings {
    fn default_vendor_id() -> String {
        format!("{:#06x}", FTDI_VID)
    }

    fn default_event_queue_depth() -> usize {
        DEFAULT_EVENT_QUEUE_DEPTH
    }

    fn default_task_stack_size() -> usize {
        DEFAULT_TASK_STACK_SIZE
    }
}

/// Which device to open and how
///
/// # Example Configuration
/// ```toml
/// [device]
/// vid = "0x0403"
/// pid = "*"          # any FTDI product
/// interface = 1      # second port of a dual/quad chip
/// connection_timeout_ms = 0   # wait forever
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// "0x0403" or "*" for any vendor
    #[serde(default = "DeviceSettings::default_vid")]
    pub vid: String,
    /// "0x6001" or "*" for any product
    #[serde(default = "DeviceSettings::default_pid")]
    pub pid: String,
    #[serde(default)]
    pub interface: u8,
    /// 0 waits indefinitely
    #[serde(default = "DeviceSettings::default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "DeviceSettings::default_buffer_size")]
    pub in_buffer_size: usize,
    #[serde(default = "DeviceSettings::default_buffer_size")]
    pub out_buffer_size: usize,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            vid: Self::default_vid(),
            pid: Self::default_pid(),
            interface: 0,
            connection_timeout_ms: Self::default_connection_timeout_ms(),
            in_buffer_size: Self::default_buffer_size(),
            out_buffer_size: Self::default_buffer_size(),
        }
    }
}

impl DeviceSettings {
    fn default_vid() -> String {
        format!("{:#06x}", FTDI_VID)
    }

    fn default_pid() -> String {
        "*".to_string()
    }

    fn default_connection_timeout_ms() -> u64 {
        DEFAULT_CONNECTION_TIMEOUT.as_millis() as u64
    }

    fn default_buffer_size() -> usize {
        DEFAULT_BUFFER_SIZE
    }
}

/// Line settings applied after open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    #[serde(default = "SerialSettings::default_baudrate")]
    pub baudrate: u32,
    #[serde(default = "SerialSettings::default_data_bits")]
    pub data_bits: DataBits,
    #[serde(default = "SerialSettings::default_stop_bits")]
    pub stop_bits: StopBits,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "SerialSettings::default_latency_ms")]
    pub latency_ms: u8,
    #[serde(default)]
    pub dtr: bool,
    #[serde(default)]
    pub rts: bool,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baudrate: Self::default_baudrate(),
            data_bits: Self::default_data_bits(),
            stop_bits: Self::default_stop_bits(),
            parity: Parity::None,
            latency_ms: Self::default_latency_ms(),
            dtr: false,
            rts: false,
        }
    }
}

impl SerialSettings {
    fn default_baudrate() -> u32 {
        115_200
    }

    fn default_data_bits() -> DataBits {
        DataBits::Eight
    }

    fn default_stop_bits() -> StopBits {
        StopBits::One
    }

    fn default_latency_ms() -> u8 {
        DEFAULT_LATENCY_MS
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host: HostSettings {
                log_level: "info".to_string(),
            },
            driver: DriverSettings::default(),
            device: DeviceSettings::default(),
            serial: SerialSettings::default(),
        }
    }
}

impl HostConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/ftdi-sio-host/host.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("ftdi-sio-host").join("host.toml")
        } else {
            PathBuf::from(".config/ftdi-sio-host/host.toml")
        }
    }

    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.host.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.host.log_level,
                valid_levels.join(", ")
            ));
        }

        parse_id(&self.driver.vendor_id, "driver VID", false)?;
        parse_id(&self.device.vid, "VID", true)?;
        parse_id(&self.device.pid, "PID", true)?;

        if self.driver.event_queue_depth == 0 {
            return Err(anyhow!("event_queue_depth must be at least 1"));
        }
        if self.driver.task_stack_size < 16 * 1024 {
            return Err(anyhow!(
                "task_stack_size {} is too small, use at least 16384",
                self.driver.task_stack_size
            ));
        }
        if self.serial.baudrate < MIN_BAUDRATE {
            return Err(anyhow!(
                "Invalid baudrate {}, minimum is {}",
                self.serial.baudrate,
                MIN_BAUDRATE
            ));
        }
        if self.serial.latency_ms == 0 {
            return Err(anyhow!("latency_ms must be between 1 and 255"));
        }

        Ok(())
    }

    /// Registry settings for `DriverRegistry::install`
    pub fn driver_config(&self) -> Result<DriverConfig> {
        Ok(DriverConfig {
            vendor_id: parse_id(&self.driver.vendor_id, "driver VID", false)?,
            task_stack_size: self.driver.task_stack_size,
            event_queue_depth: self.driver.event_queue_depth,
            on_new_device: None,
        })
    }

    /// Open parameters: (vid, pid, interface, config without callbacks)
    pub fn device_target(&self) -> Result<(u16, u16, u8, DeviceConfig)> {
        let vid = parse_id(&self.device.vid, "VID", true)?;
        let pid = parse_id(&self.device.pid, "PID", true)?;
        let config = DeviceConfig::default()
            .with_connection_timeout(Duration::from_millis(self.device.connection_timeout_ms))
            .with_buffer_sizes(self.device.in_buffer_size, self.device.out_buffer_size);
        Ok((vid, pid, self.device.interface, config))
    }
}

/// Parse a "0x1234" ID; "*" maps to the wildcard 0 when allowed
fn parse_id(id: &str, name: &str, allow_wildcard: bool) -> Result<u16> {
    if id == "*" {
        if allow_wildcard {
            return Ok(0);
        }
        return Err(anyhow!("{} cannot be a wildcard", name));
    }

    let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
        return Err(anyhow!(
            "Invalid {} '{}', must start with '0x' (e.g., '0x0403')",
            name,
            id
        ));
    };
    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
}

/// Load a configuration file, expanding a leading `~`
pub fn load_config(path: &str) -> Result<HostConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    HostConfig::load(Some(path_buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HostConfig::default();
        assert_eq!(config.host.log_level, "info");
        assert_eq!(config.device.vid, "0x0403");
        assert_eq!(config.device.connection_timeout_ms, 5000);
        assert_eq!(config.serial.baudrate, 115_200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_id() {
        assert_eq!(parse_id("0x0403", "VID", false).unwrap(), 0x0403);
        assert_eq!(parse_id("0X6014", "PID", false).unwrap(), 0x6014);
        assert_eq!(parse_id("*", "PID", true).unwrap(), 0);
        assert!(parse_id("*", "VID", false).is_err());
        assert!(parse_id("0403", "VID", true).is_err());
        assert!(parse_id("0x", "VID", true).is_err());
        assert!(parse_id("0x12345", "VID", true).is_err());
        assert!(parse_id("0xGHIJ", "VID", true).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = HostConfig::default();
        config.host.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = HostConfig::default();
        config.serial.baudrate = 100;
        assert!(config.validate().is_err());

        let mut config = HostConfig::default();
        config.serial.latency_ms = 0;
        assert!(config.validate().is_err());

        let mut config = HostConfig::default();
        config.driver.event_queue_depth = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: HostConfig = toml::from_str(
            r#"
            [host]
            log_level = "debug"

            [serial]
            baudrate = 9600
            data_bits = 7
            stop_bits = "2"
            parity = "even"
            "#,
        )
        .unwrap();

        assert_eq!(config.serial.baudrate, 9600);
        assert_eq!(config.serial.data_bits, DataBits::Seven);
        assert_eq!(config.serial.stop_bits, StopBits::Two);
        assert_eq!(config.serial.parity, Parity::Even);
        assert_eq!(config.serial.latency_ms, DEFAULT_LATENCY_MS);
        assert_eq!(config.device, DeviceSettings::default());
        assert_eq!(config.driver, DriverSettings::default());
    }

    #[test]
    fn test_device_target() {
        let mut config = HostConfig::default();
        config.device.pid = "0x6011".to_string();
        config.device.interface = 2;
        config.device.connection_timeout_ms = 0;

        let (vid, pid, interface, device) = config.device_target().unwrap();
        assert_eq!((vid, pid, interface), (0x0403, 0x6011, 2));
        assert!(device.connection_timeout.is_zero());
        assert_eq!(device.in_buffer_size, 512);

        let driver = config.driver_config().unwrap();
        assert_eq!(driver.vendor_id, 0x0403);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("host.toml");

        let mut config = HostConfig::default();
        config.device.interface = 1;
        config.serial.parity = Parity::Odd;
        config.serial.stop_bits = StopBits::OnePointFive;
        config.save(&path).unwrap();

        let loaded = HostConfig::load(Some(path.clone())).unwrap();
        assert_eq!(loaded, config);

        let via_str = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(via_str, config);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(HostConfig::load(Some(dir.path().join("absent.toml"))).is_err());
    }
}
