use crate::errors::{LinkError, Result};
use crate::record::TransportKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub version: String,
    /// SQLite file holding the persisted printer lists. `None` uses the platform config dir.
    pub storage_path: Option<PathBuf>,
    pub enabled_transports: Vec<TransportKind>,
    pub policy: ReconnectPolicy,
    pub relay: RelayConfig,
    pub ble: BleConfig,
    pub usb: UsbConfig,
    /// Local control API bind address, e.g. `127.0.0.1:8043`.
    pub api_bind: Option<String>,
}

/// Timing and retry policy shared by every transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub ble_open_timeout_ms: u64,
    pub usb_open_timeout_ms: u64,
    pub network_open_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub send_timeout_ms: u64,
    /// Delay before each retry within a sweep; the last entry repeats as the cap.
    pub attempt_delays_ms: Vec<u64>,
    pub max_attempts_per_sweep: u32,
    /// Start offset between records within one sweep (multiplied by index).
    pub stagger_ms: u64,
    pub sweep_interval_ms: u64,
    pub liveness_interval_ms: u64,
    pub retry_ceiling: u32,
    pub cooldown_ms: u64,
    pub initial_sweep_delay_ms: u64,
    pub foreground_sweep_delay_ms: u64,
    pub prune_threshold_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            ble_open_timeout_ms: 10_000,
            usb_open_timeout_ms: 5_000,
            network_open_timeout_ms: 5_000,
            probe_timeout_ms: 5_000,
            send_timeout_ms: 20_000,
            attempt_delays_ms: vec![500, 2_000, 3_000],
            max_attempts_per_sweep: 3,
            stagger_ms: 1_000,
            sweep_interval_ms: 10_000,
            liveness_interval_ms: 30_000,
            retry_ceiling: 10,
            cooldown_ms: 5 * 60 * 1000,
            initial_sweep_delay_ms: 2_000,
            foreground_sweep_delay_ms: 1_000,
            prune_threshold_ms: 5 * 60 * 1000,
        }
    }
}

impl ReconnectPolicy {
    pub fn open_timeout(&self, kind: TransportKind) -> Duration {
        Duration::from_millis(match kind {
            TransportKind::Ble => self.ble_open_timeout_ms,
            TransportKind::Usb => self.usb_open_timeout_ms,
            TransportKind::Network => self.network_open_timeout_ms,
        })
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn initial_sweep_delay(&self) -> Duration {
        Duration::from_millis(self.initial_sweep_delay_ms)
    }

    pub fn foreground_sweep_delay(&self) -> Duration {
        Duration::from_millis(self.foreground_sweep_delay_ms)
    }

    pub fn prune_threshold(&self) -> Duration {
        Duration::from_millis(self.prune_threshold_ms)
    }

    /// A policy with every delay at zero, for tests that only care about ordering.
    pub fn immediate() -> Self {
        Self {
            attempt_delays_ms: vec![0],
            stagger_ms: 0,
            initial_sweep_delay_ms: 0,
            foreground_sweep_delay_ms: 0,
            ..Self::default()
        }
    }
}

/// Backend relay used to reach network printers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub base_url: String,
    pub probe_path: String,
    pub print_path: String,
    pub request_timeout_ms: u64,
    /// mDNS browse window for network discovery; 0 disables browsing.
    pub mdns_browse_ms: u64,
    /// IPv4 ranges in CIDR notation to port-scan during discovery.
    pub scan_ranges: Vec<String>,
    /// Also scan the /24 of this host's own address.
    pub scan_local_subnet: bool,
    pub scan_ports: Vec<u16>,
    pub scan_connect_timeout_ms: u64,
    /// Concurrent TCP connects while scanning.
    pub scan_concurrency: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".to_string(),
            probe_path: "/api/test-wifi-printer".to_string(),
            print_path: "/api/print-wifi".to_string(),
            request_timeout_ms: 10_000,
            mdns_browse_ms: 3_000,
            scan_ranges: Vec::new(),
            scan_local_subnet: true,
            scan_ports: vec![9100, 9101, 9102, 515, 631],
            scan_connect_timeout_ms: 1_000,
            scan_concurrency: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    pub chunk_size: usize,
    pub chunk_delay_ms: u64,
    pub scan_ms: u64,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            chunk_size: 244,
            chunk_delay_ms: 5,
            scan_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbConfig {
    /// Used when the bulk OUT endpoint does not report a packet size.
    pub fallback_chunk_size: usize,
    pub write_timeout_ms: u64,
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            fallback_chunk_size: 64,
            write_timeout_ms: 5_000,
        }
    }
}

impl LinkConfig {
    pub fn config_dir() -> PathBuf {
        if cfg!(target_os = "macos") {
            dirs::home_dir()
                .map(|p| p.join("Library/Application Support/com.eatsome.printer-link"))
                .unwrap_or_else(|| PathBuf::from("."))
        } else if cfg!(target_os = "windows") {
            dirs::config_dir()
                .map(|p| p.join("Eatsome Printer Link"))
                .unwrap_or_else(|| PathBuf::from("."))
        } else {
            dirs::config_dir()
                .map(|p| p.join("eatsome-printer-link"))
                .unwrap_or_else(|| PathBuf::from("."))
        }
    }

    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage_path
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("printer-connections.db"))
    }

    /// Read the config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let config: LinkConfig = serde_json::from_str(&raw)
            .map_err(|e| LinkError::Config(format!("Invalid config file {:?}: {}", path, e)))?;
        config.validate()?;

        info!("Config loaded from {:?}", path);
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.policy.attempt_delays_ms.is_empty() {
            return Err(LinkError::Config("attempt_delays_ms must not be empty".to_string()));
        }
        if self.policy.max_attempts_per_sweep == 0 {
            return Err(LinkError::Config("max_attempts_per_sweep must be at least 1".to_string()));
        }
        if self.policy.retry_ceiling == 0 {
            return Err(LinkError::Config("retry_ceiling must be at least 1".to_string()));
        }
        if self.ble.chunk_size == 0 || self.usb.fallback_chunk_size == 0 {
            return Err(LinkError::Config("chunk sizes must be non-zero".to_string()));
        }
        if self.relay.scan_concurrency == 0 {
            return Err(LinkError::Config("scan_concurrency must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            storage_path: None,
            enabled_transports: vec![TransportKind::Ble, TransportKind::Usb, TransportKind::Network],
            policy: ReconnectPolicy::default(),
            relay: RelayConfig::default(),
            ble: BleConfig::default(),
            usb: UsbConfig::default(),
            api_bind: None,
        }
    }
}
