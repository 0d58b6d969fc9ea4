//! Bridge configuration file parser.
//!
//! Parses the same flat `key = value` format used by the other
//! autopilot daemons.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{BridgeError, Result};

/// Default TCP port for NMEA connections.
pub const DEFAULT_PORT: u16 = 20220;

/// Full bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// TCP port the NMEA server listens on.
    pub port: u16,
    /// Optional `host:port` target for the outbound NMEA client
    /// (seeds the persistent `nmea.client` bus key; empty disables).
    pub nmea_client: String,
    /// Candidate serial device paths handed to the probe.
    pub serial_ports: Vec<String>,
    // ── Process ───────────────────────────────────────────────────────────────
    pub pid_file:   PathBuf,
    pub log_syslog: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port:         DEFAULT_PORT,
            nmea_client:  String::new(),
            serial_ports: Vec::new(),
            pid_file:     PathBuf::from("/var/run/nmea-bridge.pid"),
            log_syslog:   true,
        }
    }
}

/// Parse `path` as a `nmea_bridge.conf` key=value configuration file.
pub fn load_config(path: &Path) -> Result<BridgeConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| BridgeError::Config(format!("cannot read {}: {e}", path.display())))?;
    let mut cfg = BridgeConfig::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(2, '=');
        let key = match parts.next() {
            Some(k) => k.trim().to_ascii_lowercase(),
            None => continue,
        };
        let val = match parts.next() {
            Some(v) => v.trim().to_string(),
            None => continue,
        };
        if val.is_empty() {
            continue;
        }

        match key.as_str() {
            "port"         => cfg.port        = val.parse().unwrap_or(DEFAULT_PORT),
            "nmea_client"  => cfg.nmea_client = val,
            "serial_ports" => {
                cfg.serial_ports = val
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
            }
            "pid_file"     => cfg.pid_file    = PathBuf::from(&val),
            "log_syslog"   => cfg.log_syslog  = val == "true" || val == "1" || val == "yes",
            _ => {} // ignore unknown keys
        }
    }

    Ok(cfg)
}

/// Validate that configured fields are usable.
pub fn validate_config(cfg: &BridgeConfig) -> Result<()> {
    if cfg.port == 0 {
        return Err(BridgeError::Config("port must be non-zero".into()));
    }
    if !cfg.nmea_client.is_empty() && !cfg.nmea_client.contains(':') {
        return Err(BridgeError::Config(
            "nmea_client must be host:port".into()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_conf(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("{name}-{}", std::process::id()));
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn parses_known_keys() {
        let path = write_conf(
            "nmea-bridge-conf",
            "# comment\n\
             port = 30000\n\
             nmea_client = 10.0.0.5:10110\n\
             serial_ports = /dev/ttyUSB0, /dev/ttyAMA0\n\
             log_syslog = no\n\
             bogus_key = ignored\n",
        );
        let cfg = load_config(&path).unwrap();
        fs::remove_file(&path).ok();
        assert_eq!(cfg.port, 30000);
        assert_eq!(cfg.nmea_client, "10.0.0.5:10110");
        assert_eq!(cfg.serial_ports, vec!["/dev/ttyUSB0", "/dev/ttyAMA0"]);
        assert!(!cfg.log_syslog);
    }

    #[test]
    fn defaults_survive_empty_file() {
        let path = write_conf("nmea-bridge-empty", "\n");
        let cfg = load_config(&path).unwrap();
        fs::remove_file(&path).ok();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert!(cfg.nmea_client.is_empty());
        assert!(cfg.serial_ports.is_empty());
        assert!(cfg.log_syslog);
    }

    #[test]
    fn validates_client_target_shape() {
        let mut cfg = BridgeConfig::default();
        assert!(validate_config(&cfg).is_ok());
        cfg.nmea_client = "no-port-here".into();
        assert!(validate_config(&cfg).is_err());
        cfg.nmea_client = "host:20220".into();
        assert!(validate_config(&cfg).is_ok());
    }
}
