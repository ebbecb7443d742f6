use std::path::{Path, PathBuf};
use std::time::Duration;
use serde_derive::{Serialize, Deserialize};

use crate::constants::*;
use crate::error::ConfigError;
use crate::handshake::HandshakeSettings;
use crate::hv::ChannelConfig;

fn read_yaml<T: serde::de::DeserializeOwned>(config_path: &Path) -> Result<T, ConfigError> {
    if !config_path.exists() {
        return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
    }

    let yaml_str = std::fs::read_to_string(config_path)?;

    Ok(serde_yaml::from_str::<T>(&yaml_str)?)
}

/// # ServerConfig
/// Settings of the control server. Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub control_port: u16,
    pub daq_port: u16,
    pub handshake_poll_ms: u64,
    pub ready_timeout_factor: u32,
    pub max_retries: u32,
    pub reply_timeout_s: u64,
    pub storage_root: PathBuf,
    pub hv_port: String,
    pub log_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            control_port: DEFAULT_CONTROL_PORT,
            daq_port: DEFAULT_DAQ_PORT,
            handshake_poll_ms: HANDSHAKE_POLL_TIMEOUT.as_millis() as u64,
            ready_timeout_factor: READY_TIMEOUT_FACTOR,
            max_retries: MAX_RETRIES,
            reply_timeout_s: DEFAULT_REPLY_TIMEOUT.as_secs(),
            storage_root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            hv_port: String::from(DEFAULT_HV_PORT),
            log_file: None,
        }
    }
}

impl ServerConfig {
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        read_yaml(config_path)
    }

    pub fn handshake_settings(&self) -> HandshakeSettings {
        HandshakeSettings {
            poll_timeout: Duration::from_millis(self.handshake_poll_ms),
            ready_timeout_factor: self.ready_timeout_factor,
            max_retries: self.max_retries,
        }
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_s)
    }
}

/// One run control register write of the bring-up sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterWrite {
    pub address: u16,
    pub value: u32,
}

/// # ClientConfig
/// Settings of an embedded client: where the server is, how to reach the local hardware and what to
/// do on the initialization trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_address: String,
    pub port: u16,
    pub identity: String,
    pub ping_interval_s: u64,
    pub trigger_timeout_ms: u64,
    pub hv_port: String,
    pub hv_baud_rate: u32,
    pub hv_timeout_ms: u64,
    pub rc_device: PathBuf,
    pub rc_base: u64,
    pub rc_span: usize,
    pub bring_up_rc: Vec<RegisterWrite>,
    pub bring_up_hv: ChannelConfig,
    pub helper_command: Vec<String>,
    pub helper_stop_command: Vec<String>,
    pub helper_grace_ms: u64,
    pub log_file: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: String::from(DEFAULT_SERVER_ADDRESS),
            port: DEFAULT_CONTROL_PORT,
            identity: String::from(DEFAULT_CLIENT_ID),
            ping_interval_s: PING_INTERVAL.as_secs(),
            trigger_timeout_ms: HANDSHAKE_POLL_TIMEOUT.as_millis() as u64,
            hv_port: String::from(DEFAULT_HV_PORT),
            hv_baud_rate: HV_BAUD_RATE,
            hv_timeout_ms: HV_SERIAL_TIMEOUT.as_millis() as u64,
            rc_device: PathBuf::from(DEFAULT_RC_DEVICE),
            rc_base: 0,
            rc_span: DEFAULT_RC_SPAN,
            bring_up_rc: BRING_UP_RC_WRITES
                .iter()
                .map(|(address, value)| RegisterWrite { address: *address, value: *value })
                .collect(),
            bring_up_hv: ChannelConfig::standard(1200),
            helper_command: vec![String::from(HELPER_COMMAND)],
            helper_stop_command: HELPER_STOP_COMMAND.iter().map(|s| s.to_string()).collect(),
            helper_grace_ms: HELPER_GRACE_PERIOD.as_millis() as u64,
            log_file: None,
        }
    }
}

impl ClientConfig {
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        read_yaml(config_path)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_s)
    }

    pub fn trigger_timeout(&self) -> Duration {
        Duration::from_millis(self.trigger_timeout_ms)
    }

    pub fn hv_timeout(&self) -> Duration {
        Duration::from_millis(self.hv_timeout_ms)
    }

    pub fn helper_grace(&self) -> Duration {
        Duration::from_millis(self.helper_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_is_a_bad_path() {
        let result = ServerConfig::read_config_file(Path::new("/does/not/exist.yaml"));
        assert!(matches!(result, Err(ConfigError::BadFilePath(_))));
    }

    #[test]
    fn empty_file_gives_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{}\n").unwrap();
        let server = ServerConfig::read_config_file(file.path()).unwrap();
        assert_eq!(server, ServerConfig::default());
        assert_eq!(server.handshake_settings(), HandshakeSettings::default());

        let client = ClientConfig::read_config_file(file.path()).unwrap();
        assert_eq!(client.bring_up_rc[2], RegisterWrite { address: 10, value: 65 });
        assert_eq!(client.helper_stop_command, vec!["killall", "evproducer"]);
        assert_eq!(client.ping_interval(), PING_INTERVAL);
    }

    #[test]
    fn partial_file_overrides_only_its_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server_address: 10.0.0.2").unwrap();
        writeln!(file, "identity: mpmt-3").unwrap();
        writeln!(file, "bring_up_hv:").unwrap();
        writeln!(file, "  voltage_set: 1000").unwrap();
        let client = ClientConfig::read_config_file(file.path()).unwrap();
        assert_eq!(client.server_address, "10.0.0.2");
        assert_eq!(client.identity, "mpmt-3");
        assert_eq!(client.bring_up_hv, ChannelConfig::voltage(1000));
        assert_eq!(client.port, DEFAULT_CONTROL_PORT);
    }
}
