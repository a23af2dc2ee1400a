use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SortbinConfig {
    pub serial: SerialConfig,
    pub detector: DetectorConfig,
    pub classifier: ClassifierConfig,
    pub telemetry: TelemetryConfig,
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SerialConfig {
    /// Serial line speed shared by both controllers
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Settle time after opening a port, covering the controller reset
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Response window for the identity handshake
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Response window for ordinary actuation commands
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Response window for the fill-level sensor poll
    #[serde(default = "default_sensor_timeout_ms")]
    pub sensor_timeout_ms: u64,

    /// Internal per-read timeout on the open port
    #[serde(default = "default_read_poll_ms")]
    pub read_poll_ms: u64,

    /// Where the discovered role-to-port mapping is persisted
    #[serde(default = "default_port_map_path")]
    pub port_map_path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DetectorConfig {
    /// Camera device index (e.g., 0 for /dev/video0)
    #[serde(default = "default_camera_index")]
    pub camera_index: usize,

    /// Fraction of changed pixels required to consider a trigger
    #[serde(default = "default_change_threshold")]
    pub change_threshold: f64,

    /// Per-pixel grayscale difference cutoff
    #[serde(default = "default_delta_threshold")]
    pub delta_threshold: u8,

    /// Minimum contiguous changed region to confirm a trigger
    #[serde(default = "default_min_region_area")]
    pub min_region_area: f64,

    /// Gaussian blur sigma applied during frame normalization
    #[serde(default = "default_blur_sigma")]
    pub blur_sigma: f32,

    /// Delay between detection polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ClassifierConfig {
    /// Classification service endpoint
    #[serde(default = "default_classifier_endpoint")]
    pub endpoint: String,

    /// Bearer token for the classification service; empty disables auth
    #[serde(default)]
    pub api_key: String,

    /// End-to-end request timeout in seconds
    #[serde(default = "default_classifier_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TelemetryConfig {
    /// Telemetry log file, newest record first
    #[serde(default = "default_telemetry_path")]
    pub path: String,

    /// Appliance identifier written with every record
    #[serde(default = "default_bin_code")]
    pub bin_code: String,

    /// Human-readable appliance location
    #[serde(default = "default_location")]
    pub location: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OrchestratorConfig {
    /// Recoverable failures tolerated before a full session restart
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before retrying after a recoverable failure
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Delay between tearing a session down and rediscovering
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,

    /// Quiet period after a completed cycle before polling resumes
    #[serde(default = "default_cycle_cooldown_ms")]
    pub cycle_cooldown_ms: u64,

    /// Fill level above which all compartments are flushed
    #[serde(default = "default_fill_threshold")]
    pub fill_threshold: i32,

    /// Keep retrying discovery instead of exiting when no hardware answers
    #[serde(default = "default_wait_for_hardware")]
    pub wait_for_hardware: bool,
}

impl SortbinConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("sortbin.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            // Start with default values
            .set_default("serial.baud_rate", default_baud_rate())?
            .set_default("serial.settle_delay_ms", default_settle_delay_ms())?
            .set_default("serial.handshake_timeout_ms", default_handshake_timeout_ms())?
            .set_default("serial.command_timeout_ms", default_command_timeout_ms())?
            .set_default("serial.sensor_timeout_ms", default_sensor_timeout_ms())?
            .set_default("serial.read_poll_ms", default_read_poll_ms())?
            .set_default("serial.port_map_path", default_port_map_path())?
            .set_default("detector.camera_index", default_camera_index() as i64)?
            .set_default("detector.change_threshold", default_change_threshold())?
            .set_default("detector.delta_threshold", default_delta_threshold() as i64)?
            .set_default("detector.min_region_area", default_min_region_area())?
            .set_default("detector.blur_sigma", default_blur_sigma() as f64)?
            .set_default("detector.poll_interval_ms", default_poll_interval_ms())?
            .set_default("classifier.endpoint", default_classifier_endpoint())?
            .set_default("classifier.api_key", String::new())?
            .set_default("classifier.timeout_secs", default_classifier_timeout_secs())?
            .set_default("telemetry.path", default_telemetry_path())?
            .set_default("telemetry.bin_code", default_bin_code())?
            .set_default("telemetry.location", default_location())?
            .set_default("orchestrator.max_retries", default_max_retries())?
            .set_default("orchestrator.retry_delay_ms", default_retry_delay_ms())?
            .set_default("orchestrator.restart_delay_ms", default_restart_delay_ms())?
            .set_default("orchestrator.cycle_cooldown_ms", default_cycle_cooldown_ms())?
            .set_default("orchestrator.fill_threshold", default_fill_threshold() as i64)?
            .set_default("orchestrator.wait_for_hardware", default_wait_for_hardware())?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Add environment variables with SORTBIN_ prefix
            .add_source(Environment::with_prefix("SORTBIN").separator("_"))
            .build()?;

        let config: SortbinConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::Message(
                "Serial baud_rate must be greater than 0".to_string(),
            ));
        }

        if self.serial.handshake_timeout_ms == 0
            || self.serial.command_timeout_ms == 0
            || self.serial.sensor_timeout_ms == 0
        {
            return Err(ConfigError::Message(
                "Serial timeouts must be greater than 0".to_string(),
            ));
        }

        if !(self.detector.change_threshold > 0.0 && self.detector.change_threshold < 1.0) {
            return Err(ConfigError::Message(
                "Detector change_threshold must be between 0 and 1".to_string(),
            ));
        }

        if self.detector.blur_sigma <= 0.0 {
            return Err(ConfigError::Message(
                "Detector blur_sigma must be greater than 0".to_string(),
            ));
        }

        if self.classifier.endpoint.is_empty() {
            return Err(ConfigError::Message(
                "Classifier endpoint must not be empty".to_string(),
            ));
        }

        if self.orchestrator.max_retries == 0 {
            return Err(ConfigError::Message(
                "Orchestrator max_retries must be greater than 0".to_string(),
            ));
        }

        if self.orchestrator.fill_threshold <= 0 {
            return Err(ConfigError::Message(
                "Orchestrator fill_threshold must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for SortbinConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            detector: DetectorConfig::default(),
            classifier: ClassifierConfig::default(),
            telemetry: TelemetryConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            settle_delay_ms: default_settle_delay_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            sensor_timeout_ms: default_sensor_timeout_ms(),
            read_poll_ms: default_read_poll_ms(),
            port_map_path: default_port_map_path(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            camera_index: default_camera_index(),
            change_threshold: default_change_threshold(),
            delta_threshold: default_delta_threshold(),
            min_region_area: default_min_region_area(),
            blur_sigma: default_blur_sigma(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: default_classifier_endpoint(),
            api_key: String::new(),
            timeout_secs: default_classifier_timeout_secs(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            path: default_telemetry_path(),
            bin_code: default_bin_code(),
            location: default_location(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            restart_delay_ms: default_restart_delay_ms(),
            cycle_cooldown_ms: default_cycle_cooldown_ms(),
            fill_threshold: default_fill_threshold(),
            wait_for_hardware: default_wait_for_hardware(),
        }
    }
}

// Default value functions
fn default_baud_rate() -> u32 {
    9600
}
fn default_settle_delay_ms() -> u64 {
    1500
}
fn default_handshake_timeout_ms() -> u64 {
    1000
}
fn default_command_timeout_ms() -> u64 {
    1000
}
fn default_sensor_timeout_ms() -> u64 {
    5000
}
fn default_read_poll_ms() -> u64 {
    50
}
fn default_port_map_path() -> String {
    "controller_ports.json".to_string()
}

fn default_camera_index() -> usize {
    0
}
fn default_change_threshold() -> f64 {
    0.01
}
fn default_delta_threshold() -> u8 {
    25
}
fn default_min_region_area() -> f64 {
    500.0
}
fn default_blur_sigma() -> f32 {
    3.5
}
fn default_poll_interval_ms() -> u64 {
    3000
}

fn default_classifier_endpoint() -> String {
    "http://127.0.0.1:8090/classify".to_string()
}
fn default_classifier_timeout_secs() -> u64 {
    30
}

fn default_telemetry_path() -> String {
    "sort_log.txt".to_string()
}
fn default_bin_code() -> String {
    "BIN001".to_string()
}
fn default_location() -> String {
    "Unset".to_string()
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    2000
}
fn default_restart_delay_ms() -> u64 {
    5000
}
fn default_cycle_cooldown_ms() -> u64 {
    3000
}
fn default_fill_threshold() -> i32 {
    10
}
fn default_wait_for_hardware() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SortbinConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.orchestrator.max_retries, 3);
    }

    #[test]
    fn test_config_validation() {
        let mut config = SortbinConfig::default();

        config.detector.change_threshold = 0.0;
        assert!(config.validate().is_err());
        config.detector.change_threshold = 0.01;
        assert!(config.validate().is_ok());

        config.orchestrator.max_retries = 0;
        assert!(config.validate().is_err());
        config.orchestrator.max_retries = 3;

        config.classifier.endpoint = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = SortbinConfig::load_from_file("does-not-exist.toml").unwrap();
        assert_eq!(config.serial.baud_rate, default_baud_rate());
        assert_eq!(config.telemetry.bin_code, default_bin_code());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sortbin.toml");
        std::fs::write(
            &path,
            "[serial]\nbaud_rate = 115200\n\n[orchestrator]\nfill_threshold = 20\n",
        )
        .unwrap();

        let config = SortbinConfig::load_from_file(&path).unwrap();
        assert_eq!(config.serial.baud_rate, 115200);
        assert_eq!(config.orchestrator.fill_threshold, 20);
        assert_eq!(config.detector.camera_index, default_camera_index());
    }
}
