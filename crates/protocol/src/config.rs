use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration shared by the agent and the relay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallConfig {
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub timers: TimerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

/// STUN/TURN servers used for path discovery and relayed media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs (default: Google's public STUN server)
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// TURN server URLs (e.g., "turn:turn.example.com:3478")
    #[serde(default)]
    pub turn_urls: Vec<String>,
    /// TURN username (long-term credential mechanism)
    pub turn_username: Option<String>,
    /// TURN credential/password
    pub turn_credential: Option<String>,
}

impl IceConfig {
    /// True when at least one relay server is configured.
    pub fn has_relay(&self) -> bool {
        !self.turn_urls.is_empty()
    }
}

/// Session timers. Millisecond fields are converted with the `Duration` helpers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Caller gives up ringing after this many seconds
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    /// Time allowed between entering `connecting` and the link connecting
    #[serde(default = "default_connect_watchdog_ms")]
    pub connect_watchdog_ms: u64,
    /// Time allowed for the link to leave `new` once negotiation starts
    #[serde(default = "default_ice_gather_timeout_ms")]
    pub ice_gather_timeout_ms: u64,
    /// Gap between resends of an unacknowledged offer or answer
    #[serde(default = "default_resend_interval_ms")]
    pub resend_interval_ms: u64,
    /// Resend budget per offer/answer round (0 = never resend)
    #[serde(default = "default_max_resend_attempts")]
    pub max_resend_attempts: u32,
    /// Upper bound on one connectivity probe
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl TimerConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn connect_watchdog(&self) -> Duration {
        Duration::from_millis(self.connect_watchdog_ms)
    }

    pub fn ice_gather_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gather_timeout_ms)
    }

    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Listening port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest WebSocket frame accepted from a client
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Per-user channel capacity before slow consumers start lagging
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            dial_timeout_secs: default_dial_timeout_secs(),
            connect_watchdog_ms: default_connect_watchdog_ms(),
            ice_gather_timeout_ms: default_ice_gather_timeout_ms(),
            resend_interval_ms: default_resend_interval_ms(),
            max_resend_attempts: default_max_resend_attempts(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_message_size: default_max_message_size(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl CallConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the binary should not start) or
    /// "WARNING:" (advisory, it can start but the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- STUN URLs ---
        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302",
                    url
                ));
            }
        }
        if self.ice.stun_urls.is_empty() && self.ice.turn_urls.is_empty() {
            issues.push(
                "WARNING: no STUN or TURN servers configured. Only host candidates will be \
                 gathered and the direct-path probe will always fail."
                    .to_string(),
            );
        }

        // --- TURN URLs ---
        for url in &self.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{}' must start with 'turn:' or 'turns:'. \
                     Example: turn:turn.example.com:3478",
                    url
                ));
            }
        }
        if self.ice.has_relay()
            && (self.ice.turn_username.is_none() || self.ice.turn_credential.is_none())
        {
            issues.push(
                "WARNING: turn_urls are set without both turn_username and turn_credential. \
                 Most TURN servers reject unauthenticated allocations."
                    .to_string(),
            );
        }

        // --- Timers ---
        let timers = &self.timers;
        for (name, value) in [
            ("timers.dial_timeout_secs", timers.dial_timeout_secs),
            ("timers.connect_watchdog_ms", timers.connect_watchdog_ms),
            ("timers.ice_gather_timeout_ms", timers.ice_gather_timeout_ms),
            ("timers.resend_interval_ms", timers.resend_interval_ms),
            ("timers.probe_timeout_ms", timers.probe_timeout_ms),
        ] {
            if value == 0 {
                issues.push(format!("ERROR: {name} must be greater than 0."));
            }
        }
        if timers.connect_watchdog().as_secs() >= timers.dial_timeout_secs
            && timers.dial_timeout_secs > 0
        {
            issues.push(format!(
                "WARNING: timers.connect_watchdog_ms ({} ms) is not shorter than the dial \
                 timeout ({} s). Stalled connections will look like unanswered calls.",
                timers.connect_watchdog_ms, timers.dial_timeout_secs
            ));
        }
        if timers.max_resend_attempts > 100 {
            issues.push(format!(
                "WARNING: timers.max_resend_attempts is {}. Typical values: 10-30.",
                timers.max_resend_attempts
            ));
        }

        // --- Relay ---
        if self.relay.port == 0 {
            issues.push("ERROR: relay.port must be between 1 and 65535, got 0.".to_string());
        }
        if self.relay.max_message_size < 4096 {
            issues.push(format!(
                "ERROR: relay.max_message_size must be at least 4096 bytes, got {}.",
                self.relay.max_message_size
            ));
        }
        if self.relay.channel_capacity == 0 {
            issues.push("ERROR: relay.channel_capacity must be greater than 0.".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_stun_urls() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}
fn default_dial_timeout_secs() -> u64 {
    300 // 5 minutes
}
fn default_connect_watchdog_ms() -> u64 {
    18_000
}
fn default_ice_gather_timeout_ms() -> u64 {
    7_000
}
fn default_resend_interval_ms() -> u64 {
    1_200
}
fn default_max_resend_attempts() -> u32 {
    20
}
fn default_probe_timeout_ms() -> u64 {
    5_000
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8445
}
fn default_max_message_size() -> usize {
    crate::messages::MAX_MESSAGE_BYTES
}
fn default_channel_capacity() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_string() {
        let config: CallConfig =
            toml::from_str("").expect("empty string should deserialize to default config");

        assert_eq!(config.ice.stun_urls, vec!["stun:stun.l.google.com:19302"]);
        assert!(config.ice.turn_urls.is_empty());
        assert!(!config.ice.has_relay());

        assert_eq!(config.timers.dial_timeout(), Duration::from_secs(300));
        assert_eq!(config.timers.connect_watchdog(), Duration::from_secs(18));
        assert_eq!(config.timers.ice_gather_timeout(), Duration::from_secs(7));
        assert_eq!(config.timers.resend_interval(), Duration::from_millis(1200));
        assert_eq!(config.timers.max_resend_attempts, 20);
        assert_eq!(config.timers.probe_timeout(), Duration::from_secs(5));

        assert_eq!(config.relay.bind, "0.0.0.0");
        assert_eq!(config.relay.port, 8445);
        assert_eq!(config.relay.max_message_size, 65_536);
    }

    #[test]
    fn partial_config_only_timers_section() {
        let toml_str = r#"
[timers]
resend_interval_ms = 500
max_resend_attempts = 3
"#;
        let config: CallConfig = toml::from_str(toml_str).expect("partial config");
        assert_eq!(config.timers.resend_interval_ms, 500);
        assert_eq!(config.timers.max_resend_attempts, 3);
        // Untouched fields keep their defaults
        assert_eq!(config.timers.connect_watchdog_ms, 18_000);
        assert_eq!(config.ice, IceConfig::default());
    }

    #[test]
    fn turn_section_parses() {
        let toml_str = r#"
[ice]
stun_urls = ["stun:stun.example.com:3478"]
turn_urls = ["turn:turn.example.com:3478", "turns:turn.example.com:5349"]
turn_username = "careline"
turn_credential = "secret"
"#;
        let config: CallConfig = toml::from_str(toml_str).expect("ice config");
        assert!(config.ice.has_relay());
        assert_eq!(config.ice.turn_urls.len(), 2);
        assert_eq!(config.ice.turn_username.as_deref(), Some("careline"));
        assert!(config.validate().is_ok());
    }

    // --- Validation tests ---

    fn valid_config() -> CallConfig {
        toml::from_str("").expect("default config")
    }

    fn validate_issues(config: &CallConfig) -> Vec<String> {
        match config.validate() {
            Ok(()) => vec![],
            Err(issues) => issues,
        }
    }

    fn has_error(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("ERROR:") && i.contains(substring))
    }

    fn has_warning(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("WARNING:") && i.contains(substring))
    }

    #[test]
    fn validate_default_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_stun_url_bad_prefix_is_error() {
        let mut config = valid_config();
        config.ice.stun_urls = vec!["stun.l.google.com:19302".to_string()];
        assert!(has_error(&validate_issues(&config), "STUN URL"));
    }

    #[test]
    fn validate_turn_url_bad_prefix_is_error() {
        let mut config = valid_config();
        config.ice.turn_urls = vec!["https://turn.example.com".to_string()];
        config.ice.turn_username = Some("u".to_string());
        config.ice.turn_credential = Some("p".to_string());
        assert!(has_error(&validate_issues(&config), "TURN URL"));
    }

    #[test]
    fn validate_turn_without_credentials_is_warning() {
        let mut config = valid_config();
        config.ice.turn_urls = vec!["turn:turn.example.com:3478".to_string()];
        let issues = validate_issues(&config);
        assert!(has_warning(&issues, "turn_credential"));
        assert!(!issues.iter().any(|i| i.starts_with("ERROR:")));
    }

    #[test]
    fn validate_no_ice_servers_is_warning() {
        let mut config = valid_config();
        config.ice.stun_urls.clear();
        assert!(has_warning(&validate_issues(&config), "no STUN or TURN"));
    }

    #[test]
    fn validate_zero_timers_are_errors() {
        let mut config = valid_config();
        config.timers.resend_interval_ms = 0;
        config.timers.probe_timeout_ms = 0;
        let issues = validate_issues(&config);
        assert!(has_error(&issues, "timers.resend_interval_ms"));
        assert!(has_error(&issues, "timers.probe_timeout_ms"));
    }

    #[test]
    fn validate_zero_resend_attempts_is_ok() {
        let mut config = valid_config();
        config.timers.max_resend_attempts = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_watchdog_longer_than_dial_is_warning() {
        let mut config = valid_config();
        config.timers.dial_timeout_secs = 10;
        config.timers.connect_watchdog_ms = 20_000;
        assert!(has_warning(&validate_issues(&config), "connect_watchdog_ms"));
    }

    #[test]
    fn validate_port_zero_is_error() {
        let mut config = valid_config();
        config.relay.port = 0;
        assert!(has_error(&validate_issues(&config), "relay.port"));
    }

    #[test]
    fn validate_tiny_message_size_is_error() {
        let mut config = valid_config();
        config.relay.max_message_size = 1024;
        assert!(has_error(&validate_issues(&config), "max_message_size"));
    }

    #[test]
    fn validate_multiple_errors_collected() {
        let mut config = valid_config();
        config.relay.port = 0;
        config.relay.channel_capacity = 0;
        config.timers.dial_timeout_secs = 0;
        let issues = validate_issues(&config);
        assert!(
            issues.len() >= 3,
            "expected at least 3 errors, got {}: {:?}",
            issues.len(),
            issues
        );
    }
}
