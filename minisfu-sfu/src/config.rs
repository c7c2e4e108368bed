//! SFU Configuration

use serde::{Deserialize, Serialize};

/// Minimum width of a configured ICE UDP port range
pub const MIN_PORT_RANGE: u16 = 100;

/// Default label of the in-session broadcast data channel
pub const DEFAULT_DATACHANNEL_LABEL: &str = "minisfu";

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Maximum number of concurrent sessions (0 = unlimited)
    pub max_sessions: usize,
    /// Maximum peers per session (0 = unlimited)
    pub max_peers_per_session: usize,
    /// Maximum subscribers per published track (0 = unlimited)
    pub max_subscribers_per_track: usize,
    /// Packets buffered per subscriber before the oldest is dropped
    pub sink_capacity: usize,
    /// Interval of the empty-session sweep (0 = disabled)
    pub cleanup_interval_secs: u64,
    /// Label of the broadcast data channel shared by a session
    pub datachannel_label: String,
    /// WebRTC transport settings
    pub webrtc: WebRtcConfig,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            max_sessions: 0,
            max_peers_per_session: 50,
            max_subscribers_per_track: 0,
            sink_capacity: 256,
            cleanup_interval_secs: 60,
            datachannel_label: DEFAULT_DATACHANNEL_LABEL.to_string(),
            webrtc: WebRtcConfig::default(),
        }
    }
}

impl SfuConfig {
    /// Validate the configuration, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.sink_capacity == 0 {
            errors.push("sink_capacity must be greater than 0".to_string());
        }
        if self.datachannel_label.is_empty() {
            errors.push("datachannel_label must not be empty".to_string());
        }
        if let Err(e) = self.webrtc.validate() {
            errors.extend(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// ICE server entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Transport settings for the webrtc-rs backed legs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    pub ice_servers: Vec<IceServerConfig>,
    /// UDP port range `[min, max]` for ICE; empty means ephemeral
    pub ice_port_range: Vec<u16>,
    /// Public IPs advertised as host candidates (NAT 1:1 mapping)
    pub nat_1to1_ips: Vec<String>,
    /// Run ICE in lite mode
    pub ice_lite: bool,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                ..Default::default()
            }],
            ice_port_range: Vec::new(),
            nat_1to1_ips: Vec::new(),
            ice_lite: false,
        }
    }
}

impl WebRtcConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        match self.ice_port_range.as_slice() {
            [] => {}
            [min, max] => {
                if max < min || max - min < MIN_PORT_RANGE {
                    errors.push(format!(
                        "ice_port_range must be [min, max] with max - min >= {MIN_PORT_RANGE}"
                    ));
                }
            }
            _ => errors.push("ice_port_range must be [min, max]".to_string()),
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Configured `(min, max)` port range, if any
    #[must_use]
    pub fn port_range(&self) -> Option<(u16, u16)> {
        match self.ice_port_range.as_slice() {
            [min, max] => Some((*min, *max)),
            _ => None,
        }
    }
}
