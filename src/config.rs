//! Pool configuration and peer lists.

use crate::selection::{
    default_selectors, ConnectionPeerSelector, RequestPeerSelector, SendPeerSelector,
};
use crate::types::PeerInfo;
use rand::Rng;

// Defaults. Timers are milliseconds; sizes are serialized JSON bytes.

pub const DEFAULT_CONNECT_TIMEOUT: u64 = 2_000;
pub const DEFAULT_ACK_TIMEOUT: u64 = 2_000;
pub const DEFAULT_RATE_CALCULATION_INTERVAL: u64 = 1_000;
pub const DEFAULT_WS_MAX_MESSAGE_RATE: f64 = 100.0;
pub const DEFAULT_WS_MAX_MESSAGE_RATE_PENALTY: i64 = 10;
pub const DEFAULT_WS_MAX_PAYLOAD: usize = 3_048_576;
pub const DEFAULT_MAX_PEER_INFO_SIZE: usize = 20_480;
pub const DEFAULT_MAX_PEER_DISCOVERY_RESPONSE_LENGTH: usize = 1_000;
pub const DEFAULT_MIN_PEER_DISCOVERY_THRESHOLD: usize = 100;
pub const DEFAULT_MAX_OUTBOUND_CONNECTIONS: usize = 20;
pub const DEFAULT_MAX_INBOUND_CONNECTIONS: usize = 100;
pub const DEFAULT_SEND_PEER_LIMIT: usize = 16;
pub const DEFAULT_OUTBOUND_SHUFFLE_INTERVAL: u64 = 300_000;
pub const DEFAULT_PEER_BAN_TIME: u64 = 86_400_000;
pub const DEFAULT_POPULATOR_INTERVAL: u64 = 10_000;
pub const DEFAULT_POPULATOR_START_DELAY: u64 = 500;
pub const DEFAULT_PING_INTERVAL_MIN: u64 = 20_000;
pub const DEFAULT_PING_INTERVAL_MAX: u64 = 60_000;
pub const DEFAULT_PRODUCTIVITY_RESET_INTERVAL: u64 = 20_000;

/// Fraction of inbound peers shielded from eviction by low latency.
pub const DEFAULT_LATENCY_PROTECTION_RATIO: f64 = 0.068;
/// Fraction shielded by high response rate.
pub const DEFAULT_PRODUCTIVITY_PROTECTION_RATIO: f64 = 0.068;
/// Fraction shielded by connection age.
pub const DEFAULT_LONGEVITY_PROTECTION_RATIO: f64 = 0.5;

pub const DEFAULT_NEW_BUCKET_COUNT: u32 = 128;
pub const DEFAULT_NEW_BUCKET_SIZE: usize = 32;
pub const DEFAULT_TRIED_BUCKET_COUNT: u32 = 64;
pub const DEFAULT_TRIED_BUCKET_SIZE: usize = 32;

/// Statically known peers fed to the pool at start, before sanitization.
#[derive(Debug, Clone, Default)]
pub struct PeerLists {
    /// Bootstrap addresses dialed when the book is empty.
    pub seed_peers: Vec<PeerInfo>,
    /// Peers we always keep an outbound connection to.
    pub fixed_peers: Vec<PeerInfo>,
    /// Peers exempt from eviction and banning.
    pub whitelisted: Vec<PeerInfo>,
    /// Peers remembered by the host application from an earlier run.
    pub previous_peers: Vec<PeerInfo>,
}

/// Everything the pool, sessions and discovery need to run.
///
/// Plain struct with a [`Default`]; the host application overrides what it
/// needs and passes the rest through untouched.
#[derive(Clone)]
pub struct P2PConfig {
    /// Address the listener binds to and the node advertises.
    pub host_address: String,
    pub connect_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    /// Length of one rate-accounting window.
    pub rate_calculation_interval_ms: u64,
    /// Transport frames per second a peer may send before being penalized.
    pub ws_max_message_rate: f64,
    /// Reputation cost of breaching the message rate, applied per window.
    pub ws_max_message_rate_penalty: i64,
    /// Receive payload cap on inbound connections.
    pub ws_max_payload_inbound: usize,
    /// Receive payload cap on outbound connections.
    pub ws_max_payload_outbound: usize,
    pub max_peer_info_size: usize,
    pub max_peer_discovery_response_length: usize,
    /// New book entries accepted per discovery cycle.
    pub minimum_peer_discovery_threshold: usize,
    pub max_outbound_connections: usize,
    pub max_inbound_connections: usize,
    pub send_peer_limit: usize,
    pub outbound_shuffle_interval_ms: u64,
    pub peer_ban_time_ms: u64,
    pub populator_interval_ms: u64,
    pub populator_start_delay_ms: u64,
    pub latency_protection_ratio: f64,
    pub productivity_protection_ratio: f64,
    pub longevity_protection_ratio: f64,
    /// Scale factor for the inbound quota. `None` derives `modules + 1`
    /// from the advertised node info.
    pub inbound_quota_multiplier: Option<usize>,
    /// Node-private seed for peer-book bucket assignment.
    pub secret: u32,
    pub new_bucket_count: u32,
    pub new_bucket_size: usize,
    pub tried_bucket_count: u32,
    pub tried_bucket_size: usize,
    pub ping_interval_min_ms: u64,
    pub ping_interval_max_ms: u64,
    pub productivity_reset_interval_ms: u64,
    pub peer_lists: PeerLists,
    /// IPs refused everywhere: lists, book and inbound accept.
    pub blacklisted_ips: Vec<String>,
    pub peer_selection_for_request: RequestPeerSelector,
    pub peer_selection_for_send: SendPeerSelector,
    pub peer_selection_for_connection: ConnectionPeerSelector,
}

impl Default for P2PConfig {
    fn default() -> Self {
        let (for_request, for_send, for_connection) = default_selectors();
        Self {
            host_address: "127.0.0.1".to_string(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT,
            rate_calculation_interval_ms: DEFAULT_RATE_CALCULATION_INTERVAL,
            ws_max_message_rate: DEFAULT_WS_MAX_MESSAGE_RATE,
            ws_max_message_rate_penalty: DEFAULT_WS_MAX_MESSAGE_RATE_PENALTY,
            ws_max_payload_inbound: DEFAULT_WS_MAX_PAYLOAD,
            ws_max_payload_outbound: DEFAULT_WS_MAX_PAYLOAD,
            max_peer_info_size: DEFAULT_MAX_PEER_INFO_SIZE,
            max_peer_discovery_response_length: DEFAULT_MAX_PEER_DISCOVERY_RESPONSE_LENGTH,
            minimum_peer_discovery_threshold: DEFAULT_MIN_PEER_DISCOVERY_THRESHOLD,
            max_outbound_connections: DEFAULT_MAX_OUTBOUND_CONNECTIONS,
            max_inbound_connections: DEFAULT_MAX_INBOUND_CONNECTIONS,
            send_peer_limit: DEFAULT_SEND_PEER_LIMIT,
            outbound_shuffle_interval_ms: DEFAULT_OUTBOUND_SHUFFLE_INTERVAL,
            peer_ban_time_ms: DEFAULT_PEER_BAN_TIME,
            populator_interval_ms: DEFAULT_POPULATOR_INTERVAL,
            populator_start_delay_ms: DEFAULT_POPULATOR_START_DELAY,
            latency_protection_ratio: DEFAULT_LATENCY_PROTECTION_RATIO,
            productivity_protection_ratio: DEFAULT_PRODUCTIVITY_PROTECTION_RATIO,
            longevity_protection_ratio: DEFAULT_LONGEVITY_PROTECTION_RATIO,
            inbound_quota_multiplier: None,
            secret: rand::thread_rng().gen_range(0..=u32::MAX),
            new_bucket_count: DEFAULT_NEW_BUCKET_COUNT,
            new_bucket_size: DEFAULT_NEW_BUCKET_SIZE,
            tried_bucket_count: DEFAULT_TRIED_BUCKET_COUNT,
            tried_bucket_size: DEFAULT_TRIED_BUCKET_SIZE,
            ping_interval_min_ms: DEFAULT_PING_INTERVAL_MIN,
            ping_interval_max_ms: DEFAULT_PING_INTERVAL_MAX,
            productivity_reset_interval_ms: DEFAULT_PRODUCTIVITY_RESET_INTERVAL,
            peer_lists: PeerLists::default(),
            blacklisted_ips: Vec::new(),
            peer_selection_for_request: for_request,
            peer_selection_for_send: for_send,
            peer_selection_for_connection: for_connection,
        }
    }
}

impl P2PConfig {
    /// Reject configurations the pool cannot run with.
    pub fn validate(&self) -> Result<(), crate::error::P2PError> {
        use crate::error::P2PError;

        if self.new_bucket_count == 0 || self.tried_bucket_count == 0 {
            return Err(P2PError::InvalidConfig("bucket counts must be positive".into()));
        }
        if self.new_bucket_size == 0 || self.tried_bucket_size == 0 {
            return Err(P2PError::InvalidConfig("bucket sizes must be positive".into()));
        }
        if self.ping_interval_min_ms > self.ping_interval_max_ms {
            return Err(P2PError::InvalidConfig(
                "ping interval minimum exceeds maximum".into(),
            ));
        }
        if self.rate_calculation_interval_ms == 0 {
            return Err(P2PError::InvalidConfig(
                "rate calculation interval must be positive".into(),
            ));
        }
        for ratio in [
            self.latency_protection_ratio,
            self.productivity_protection_ratio,
            self.longevity_protection_ratio,
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(P2PError::InvalidConfig(
                    "protection ratios must be within [0, 1]".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(P2PConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_ratios() {
        let mut config = P2PConfig::default();
        config.latency_protection_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_ping_interval() {
        let mut config = P2PConfig::default();
        config.ping_interval_min_ms = 90_000;
        assert!(config.validate().is_err());
    }
}
