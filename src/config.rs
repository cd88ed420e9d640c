//! Tester configuration and the timing constants of the OBD protocols

use crate::protocol::ScanTable;

/// Maximum response time (P2 max) on J1850 PWM / VPW links
pub const J1850_P2_MAX_MS: u32 = 100;
/// Minimum response time (P2 min) on ISO 9141 / ISO 14230 links
pub const KLINE_P2_MIN_MS: u32 = 25;
/// Maximum response time (P2 max) on ISO 9141 / ISO 14230 links
pub const KLINE_P2_MAX_MS: u32 = 50;
/// Maximum response time (P2 CAN) on ISO 15765 links
pub const CAN_P2_MAX_MS: u32 = 50;

/// Window extension granted to an ECU answering 0x78 on a legacy link
pub const LEGACY_RESPONSE_PENDING_MS: u32 = 3000;
/// Window extension granted to an ECU answering 0x78 on ISO 15765
pub const SEGMENTED_RESPONSE_PENDING_MS: u32 = 30000;
/// Window extension granted to an ECU once it started a multi frame response
pub const FIRST_FRAME_EXTENSION_MS: u32 = 30000;

/// Receive timeout of a request is this many times the maximum response time
pub const RECEIVE_TIMEOUT_FACTOR: u32 = 5;

/// Idle time between requests on J1850 links
pub const J1850_REQUEST_DELAY_MS: u32 = 100;
/// Idle time between requests on K-line links (P3 min with margin)
pub const KLINE_REQUEST_DELAY_MS: u32 = 300;
/// Idle time between requests on ISO 15765 links
pub const CAN_REQUEST_DELAY_MS: u32 = 50;

/// Attempts of the protocol probe while ECUs report busy
pub const PROBE_ATTEMPTS: u32 = 6;
/// Backoff between protocol probe attempts
pub const PROBE_RETRY_BACKOFF_MS: u32 = 200;
/// Delay after disconnecting a K-line protocol, so the ECU session fully times out
pub const KLINE_SETTLE_MS: u32 = 5000;
/// Receive timeout of the 29bit target address discovery
pub const TARGET_DISCOVERY_TIMEOUT_MS: u32 = 500;

/// Largest number of ECUs a vehicle may present
pub const MAX_ECUS: usize = 8;
/// Maximum number of sub-ids in one request
pub const MAX_SUB_IDS: usize = 6;

/// Battery voltage (mV) below which results become unreliable
pub const MIN_BATTERY_MV: u32 = 11000;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Delays used by protocol determination and the request engine.
///
/// Every delay can be shortened for bench testing, the defaults are the
/// values conformance testing requires.
pub struct DelayConfig {
    /// Backoff between probe attempts when an ECU reports busy
    pub probe_retry_backoff_ms: u32,
    /// Settle delay after a K-line protocol is disconnected
    pub kline_settle_ms: u32,
    /// Sleep the protocol dependent idle time before each request
    pub inter_request_delay: bool,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            probe_retry_backoff_ms: PROBE_RETRY_BACKOFF_MS,
            kline_settle_ms: KLINE_SETTLE_MS,
            inter_request_delay: true,
        }
    }
}

impl DelayConfig {
    /// No delays at all. Used with simulated adapters
    pub fn none() -> Self {
        Self {
            probe_retry_backoff_ms: 0,
            kline_settle_ms: 0,
            inter_request_delay: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Tester configuration
pub struct TesterConfig {
    /// Regulatory scan table deciding which protocols are probed
    pub scan_table: ScanTable,
    /// Number of OBD ECUs the user declared for the vehicle. When set,
    /// protocol determination fails if a different number responds
    pub expected_ecu_count: Option<usize>,
    /// Capacity of the ECU table
    pub max_ecus: usize,
    /// Keep-alive message interval
    pub keep_alive_interval_ms: u32,
    /// Timeout for transmitting a request
    pub write_timeout_ms: u32,
    /// Delays
    pub delays: DelayConfig,
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            scan_table: ScanTable::Us,
            expected_ecu_count: None,
            max_ecus: MAX_ECUS,
            keep_alive_interval_ms: 2000,
            write_timeout_ms: 1000,
            delays: DelayConfig::default(),
        }
    }
}
