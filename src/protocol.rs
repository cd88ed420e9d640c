//! Protocol catalog
//!
//! The fixed set of OBD protocols a vehicle may speak, and the ordered
//! candidate lists protocol determination walks through. The order of a
//! candidate list rotates on every build so repeated runs probe the
//! protocols in different orders.

use bitflags::bitflags;

use crate::channel::{ConnectFlags, TransportKind};
use crate::config;

/// Unique tag of each protocol in the catalog
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, strum_macros::Display, strum_macros::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProtocolTag {
    /// SAE J1850 PWM
    #[strum(serialize = "J1850 PWM")]
    J1850Pwm,
    /// SAE J1850 VPW
    #[strum(serialize = "J1850 VPW")]
    J1850Vpw,
    /// ISO 9141-2
    #[strum(serialize = "ISO 9141-2")]
    Iso9141,
    /// ISO 14230-4, 5 baud initialisation
    #[strum(serialize = "ISO 14230-4 (5 baud init)")]
    Iso14230,
    /// ISO 14230-4, fast initialisation
    #[strum(serialize = "ISO 14230-4 (fast init)")]
    Iso14230Fast,
    /// ISO 15765-4, 11bit identifiers, 500 kbps
    #[strum(serialize = "ISO 15765-4 (11bit, 500K)")]
    Iso15765,
    /// ISO 15765-4, 29bit identifiers, 500 kbps
    #[strum(serialize = "ISO 15765-4 (29bit, 500K)")]
    Iso15765Ext,
    /// ISO 15765-4, 11bit identifiers, 250 kbps
    #[strum(serialize = "ISO 15765-4 (11bit, 250K)")]
    Iso15765At250k,
    /// ISO 15765-4, 29bit identifiers, 250 kbps
    #[strum(serialize = "ISO 15765-4 (29bit, 250K)")]
    Iso15765ExtAt250k,
}

bitflags! {
    /// Initialisation flags of a protocol
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct InitFlags: u32 {
        /// 29bit CAN identifiers
        const EXTENDED_ID = 0x01;
        /// 5 baud (slow) initialisation
        const FIVE_BAUD_INIT = 0x02;
        /// Fast initialisation
        const FAST_INIT = 0x04;
    }
}

/// How responses of a protocol are framed
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ProtocolFamily {
    /// Byte oriented links (J1850, K-line) with a 3 byte header
    Legacy,
    /// ISO 15765 segmented transport with a 4 byte CAN identifier header
    Segmented,
}

/// Regulatory scan table
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, strum_macros::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScanTable {
    /// US OBD-II
    #[default]
    #[strum(serialize = "US")]
    Us,
    /// EOBD, 500 and 250 kbps CAN
    #[strum(serialize = "EU")]
    Eu,
    /// EOBD, 250 kbps CAN only
    #[strum(serialize = "EU-250K")]
    Eu250k,
}

/// One candidate protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolDescriptor {
    /// Unique protocol tag
    pub tag: ProtocolTag,
    /// Transport the adapter connects with
    pub kind: TransportKind,
    /// Initialisation flags
    pub init_flags: InitFlags,
    /// Bytes of header in front of each message
    pub header_size: usize,
    /// Network bit rate
    pub baud: u32,
    /// Channel handle, set while connected
    pub channel_id: Option<u32>,
    /// Filter handles, set while connected
    pub filter_ids: Vec<u32>,
}

const fn descriptor(tag: ProtocolTag, kind: TransportKind, init_flags: InitFlags, header_size: usize, baud: u32) -> ProtocolDescriptor {
    ProtocolDescriptor {
        tag,
        kind,
        init_flags,
        header_size,
        baud,
        channel_id: None,
        filter_ids: Vec::new(),
    }
}

impl ProtocolDescriptor {
    /// Canonical descriptor of a protocol, with no handles assigned
    pub fn canonical(tag: ProtocolTag) -> Self {
        use ProtocolTag::*;
        match tag {
            J1850Pwm => descriptor(tag, TransportKind::J1850Pwm, InitFlags::empty(), 3, 41_600),
            J1850Vpw => descriptor(tag, TransportKind::J1850Vpw, InitFlags::empty(), 3, 10_400),
            Iso9141 => descriptor(tag, TransportKind::Iso9141, InitFlags::FIVE_BAUD_INIT, 3, 10_400),
            Iso14230 => descriptor(tag, TransportKind::Iso14230, InitFlags::FIVE_BAUD_INIT, 3, 10_400),
            Iso14230Fast => descriptor(tag, TransportKind::Iso14230, InitFlags::FAST_INIT, 3, 10_400),
            Iso15765 => descriptor(tag, TransportKind::Iso15765, InitFlags::empty(), 4, 500_000),
            Iso15765Ext => descriptor(tag, TransportKind::Iso15765, InitFlags::EXTENDED_ID, 4, 500_000),
            Iso15765At250k => descriptor(tag, TransportKind::Iso15765, InitFlags::empty(), 4, 250_000),
            Iso15765ExtAt250k => descriptor(tag, TransportKind::Iso15765, InitFlags::EXTENDED_ID, 4, 250_000),
        }
    }

    /// Display name, as printed by [ProtocolTag]
    pub fn name(&self) -> String {
        self.tag.to_string()
    }

    /// Framing family of the protocol
    pub fn family(&self) -> ProtocolFamily {
        match self.kind {
            TransportKind::Iso15765 | TransportKind::Can => ProtocolFamily::Segmented,
            _ => ProtocolFamily::Legacy,
        }
    }

    /// True for ISO 15765 with 29bit identifiers
    pub fn is_extended_can(&self) -> bool {
        self.kind == TransportKind::Iso15765 && self.init_flags.contains(InitFlags::EXTENDED_ID)
    }

    /// True for the low speed K-line protocols, whose ECU sessions need time to expire
    pub fn is_kline(&self) -> bool {
        self.kind.is_kline()
    }

    /// True if the adapter reports a start of message indication the response
    /// time has to be measured from (K-line links)
    pub fn measures_from_start_of_message(&self) -> bool {
        self.kind.is_kline()
    }

    /// True if the protocol uses an ISO 14230 format byte in its header
    pub fn has_format_byte(&self) -> bool {
        self.kind == TransportKind::Iso14230
    }

    /// Flags passed to the adapter on connect
    pub fn connect_flags(&self) -> ConnectFlags {
        if self.init_flags.contains(InitFlags::EXTENDED_ID) {
            ConnectFlags::CAN_29BIT_ID
        } else {
            ConnectFlags::empty()
        }
    }

    /// Minimum time an ECU must wait before responding
    pub fn min_response_ms(&self) -> u32 {
        if self.is_kline() {
            config::KLINE_P2_MIN_MS
        } else {
            0
        }
    }

    /// Maximum time an ECU may take to respond
    pub fn max_response_ms(&self) -> u32 {
        match self.kind {
            TransportKind::J1850Pwm | TransportKind::J1850Vpw => config::J1850_P2_MAX_MS,
            TransportKind::Iso9141 | TransportKind::Iso14230 => config::KLINE_P2_MAX_MS,
            TransportKind::Iso15765 | TransportKind::Can => config::CAN_P2_MAX_MS,
        }
    }

    /// Idle time before a request is sent
    pub fn request_delay_ms(&self) -> u32 {
        match self.kind {
            TransportKind::J1850Pwm | TransportKind::J1850Vpw => config::J1850_REQUEST_DELAY_MS,
            TransportKind::Iso9141 | TransportKind::Iso14230 => config::KLINE_REQUEST_DELAY_MS,
            TransportKind::Iso15765 | TransportKind::Can => config::CAN_REQUEST_DELAY_MS,
        }
    }

    /// Window extension after a response pending negative response
    pub fn response_pending_ms(&self) -> u32 {
        match self.family() {
            ProtocolFamily::Legacy => config::LEGACY_RESPONSE_PENDING_MS,
            ProtocolFamily::Segmented => config::SEGMENTED_RESPONSE_PENDING_MS,
        }
    }

    /// Clears the run time handles
    pub fn clear_handles(&mut self) {
        self.channel_id = None;
        self.filter_ids.clear();
    }
}

const US_PROTOCOLS: [ProtocolTag; 7] = [
    ProtocolTag::J1850Pwm,
    ProtocolTag::J1850Vpw,
    ProtocolTag::Iso9141,
    ProtocolTag::Iso14230,
    ProtocolTag::Iso14230Fast,
    ProtocolTag::Iso15765,
    ProtocolTag::Iso15765Ext,
];

const EU_PROTOCOLS: [ProtocolTag; 9] = [
    ProtocolTag::J1850Pwm,
    ProtocolTag::J1850Vpw,
    ProtocolTag::Iso9141,
    ProtocolTag::Iso14230,
    ProtocolTag::Iso14230Fast,
    ProtocolTag::Iso15765,
    ProtocolTag::Iso15765Ext,
    ProtocolTag::Iso15765At250k,
    ProtocolTag::Iso15765ExtAt250k,
];

const EU_250K_PROTOCOLS: [ProtocolTag; 7] = [
    ProtocolTag::J1850Pwm,
    ProtocolTag::J1850Vpw,
    ProtocolTag::Iso9141,
    ProtocolTag::Iso14230,
    ProtocolTag::Iso14230Fast,
    ProtocolTag::Iso15765At250k,
    ProtocolTag::Iso15765ExtAt250k,
];

/// Number of rotation rows per scan table
pub const ROTATION_ROWS: usize = 10;

// Each row is a permutation of the indices of the scan table's protocol list
const US_ROTATION: [[usize; 7]; ROTATION_ROWS] = [
    [0, 1, 2, 3, 4, 5, 6],
    [6, 5, 4, 3, 2, 1, 0],
    [5, 6, 0, 1, 2, 3, 4],
    [2, 3, 4, 5, 6, 0, 1],
    [1, 0, 3, 2, 5, 4, 6],
    [4, 2, 0, 6, 1, 3, 5],
    [3, 6, 1, 4, 0, 5, 2],
    [6, 0, 5, 1, 4, 2, 3],
    [2, 5, 1, 6, 3, 0, 4],
    [4, 3, 6, 2, 5, 1, 0],
];

const EU_ROTATION: [[usize; 9]; ROTATION_ROWS] = [
    [0, 1, 2, 3, 4, 5, 6, 7, 8],
    [8, 7, 6, 5, 4, 3, 2, 1, 0],
    [5, 6, 7, 8, 0, 1, 2, 3, 4],
    [2, 3, 4, 5, 6, 7, 8, 0, 1],
    [1, 0, 3, 2, 5, 4, 7, 6, 8],
    [7, 8, 5, 6, 3, 4, 1, 2, 0],
    [4, 2, 0, 8, 6, 1, 3, 5, 7],
    [3, 7, 1, 5, 0, 8, 2, 6, 4],
    [6, 0, 8, 1, 7, 2, 5, 4, 3],
    [0, 5, 2, 7, 4, 1, 8, 3, 6],
];

const EU_250K_ROTATION: [[usize; 7]; ROTATION_ROWS] = [
    [0, 1, 2, 3, 4, 5, 6],
    [5, 6, 0, 1, 2, 3, 4],
    [6, 5, 4, 3, 2, 1, 0],
    [2, 3, 4, 5, 6, 0, 1],
    [1, 0, 3, 2, 5, 4, 6],
    [3, 6, 1, 4, 0, 5, 2],
    [4, 2, 0, 6, 1, 3, 5],
    [6, 0, 5, 1, 4, 2, 3],
    [4, 3, 6, 2, 5, 1, 0],
    [2, 5, 1, 6, 3, 0, 4],
];

impl ScanTable {
    /// Protocols probed under this scan table, in canonical order
    pub fn protocols(&self) -> &'static [ProtocolTag] {
        match self {
            ScanTable::Us => &US_PROTOCOLS,
            ScanTable::Eu => &EU_PROTOCOLS,
            ScanTable::Eu250k => &EU_250K_PROTOCOLS,
        }
    }

    fn rotation_row(&self, row: usize) -> &'static [usize] {
        match self {
            ScanTable::Us => &US_ROTATION[row],
            ScanTable::Eu => &EU_ROTATION[row],
            ScanTable::Eu250k => &EU_250K_ROTATION[row],
        }
    }
}

/// Builds candidate lists. Keeps the rotating index between builds,
/// so a catalog should live as long as the tester process.
#[derive(Debug, Clone, Default)]
pub struct ProtocolCatalog {
    rotation: usize,
}

impl ProtocolCatalog {
    /// Creates a catalog starting at the first rotation row
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a catalog starting at a given rotation row
    pub fn with_rotation(rotation: usize) -> Self {
        Self {
            rotation: rotation % ROTATION_ROWS,
        }
    }

    /// Rotation row the next build will use
    pub fn rotation(&self) -> usize {
        self.rotation
    }

    /// Builds the ordered candidate list for a scan table and advances the rotation
    pub fn build_list(&mut self, table: ScanTable) -> Vec<ProtocolDescriptor> {
        let protocols = table.protocols();
        let list = table
            .rotation_row(self.rotation)
            .iter()
            .map(|idx| ProtocolDescriptor::canonical(protocols[*idx]))
            .collect();
        log::debug!("Protocol list for {} scan table built from rotation row {}", table, self.rotation);
        self.rotation = (self.rotation + 1) % ROTATION_ROWS;
        list
    }
}
