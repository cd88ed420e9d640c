//! Module for the frames exchanged with a diagnostic adapter
//!
//! A [WireFrame] is the adapter's native message: the raw header bytes of the
//! network followed by the diagnostic payload, plus the transmit flags on the
//! way out and the receive status and hardware timestamp on the way in.
//!
//! The flag values follow SAE J2534 v04.04 so that frames can be handed to a
//! passthru library without translation.

use bitflags::bitflags;

/// Communication channel result
pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug, Clone, thiserror::Error)]
/// Error produced by a communication channel
pub enum ChannelError {
    /// Timeout when writing data to the channel
    #[error("timeout writing to channel")]
    WriteTimeout,
    /// Timeout when reading from the channel
    #[error("timeout reading from channel")]
    ReadTimeout,
    /// The channel's Rx buffer is empty. Only applies when read timeout is 0
    #[error("channel's Receive buffer is empty")]
    BufferEmpty,
    /// An ISO 15765 transmission could not find a matching flow control filter
    #[error("no flow control filter matches the transmitted frame")]
    NoFlowControl,
    /// Unsupported channel request
    #[error("unsupported channel request")]
    UnsupportedRequest,
    /// The interface is not open
    #[error("channel's interface is not open")]
    InterfaceNotOpen,
    /// The channel handle is unknown to the adapter
    #[error("invalid channel handle {0}")]
    InvalidChannel(u32),
    /// Underlying API error with hardware
    #[error("underlying {api_name} API error ({code}): {desc}")]
    APIError {
        /// Name of the API EG: 'Passthru'
        api_name: String,
        /// Internal API error code
        code: u32,
        /// API error description
        desc: String,
    },
}

impl ChannelError {
    /// True if the error only means that nothing arrived in time. This is the
    /// normal way a receive loop ends and is never a transport failure.
    pub fn is_no_response(&self) -> bool {
        matches!(self, ChannelError::ReadTimeout | ChannelError::BufferEmpty)
    }
}

/// Physical / transport protocol families an adapter can connect with
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, strum_macros::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u32)]
pub enum TransportKind {
    /// SAE J1850 VPW (10.4 kbps)
    #[strum(serialize = "J1850VPW")]
    J1850Vpw = 0x01,
    /// SAE J1850 PWM (41.6 kbps)
    #[strum(serialize = "J1850PWM")]
    J1850Pwm = 0x02,
    /// ISO 9141-2 K-line
    #[strum(serialize = "ISO9141")]
    Iso9141 = 0x03,
    /// ISO 14230-4 K-line (KWP2000)
    #[strum(serialize = "ISO14230")]
    Iso14230 = 0x04,
    /// Raw CAN frames
    #[strum(serialize = "CAN")]
    Can = 0x05,
    /// ISO 15765-4 segmented transport over CAN
    #[strum(serialize = "ISO15765")]
    Iso15765 = 0x06,
}

impl TransportKind {
    /// Passthru protocol ID of the transport
    pub fn protocol_id(&self) -> u32 {
        *self as u32
    }

    /// Reverse of [TransportKind::protocol_id]
    pub fn from_protocol_id(id: u32) -> Option<Self> {
        match id {
            0x01 => Some(Self::J1850Vpw),
            0x02 => Some(Self::J1850Pwm),
            0x03 => Some(Self::Iso9141),
            0x04 => Some(Self::Iso14230),
            0x05 => Some(Self::Can),
            0x06 => Some(Self::Iso15765),
            _ => None,
        }
    }

    /// True for the two K-line transports
    pub fn is_kline(&self) -> bool {
        matches!(self, Self::Iso9141 | Self::Iso14230)
    }
}

bitflags! {
    /// Flags passed to the adapter when connecting a channel
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct ConnectFlags: u32 {
        /// Use 29bit CAN identifiers
        const CAN_29BIT_ID = 0x0000_0100;
        /// Adapter does not generate / check the K-line checksum
        const ISO9141_NO_CHECKSUM = 0x0000_0200;
        /// Accept both 11bit and 29bit identifiers
        const CAN_ID_BOTH = 0x0000_0800;
        /// Use the K-line only (no L-line) during initialisation
        const ISO9141_K_LINE_ONLY = 0x0000_1000;
    }
}

bitflags! {
    /// Transmit flags of an outbound frame
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct TxFlags: u32 {
        /// Pad ISO 15765 frames to 8 bytes
        const ISO15765_FRAME_PAD = 0x0000_0040;
        /// ISO 15765 extended addressing
        const ISO15765_ADDR_TYPE = 0x0000_0080;
        /// Frame uses a 29bit CAN identifier
        const CAN_29BIT_ID = 0x0000_0100;
    }
}

bitflags! {
    /// Receive status reported by the adapter for an inbound frame
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct RxStatus: u32 {
        /// Loopback of a frame this channel transmitted
        const TX_MSG_TYPE = 0x0000_0001;
        /// Start of message indication (K-line) / first frame indication (ISO 15765)
        const START_OF_MESSAGE = 0x0000_0002;
        /// Break received (J1850)
        const RX_BREAK = 0x0000_0004;
        /// Transmission of the request has completed
        const TX_INDICATION = 0x0000_0008;
        /// Received ISO 15765 frame was not padded correctly
        const ISO15765_PADDING_ERROR = 0x0000_0010;
        /// ISO 15765 extended addressing
        const ISO15765_ADDR_TYPE = 0x0000_0080;
        /// Frame uses a 29bit CAN identifier
        const CAN_29BIT_ID = 0x0000_0100;
    }
}

/// Frame as seen by the adapter
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WireFrame {
    /// Protocol the frame travels on
    pub protocol: Option<TransportKind>,
    /// Transmit flags (outbound)
    pub tx_flags: TxFlags,
    /// Receive status (inbound)
    pub rx_status: RxStatus,
    /// Hardware timestamp in microseconds (inbound)
    pub timestamp_us: u32,
    /// Header bytes followed by the payload
    pub data: Vec<u8>,
}

impl WireFrame {
    /// Creates an outbound frame
    pub fn new(protocol: TransportKind, tx_flags: TxFlags, data: &[u8]) -> Self {
        Self {
            protocol: Some(protocol),
            tx_flags,
            rx_status: RxStatus::empty(),
            timestamp_us: 0,
            data: data.to_vec(),
        }
    }

    /// Creates an inbound frame, as an adapter would report it
    pub fn received(protocol: TransportKind, rx_status: RxStatus, timestamp_us: u32, data: &[u8]) -> Self {
        Self {
            protocol: Some(protocol),
            tx_flags: TxFlags::empty(),
            rx_status,
            timestamp_us,
            data: data.to_vec(),
        }
    }

    /// Number of bytes in the frame (header included)
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if the frame carries no bytes at all
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True if this is the adapter's loopback of a transmitted frame
    pub fn is_echo(&self) -> bool {
        self.rx_status.contains(RxStatus::TX_MSG_TYPE)
    }

    /// Header bytes of the frame, if it is long enough to carry one
    pub fn header(&self, header_size: usize) -> Option<&[u8]> {
        self.data.get(..header_size)
    }

    /// Bytes following the header
    pub fn payload(&self, header_size: usize) -> &[u8] {
        self.data.get(header_size..).unwrap_or(&[])
    }

    /// CAN identifier stored in the first 4 bytes (ISO 15765 / CAN frames)
    pub fn can_id(&self) -> Option<u32> {
        let b = self.data.get(..4)?;
        Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}
