//! The hardware module contains the adapter API the tester drives,
//! and the adapters shipped with the crate
//!
//! * [passthru] - SAE J2534 adapters (feature `passthru`)
//! * [simulation] - Scripted adapter used for testing the tester itself

#[cfg(feature = "passthru")]
pub mod passthru;
pub mod simulation;

use crate::channel::{ChannelResult, ConnectFlags, TransportKind, WireFrame};

/// Hardware API result
pub type HardwareResult<T> = std::result::Result<T, HardwareError>;

#[derive(Debug, thiserror::Error)]
/// Represents error that can be returned by Hardware API
pub enum HardwareError {
    /// Low level driver error
    #[error("Hardware API Error. Code {code}, Description: {desc}")]
    APIError {
        /// API Error code
        code: u32,
        /// API Error description
        desc: String,
    },
    /// Hardware not found
    #[error("Device not found")]
    DeviceNotFound,
    /// Function called on device that has not been opened
    #[error("Hardware device not open")]
    DeviceNotOpen,
    /// Lib loading error
    #[cfg(feature = "passthru")]
    #[error("LibLoading error: {0}")]
    LibLoadError(
        #[from]
        #[source]
        libloading::Error,
    ),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
/// Device hardware info used by [HardwareScanner]
pub struct HardwareInfo {
    /// Name of the hardware
    pub name: String,
    /// Vendor of the hardware
    pub vendor: String,
    /// Listed capabilities of the hardware
    pub capabilities: HardwareCapabilities,
}

/// Contains details about which vehicle networks
/// are supported by the physical hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct HardwareCapabilities {
    /// Supports ISO-TP
    pub iso_tp: bool,
    /// Supports standard Kline OBD (ISO9141)
    pub kline: bool,
    /// Supports KWP2000 over Kline (ISO14230)
    pub kline_kwp: bool,
    /// Supports J1850 VPW and J1850 PWM
    pub sae_j1850: bool,
}

/// Trait for scanning for supported adapters, given an API
pub trait HardwareScanner<T: Adapter> {
    /// Lists all scanned devices
    fn list_devices(&self) -> Vec<HardwareInfo>;
    /// Tries to open a device by a specific index.
    fn open_device_by_index(&self, idx: usize) -> HardwareResult<T>;
    /// Tries to open a device given the devices name
    fn open_device_by_name(&self, name: &str) -> HardwareResult<T>;
}

/// Version strings reported by the adapter
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionInfo {
    /// Device firmware version
    pub firmware: String,
    /// Library (driver) version
    pub driver: String,
    /// Adapter API version
    pub api: String,
}

/// Adapter configuration parameters (SAE J2534 `SCONFIG` ids)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, strum_macros::Display)]
#[repr(u32)]
pub enum ConfigParam {
    /// Network bit rate
    DataRate = 0x01,
    /// Echo transmitted frames back to the receive queue
    Loopback = 0x03,
    /// Tester node address (J1850 PWM)
    NodeAddress = 0x04,
    /// Maximum inter-byte time of ECU responses (K-line), 0.5 ms units
    P1Max = 0x07,
    /// Minimum time between end of ECU response and next tester request (K-line), 0.5 ms units
    P3Min = 0x0A,
    /// Minimum inter-byte time of tester requests (K-line), 0.5 ms units
    P4Min = 0x0C,
    /// ISO 15765 block size
    Iso15765Bs = 0x1E,
    /// ISO 15765 separation time
    Iso15765StMin = 0x1F,
}

/// Message filter types
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FilterKind {
    /// Frames matching mask/pattern are received
    Pass = 0x01,
    /// Frames matching mask/pattern are dropped
    Block = 0x02,
    /// ISO 15765 receive filter with the flow control identifier to answer with
    FlowControl = 0x03,
}

/// IOCTL requests understood by the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ioctl {
    /// Drop every frame queued for transmission
    ClearTxBuffer,
    /// Drop every frame waiting in the receive queue
    ClearRxBuffer,
    /// Remove all message filters of the channel
    ClearMsgFilters,
    /// Stop all periodic messages of the channel
    ClearPeriodicMsgs,
    /// Read the vehicle battery voltage (Pin 16)
    ReadBatteryVoltage,
    /// Set configuration parameters
    SetConfig(Vec<(ConfigParam, u32)>),
    /// Perform a 5 baud initialisation with the given target address
    FiveBaudInit(u8),
    /// Perform a fast initialisation, sending the given start communication request
    FastInit(WireFrame),
}

/// Output of a successful [Ioctl]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoctlOutput {
    /// The request produces no output
    None,
    /// Battery voltage in millivolts
    Voltage(u32),
    /// Key bytes returned by a 5 baud initialisation
    KeyBytes(Vec<u8>),
    /// ECU response to a fast initialisation
    Frame(WireFrame),
}

/// The adapter trait defines the functions the tester needs from a vehicle
/// communication interface. Every call blocks until it completes or times out.
pub trait Adapter {
    /// Opens the device session
    fn open(&mut self) -> HardwareResult<()>;

    /// Closes the device session
    fn close(&mut self) -> HardwareResult<()>;

    /// Reads the version strings of the device
    fn read_version(&mut self) -> HardwareResult<VersionInfo>;

    /// Connects a logical channel. Returns the channel handle
    fn connect(&mut self, kind: TransportKind, flags: ConnectFlags, baud: u32) -> ChannelResult<u32>;

    /// Disconnects a logical channel
    fn disconnect(&mut self, channel: u32) -> ChannelResult<()>;

    /// Transmits frames. Returns the number of frames sent
    fn send_frames(&mut self, channel: u32, frames: &[WireFrame], timeout_ms: u32) -> ChannelResult<usize>;

    /// Receives a single frame.
    ///
    /// ## Parameters
    /// * timeout_ms - Timeout for reading. If a value of 0 is used, it instructs the adapter to immediately
    ///   return with whatever was in its receiving buffer
    fn receive_frame(&mut self, channel: u32, timeout_ms: u32) -> ChannelResult<WireFrame>;

    /// Performs an IOCTL request on a channel
    fn ioctl(&mut self, channel: u32, request: Ioctl) -> ChannelResult<IoctlOutput>;

    /// Installs a message filter. Returns the filter handle
    fn start_msg_filter(
        &mut self,
        channel: u32,
        kind: FilterKind,
        mask: &WireFrame,
        pattern: &WireFrame,
        flow_control: Option<&WireFrame>,
    ) -> ChannelResult<u32>;

    /// Starts a message the adapter transmits on its own every `interval_ms`.
    /// Returns the periodic message handle. Stopped with [Ioctl::ClearPeriodicMsgs]
    fn start_periodic_msg(&mut self, channel: u32, frame: &WireFrame, interval_ms: u32) -> ChannelResult<u32>;
}

impl<T: Adapter + ?Sized> Adapter for Box<T> {
    fn open(&mut self) -> HardwareResult<()> {
        (**self).open()
    }

    fn close(&mut self) -> HardwareResult<()> {
        (**self).close()
    }

    fn read_version(&mut self) -> HardwareResult<VersionInfo> {
        (**self).read_version()
    }

    fn connect(&mut self, kind: TransportKind, flags: ConnectFlags, baud: u32) -> ChannelResult<u32> {
        (**self).connect(kind, flags, baud)
    }

    fn disconnect(&mut self, channel: u32) -> ChannelResult<()> {
        (**self).disconnect(channel)
    }

    fn send_frames(&mut self, channel: u32, frames: &[WireFrame], timeout_ms: u32) -> ChannelResult<usize> {
        (**self).send_frames(channel, frames, timeout_ms)
    }

    fn receive_frame(&mut self, channel: u32, timeout_ms: u32) -> ChannelResult<WireFrame> {
        (**self).receive_frame(channel, timeout_ms)
    }

    fn ioctl(&mut self, channel: u32, request: Ioctl) -> ChannelResult<IoctlOutput> {
        (**self).ioctl(channel, request)
    }

    fn start_msg_filter(
        &mut self,
        channel: u32,
        kind: FilterKind,
        mask: &WireFrame,
        pattern: &WireFrame,
        flow_control: Option<&WireFrame>,
    ) -> ChannelResult<u32> {
        (**self).start_msg_filter(channel, kind, mask, pattern, flow_control)
    }

    fn start_periodic_msg(&mut self, channel: u32, frame: &WireFrame, interval_ms: u32) -> ChannelResult<u32> {
        (**self).start_periodic_msg(channel, frame, interval_ms)
    }
}
