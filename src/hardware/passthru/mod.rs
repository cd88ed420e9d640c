//! The passthru API (Also known as SAE J2534) is an adapter protocol used by most OBD conformance testers.
//!
//! This module provides support for V04.04 of the API, including experimental support for OSX and Linux, used by
//! [Macchina-J2534][1]
//!
//! [1]: http://github.com/rnd-ash/macchina-J2534
//!
//! The tester uses the following communication protocols of the API:
//! * J1850 PWM
//! * J1850 VPW
//! * ISO9141
//! * ISO14230-4
//! * ISO15765
//!
//! however it should be noted that adapters might only support a range of these protocols. So
//! querying the [super::HardwareCapabilities] matrix should be used to determine which protocols
//! are supported

use std::ffi::c_void;

use j2534_rust::{PassthruError, PASSTHRU_MSG};

use crate::channel::{ChannelError, ChannelResult, ConnectFlags, RxStatus, TransportKind, TxFlags, WireFrame};
use crate::session::DEVICE_HANDLE;

use self::lib_funcs::{ioctl_id, PassthruDrv};

use super::{
    Adapter, FilterKind, HardwareCapabilities, HardwareError, HardwareInfo, HardwareResult, Ioctl, IoctlOutput,
    VersionInfo,
};

mod lib_funcs;

/// Passthru API device scanner
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct PassthruScanner {
    devices: Vec<PassthruInfo>,
}

impl PassthruScanner {
    #[cfg(unix)]
    /// Creates a passthru scanner, reading the device descriptions in `~/.passthru`
    pub fn new() -> Self {
        match std::fs::read_dir(shellexpand::tilde("~/.passthru").to_string()) {
            Ok(list) => Self {
                devices: list
                    // Remove files that cannot be read
                    .filter_map(|p| p.ok())
                    // Filter any files that are not json files
                    .filter(|p| p.file_name().to_string_lossy().ends_with(".json"))
                    // Attempt to read a PassthruInfo from each json file found
                    .filter_map(|p| PassthruInfo::new(&p.path()).ok())
                    .collect(),
            },
            Err(_) => Self::default(),
        }
    }

    #[cfg(windows)]
    /// Creates a passthru scanner, reading the registered V04.04 drivers
    pub fn new() -> Self {
        use winreg::enums::HKEY_LOCAL_MACHINE;
        use winreg::RegKey;

        let root = RegKey::predef(HKEY_LOCAL_MACHINE);
        let key = match root.open_subkey("SOFTWARE\\WOW6432Node\\PassThruSupport.04.04") {
            Ok(k) => k,
            Err(_) => match root.open_subkey("SOFTWARE\\PassThruSupport.04.04") {
                Ok(k) => k,
                Err(_) => return Self::default(),
            },
        };
        Self {
            devices: key
                .enum_keys()
                .filter_map(|k| k.ok())
                .filter_map(|name| key.open_subkey(name).ok())
                .filter_map(|k| PassthruInfo::new(&k).ok())
                .collect(),
        }
    }
}

impl super::HardwareScanner<PassthruDevice> for PassthruScanner {
    fn list_devices(&self) -> Vec<HardwareInfo> {
        self.devices.iter().map(|x| x.into()).collect()
    }

    fn open_device_by_index(&self, idx: usize) -> HardwareResult<PassthruDevice> {
        match self.devices.get(idx) {
            Some(info) => PassthruDevice::load(info),
            None => Err(HardwareError::DeviceNotFound),
        }
    }

    fn open_device_by_name(&self, name: &str) -> HardwareResult<PassthruDevice> {
        match self.devices.iter().find(|s| s.name == name) {
            Some(info) => PassthruDevice::load(info),
            None => Err(HardwareError::DeviceNotFound),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct PassthruInfo {
    name: String,
    vendor: String,
    function_lib: String,
    iso15765: bool,
    iso14230: bool,
    iso9141: bool,
    j1850pwm: bool,
    j1850vpw: bool,
}

impl PassthruInfo {
    #[cfg(unix)]
    pub fn new(path: &std::path::Path) -> HardwareResult<Self> {
        let s = std::fs::read_to_string(path).map_err(|_| HardwareError::DeviceNotFound)?;
        let json = serde_json::from_str::<serde_json::Value>(&s).map_err(|_| HardwareError::DeviceNotFound)?;
        let lib = match json["FUNCTION_LIB"].as_str() {
            Some(s) => shellexpand::tilde(s).to_string(),
            None => return Err(HardwareError::DeviceNotFound),
        };
        Ok(PassthruInfo {
            function_lib: lib,
            name: json["NAME"].as_str().unwrap_or("UNKNOWN PASSTHRU DEVICE").to_string(),
            vendor: json["VENDOR"].as_str().unwrap_or("UNKNOWN PASSTHRU DEVICE VENDOR").to_string(),
            iso15765: Self::read_bool(&json, "ISO15765"),
            iso14230: Self::read_bool(&json, "ISO14230"),
            iso9141: Self::read_bool(&json, "ISO9141"),
            j1850pwm: Self::read_bool(&json, "J1850PWM"),
            j1850vpw: Self::read_bool(&json, "J1850VPW"),
        })
    }

    #[cfg(unix)]
    #[inline]
    fn read_bool(j: &serde_json::Value, s: &str) -> bool {
        j[s].as_bool().unwrap_or(false)
    }

    #[cfg(windows)]
    pub fn new(k: &winreg::RegKey) -> HardwareResult<Self> {
        let function_lib: String = k.get_value("FunctionLibrary").map_err(|_| HardwareError::DeviceNotFound)?;
        Ok(PassthruInfo {
            function_lib,
            name: k.get_value("Name").unwrap_or_else(|_| "UNKNOWN PASSTHRU DEVICE".to_string()),
            vendor: k.get_value("Vendor").unwrap_or_else(|_| "UNKNOWN PASSTHRU DEVICE VENDOR".to_string()),
            iso15765: Self::read_bool(k, "ISO15765"),
            iso14230: Self::read_bool(k, "ISO14230"),
            iso9141: Self::read_bool(k, "ISO9141"),
            j1850pwm: Self::read_bool(k, "J1850PWM"),
            j1850vpw: Self::read_bool(k, "J1850VPW"),
        })
    }

    #[cfg(windows)]
    #[inline]
    fn read_bool(k: &winreg::RegKey, name: &str) -> bool {
        let val: u32 = match k.get_value(name) {
            Ok(b) => b,
            Err(_) => return false,
        };
        val != 0
    }
}

impl From<&PassthruInfo> for HardwareInfo {
    fn from(info: &PassthruInfo) -> Self {
        HardwareInfo {
            name: info.name.clone(),
            vendor: info.vendor.clone(),
            capabilities: HardwareCapabilities {
                iso_tp: info.iso15765,
                kline: info.iso9141,
                kline_kwp: info.iso14230,
                sae_j1850: info.j1850pwm && info.j1850vpw,
            },
        }
    }
}

/// SCONFIG
#[repr(C)]
struct SConfig {
    parameter: u32,
    value: u32,
}

/// SCONFIG_LIST
#[repr(C)]
struct SConfigList {
    num_of_params: u32,
    config_ptr: *mut SConfig,
}

/// SBYTE_ARRAY
#[repr(C)]
struct SByteArray {
    num_of_bytes: u32,
    byte_ptr: *mut u8,
}

fn to_msg(frame: &WireFrame) -> PASSTHRU_MSG {
    let mut msg = PASSTHRU_MSG::default();
    msg.protocol_id = frame.protocol.map(|p| p.protocol_id()).unwrap_or_default();
    msg.tx_flags = frame.tx_flags.bits();
    let n = frame.data.len().min(msg.data.len());
    msg.data[..n].copy_from_slice(&frame.data[..n]);
    msg.data_size = n as u32;
    msg
}

fn from_msg(msg: &PASSTHRU_MSG) -> WireFrame {
    let n = (msg.data_size as usize).min(msg.data.len());
    WireFrame {
        protocol: TransportKind::from_protocol_id(msg.protocol_id),
        tx_flags: TxFlags::from_bits_truncate(msg.tx_flags),
        rx_status: RxStatus::from_bits_truncate(msg.rx_status),
        timestamp_us: msg.timestamp,
        data: msg.data[..n].to_vec(),
    }
}

/// Passthru device
#[derive(Debug)]
pub struct PassthruDevice {
    info: HardwareInfo,
    drv: PassthruDrv,
    device_idx: Option<u32>,
}

impl PassthruDevice {
    /// Loads the device's function library. The device is opened by [Adapter::open]
    fn load(info: &PassthruInfo) -> HardwareResult<Self> {
        let drv = PassthruDrv::load_lib(info.function_lib.clone())?;
        Ok(Self {
            info: info.into(),
            drv,
            device_idx: None,
        })
    }

    /// Device information
    pub fn info(&self) -> &HardwareInfo {
        &self.info
    }

    fn device(&self) -> ChannelResult<u32> {
        self.device_idx.ok_or(ChannelError::InterfaceNotOpen)
    }

    /// Converts a driver error, asking the driver for a description of ERR_FAILED
    fn channel_err(&self, e: PassthruError) -> ChannelError {
        match e {
            PassthruError::ERR_BUFFER_EMPTY => ChannelError::BufferEmpty,
            PassthruError::ERR_TIMEOUT => ChannelError::WriteTimeout,
            PassthruError::ERR_FAILED => ChannelError::APIError {
                api_name: "Passthru".into(),
                code: e as u32,
                desc: self.drv.get_last_error().unwrap_or_else(|_| e.to_string()),
            },
            _ => ChannelError::APIError {
                api_name: "Passthru".into(),
                code: e as u32,
                desc: e.to_string(),
            },
        }
    }

    fn raw_ioctl(&self, handle: u32, id: u32, input: *mut c_void, output: *mut c_void) -> ChannelResult<()> {
        self.drv.ioctl(handle, id, input, output).map_err(|e| self.channel_err(e))
    }
}

impl Drop for PassthruDevice {
    #[allow(unused_must_use)] // If this function fails, then device is already closed, so don't care!
    fn drop(&mut self) {
        if let Some(idx) = self.device_idx.take() {
            self.drv.close(idx);
        }
    }
}

impl From<PassthruError> for HardwareError {
    fn from(err: PassthruError) -> Self {
        HardwareError::APIError {
            code: err as u32,
            desc: err.to_string(),
        }
    }
}

impl Adapter for PassthruDevice {
    fn open(&mut self) -> HardwareResult<()> {
        if self.device_idx.is_none() {
            self.device_idx = Some(self.drv.open()?);
        }
        Ok(())
    }

    fn close(&mut self) -> HardwareResult<()> {
        if let Some(idx) = self.device_idx.take() {
            self.drv.close(idx)?;
        }
        Ok(())
    }

    fn read_version(&mut self) -> HardwareResult<VersionInfo> {
        let idx = self.device_idx.ok_or(HardwareError::DeviceNotOpen)?;
        let v = self.drv.get_version(idx)?;
        Ok(VersionInfo {
            firmware: v.fw_version,
            driver: v.dll_version,
            api: v.api_version,
        })
    }

    fn connect(&mut self, kind: TransportKind, flags: ConnectFlags, baud: u32) -> ChannelResult<u32> {
        let idx = self.device()?;
        self.drv
            .connect(idx, kind.protocol_id(), flags.bits(), baud)
            .map_err(|e| self.channel_err(e))
    }

    fn disconnect(&mut self, channel: u32) -> ChannelResult<()> {
        self.drv.disconnect(channel).map_err(|e| self.channel_err(e))
    }

    fn send_frames(&mut self, channel: u32, frames: &[WireFrame], timeout_ms: u32) -> ChannelResult<usize> {
        let mut msgs: Vec<PASSTHRU_MSG> = frames.iter().map(to_msg).collect();
        self.drv
            .write_messages(channel, &mut msgs, timeout_ms)
            .map_err(|e| self.channel_err(e))
    }

    fn receive_frame(&mut self, channel: u32, timeout_ms: u32) -> ChannelResult<WireFrame> {
        match self.drv.read_message(channel, timeout_ms) {
            Ok(Some(msg)) => Ok(from_msg(&msg)),
            Ok(None) if timeout_ms == 0 => Err(ChannelError::BufferEmpty),
            Ok(None) => Err(ChannelError::ReadTimeout),
            Err(e) => Err(self.channel_err(e)),
        }
    }

    #[allow(trivial_casts)]
    fn ioctl(&mut self, channel: u32, request: Ioctl) -> ChannelResult<IoctlOutput> {
        let null = std::ptr::null_mut();
        match request {
            Ioctl::ClearTxBuffer => self.raw_ioctl(channel, ioctl_id::CLEAR_TX_BUFFER, null, null)?,
            Ioctl::ClearRxBuffer => self.raw_ioctl(channel, ioctl_id::CLEAR_RX_BUFFER, null, null)?,
            Ioctl::ClearMsgFilters => self.raw_ioctl(channel, ioctl_id::CLEAR_MSG_FILTERS, null, null)?,
            Ioctl::ClearPeriodicMsgs => self.raw_ioctl(channel, ioctl_id::CLEAR_PERIODIC_MSGS, null, null)?,
            Ioctl::ReadBatteryVoltage => {
                let handle = if channel == DEVICE_HANDLE { self.device()? } else { channel };
                let mut output: u32 = 0;
                self.raw_ioctl(handle, ioctl_id::READ_VBATT, null, (&mut output) as *mut u32 as *mut c_void)?;
                return Ok(IoctlOutput::Voltage(output));
            }
            Ioctl::SetConfig(params) => {
                let mut configs: Vec<SConfig> = params
                    .iter()
                    .map(|(p, v)| SConfig {
                        parameter: *p as u32,
                        value: *v,
                    })
                    .collect();
                let mut list = SConfigList {
                    num_of_params: configs.len() as u32,
                    config_ptr: configs.as_mut_ptr(),
                };
                self.raw_ioctl(channel, ioctl_id::SET_CONFIG, (&mut list) as *mut SConfigList as *mut c_void, null)?;
            }
            Ioctl::FiveBaudInit(target) => {
                let mut address = [target];
                let mut key_bytes = [0u8; 2];
                let mut input = SByteArray {
                    num_of_bytes: 1,
                    byte_ptr: address.as_mut_ptr(),
                };
                let mut output = SByteArray {
                    num_of_bytes: key_bytes.len() as u32,
                    byte_ptr: key_bytes.as_mut_ptr(),
                };
                self.raw_ioctl(
                    channel,
                    ioctl_id::FIVE_BAUD_INIT,
                    (&mut input) as *mut SByteArray as *mut c_void,
                    (&mut output) as *mut SByteArray as *mut c_void,
                )?;
                let n = (output.num_of_bytes as usize).min(key_bytes.len());
                return Ok(IoctlOutput::KeyBytes(key_bytes[..n].to_vec()));
            }
            Ioctl::FastInit(frame) => {
                let mut input = to_msg(&frame);
                let mut output = PASSTHRU_MSG::default();
                self.raw_ioctl(
                    channel,
                    ioctl_id::FAST_INIT,
                    (&mut input) as *mut PASSTHRU_MSG as *mut c_void,
                    (&mut output) as *mut PASSTHRU_MSG as *mut c_void,
                )?;
                return Ok(IoctlOutput::Frame(from_msg(&output)));
            }
        }
        Ok(IoctlOutput::None)
    }

    fn start_msg_filter(
        &mut self,
        channel: u32,
        kind: FilterKind,
        mask: &WireFrame,
        pattern: &WireFrame,
        flow_control: Option<&WireFrame>,
    ) -> ChannelResult<u32> {
        let fc = flow_control.map(to_msg);
        self.drv
            .start_msg_filter(channel, kind as u32, &to_msg(mask), &to_msg(pattern), fc.as_ref())
            .map_err(|e| self.channel_err(e))
    }

    fn start_periodic_msg(&mut self, channel: u32, frame: &WireFrame, interval_ms: u32) -> ChannelResult<u32> {
        self.drv
            .start_periodic_msg(channel, &to_msg(frame), interval_ms)
            .map_err(|e| self.channel_err(e))
    }
}
