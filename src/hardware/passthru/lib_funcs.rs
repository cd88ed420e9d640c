use j2534_rust::{PassthruError, PASSTHRU_MSG};
use libloading::Library;
use std::os::raw::c_char;
use std::sync::Arc;
use std::{ffi::*, fmt};

/// Result which contains a PASSTHRU_ERROR in it's Err() variant
pub type PassthruResult<T> = Result<T, PassthruError>;

type PassThruOpenFn = unsafe extern "system" fn(name: *const c_void, device_id: *mut u32) -> i32;
type PassThruCloseFn = unsafe extern "system" fn(device_id: u32) -> i32;
type PassThruConnectFn = unsafe extern "system" fn(
    device_id: u32,
    protocol_id: u32,
    flags: u32,
    baudrate: u32,
    channel_id: *mut u32,
) -> i32;
type PassThruDisconnectFn = unsafe extern "system" fn(channel_id: u32) -> i32;
type PassThruReadMsgsFn = unsafe extern "system" fn(
    channel_id: u32,
    msgs: *mut PASSTHRU_MSG,
    num_msgs: *mut u32,
    timeout: u32,
) -> i32;
type PassThruWriteMsgsFn = unsafe extern "system" fn(
    channel_id: u32,
    msgs: *mut PASSTHRU_MSG,
    num_msgs: *mut u32,
    timeout: u32,
) -> i32;
type PassThruStartPeriodicMsgFn = unsafe extern "system" fn(
    channel_id: u32,
    msg: *const PASSTHRU_MSG,
    msg_id: *mut u32,
    time_interval: u32,
) -> i32;
type PassThruStartMsgFilterFn = unsafe extern "system" fn(
    channel_id: u32,
    filter_type: u32,
    m_msg: *const PASSTHRU_MSG,
    p_msg: *const PASSTHRU_MSG,
    fc_msg: *const PASSTHRU_MSG,
    filter_id: *mut u32,
) -> i32;
type PassThruReadVersionFn = unsafe extern "system" fn(
    device_id: u32,
    firmware_version: *mut c_char,
    dll_version: *mut c_char,
    api_version: *mut c_char,
) -> i32;
type PassThruGetLastErrorFn = unsafe extern "system" fn(error_description: *mut c_char) -> i32;
type PassThruIoctlFn = unsafe extern "system" fn(
    handle_id: u32,
    ioctl_id: u32,
    input: *mut c_void,
    output: *mut c_void,
) -> i32;

/// J2534 IOCTL ids used by the tester
pub mod ioctl_id {
    pub const SET_CONFIG: u32 = 0x02;
    pub const READ_VBATT: u32 = 0x03;
    pub const FIVE_BAUD_INIT: u32 = 0x04;
    pub const FAST_INIT: u32 = 0x05;
    pub const CLEAR_TX_BUFFER: u32 = 0x07;
    pub const CLEAR_RX_BUFFER: u32 = 0x08;
    pub const CLEAR_PERIODIC_MSGS: u32 = 0x09;
    pub const CLEAR_MSG_FILTERS: u32 = 0x0A;
}

/// Flow control filter type
const FLOW_CONTROL_FILTER: u32 = 0x03;

#[derive(Debug)]
pub struct DrvVersion {
    /// Library (DLL) Version
    pub dll_version: String,
    /// Passthru API Version (Only V04.04 is supported currently!)
    pub api_version: String,
    /// Device Firmware version
    pub fw_version: String,
}

#[derive(Clone)]
pub struct PassthruDrv {
    /// Loaded library to interface with the device
    lib: Arc<Library>,
    /// Is the device currently connected?
    is_connected: bool,
    /// Open device connection
    open_fn: PassThruOpenFn,
    /// Close device connection
    close_fn: PassThruCloseFn,
    /// Connect a communication channel
    connect_fn: PassThruConnectFn,
    /// Disconnect a communication channel
    disconnect_fn: PassThruDisconnectFn,
    /// Read messages from a communication channel
    read_msg_fn: PassThruReadMsgsFn,
    /// Write messages to a communication channel
    write_msg_fn: PassThruWriteMsgsFn,
    /// Start a periodic message
    start_periodic_fn: PassThruStartPeriodicMsgFn,
    /// Start a filter on a channel
    start_filter_fn: PassThruStartMsgFilterFn,
    /// Get the last driver error description if ERR_FAILED
    get_last_err_fn: PassThruGetLastErrorFn,
    /// IOCTL
    ioctl_fn: PassThruIoctlFn,
    /// Get driver details
    read_version_fn: PassThruReadVersionFn,
}

impl fmt::Debug for PassthruDrv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassthruDrv")
            .field("is_connected", &self.is_connected)
            .field("library", &self.lib)
            .finish()
    }
}

#[inline(always)]
/// Function to reduce boilerplate code with returning a Result
fn ret_res<T>(res: i32, ret: T) -> PassthruResult<T> {
    match res {
        0 => Ok(ret),
        _ => {
            log::debug!("Function call failed with status {}", res);
            Err(PassthruError::try_from(res as u32).unwrap_or(PassthruError::ERR_FAILED))
        }
    }
}

/// Reads a NUL terminated string out of a driver buffer
fn c_string(buf: &[u8]) -> String {
    CStr::from_bytes_until_nul(buf)
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(buf).into_owned())
}

impl PassthruDrv {
    pub fn load_lib(path: String) -> Result<PassthruDrv, libloading::Error> {
        log::debug!("Opening function library {}", path);
        let lib = unsafe { Library::new(path)? };
        unsafe {
            let open_fn = *lib.get::<PassThruOpenFn>(b"PassThruOpen\0")?.into_raw();
            let close_fn = *lib.get::<PassThruCloseFn>(b"PassThruClose\0")?.into_raw();
            let connect_fn = *lib.get::<PassThruConnectFn>(b"PassThruConnect\0")?.into_raw();
            let disconnect_fn = *lib.get::<PassThruDisconnectFn>(b"PassThruDisconnect\0")?.into_raw();
            let read_msg_fn = *lib.get::<PassThruReadMsgsFn>(b"PassThruReadMsgs\0")?.into_raw();
            let write_msg_fn = *lib.get::<PassThruWriteMsgsFn>(b"PassThruWriteMsgs\0")?.into_raw();
            let start_periodic_fn = *lib
                .get::<PassThruStartPeriodicMsgFn>(b"PassThruStartPeriodicMsg\0")?
                .into_raw();
            let start_filter_fn = *lib
                .get::<PassThruStartMsgFilterFn>(b"PassThruStartMsgFilter\0")?
                .into_raw();
            let get_last_err_fn = *lib.get::<PassThruGetLastErrorFn>(b"PassThruGetLastError\0")?.into_raw();
            let ioctl_fn = *lib.get::<PassThruIoctlFn>(b"PassThruIoctl\0")?.into_raw();
            let read_version_fn = *lib.get::<PassThruReadVersionFn>(b"PassThruReadVersion\0")?.into_raw();

            Ok(PassthruDrv {
                lib: Arc::new(lib),
                is_connected: false,
                open_fn,
                close_fn,
                connect_fn,
                disconnect_fn,
                read_msg_fn,
                write_msg_fn,
                start_periodic_fn,
                start_filter_fn,
                get_last_err_fn,
                ioctl_fn,
                read_version_fn,
            })
        }
    }

    pub fn open(&mut self) -> PassthruResult<u32> {
        log::debug!("PT_OPEN called");
        let mut id: u32 = 0;
        let res = unsafe { (self.open_fn)(std::ptr::null(), &mut id) };
        if res == 0x00 {
            self.is_connected = true;
        }
        ret_res(res, id)
    }

    pub fn close(&mut self, dev_id: u32) -> PassthruResult<()> {
        log::debug!("PT_CLOSE called. Device ID: {}", dev_id);
        let res = unsafe { (self.close_fn)(dev_id) };
        if res == 0x00 {
            self.is_connected = false;
        }
        ret_res(res, ())
    }

    pub fn write_messages(&self, channel_id: u32, msgs: &mut [PASSTHRU_MSG], timeout: u32) -> PassthruResult<usize> {
        log::debug!(
            "PT_WRITE_MSGS called. Channel ID: {}, {} msgs, Timeout {}",
            channel_id,
            msgs.len(),
            timeout
        );
        if msgs.is_empty() {
            return Ok(0);
        }
        let mut msg_count: u32 = msgs.len() as u32;
        let res = unsafe { (self.write_msg_fn)(channel_id, msgs.as_mut_ptr(), &mut msg_count, timeout) };
        ret_res(res, msg_count as usize)
    }

    /// Reads one message. `None` if nothing arrived within the timeout
    pub fn read_message(&self, channel_id: u32, timeout: u32) -> PassthruResult<Option<PASSTHRU_MSG>> {
        let mut msg_count: u32 = 1;
        let mut msg = PASSTHRU_MSG::default();
        let res = unsafe { (self.read_msg_fn)(channel_id, &mut msg, &mut msg_count, timeout) };
        if res == PassthruError::ERR_BUFFER_EMPTY as i32 || res == PassthruError::ERR_TIMEOUT as i32 {
            return Ok(None);
        }
        ret_res(res, (msg_count == 1).then_some(msg))
    }

    pub fn get_version(&self, dev_id: u32) -> PassthruResult<DrvVersion> {
        log::debug!("PT_GET_VERSION called. Device ID {}", dev_id);
        let mut firmware_version: [u8; 80] = [0; 80];
        let mut dll_version: [u8; 80] = [0; 80];
        let mut api_version: [u8; 80] = [0; 80];
        let res = unsafe {
            (self.read_version_fn)(
                dev_id,
                firmware_version.as_mut_ptr() as *mut c_char,
                dll_version.as_mut_ptr() as *mut c_char,
                api_version.as_mut_ptr() as *mut c_char,
            )
        };
        ret_res(
            res,
            DrvVersion {
                api_version: c_string(&api_version),
                dll_version: c_string(&dll_version),
                fw_version: c_string(&firmware_version),
            },
        )
    }

    pub fn get_last_error(&self) -> PassthruResult<String> {
        let mut err: [u8; 80] = [0; 80];
        let res = unsafe { (self.get_last_err_fn)(err.as_mut_ptr() as *mut c_char) };
        ret_res(res, c_string(&err))
    }

    pub fn ioctl(&self, handle_id: u32, ioctl_id: u32, input: *mut c_void, output: *mut c_void) -> PassthruResult<()> {
        log::debug!("PT_IOCTL called. handle ID {}, IOCTL ID {}", handle_id, ioctl_id);
        let res = unsafe { (self.ioctl_fn)(handle_id, ioctl_id, input, output) };
        ret_res(res, ())
    }

    /// Returns channel ID
    pub fn connect(&self, dev_id: u32, protocol_id: u32, flags: u32, baud: u32) -> PassthruResult<u32> {
        log::debug!(
            "PT_CONNECT called. Device ID {}, protocol {}, flags: {:08X?}, baud: {}",
            dev_id,
            protocol_id,
            flags,
            baud
        );
        let mut channel_id: u32 = 0;
        let res = unsafe { (self.connect_fn)(dev_id, protocol_id, flags, baud, &mut channel_id) };
        ret_res(res, channel_id)
    }

    pub fn disconnect(&self, channel_id: u32) -> PassthruResult<()> {
        log::debug!("PT_DISCONNECT called. Channel ID {}", channel_id);
        ret_res(unsafe { (self.disconnect_fn)(channel_id) }, ())
    }

    /// Returns message ID
    pub fn start_periodic_msg(&self, channel_id: u32, msg: &PASSTHRU_MSG, time_interval: u32) -> PassthruResult<u32> {
        log::debug!("PT_START_PERIODIC_MSG called. Channel ID {}, interval {}", channel_id, time_interval);
        let mut msg_id: u32 = 0;
        let res = unsafe { (self.start_periodic_fn)(channel_id, msg, &mut msg_id, time_interval) };
        ret_res(res, msg_id)
    }

    /// Returns filter ID
    pub fn start_msg_filter(
        &self,
        channel_id: u32,
        filter_type: u32,
        mask: &PASSTHRU_MSG,
        pattern: &PASSTHRU_MSG,
        flow_control: Option<&PASSTHRU_MSG>,
    ) -> PassthruResult<u32> {
        log::debug!("PT_START_MSG_FILTER called. Channel ID {}", channel_id);
        if filter_type == FLOW_CONTROL_FILTER && flow_control.is_none() {
            return Err(PassthruError::ERR_INVALID_FILTER_ID);
        }
        let fc: *const PASSTHRU_MSG = match flow_control {
            Some(fc) => fc,
            None => std::ptr::null(),
        };
        let mut filter_id: u32 = 0;
        let res = unsafe { (self.start_filter_fn)(channel_id, filter_type, mask, pattern, fc, &mut filter_id) };
        ret_res(res, filter_id)
    }
}
