//! Simulation hardware for testing the tester itself
//!
//! [SimulatedAdapter] behaves like a passthru adapter connected to a scripted
//! vehicle. Responders are attached to a [SimLink] and answer every request
//! transmitted on a channel connected with the same transport, addressing
//! and bit rate, once the channel went through the link's initialisation. Time is virtual: every frame carries a timestamp derived
//! from the reply delays, so response time checks are deterministic.
//!
//! Clones share the same simulated vehicle, so a test can keep a clone to
//! inspect what the session transmitted.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::channel::{ChannelError, ChannelResult, ConnectFlags, RxStatus, TransportKind, WireFrame};
use crate::protocol::{InitFlags, ProtocolDescriptor, ProtocolTag};

use super::{Adapter, ConfigParam, FilterKind, HardwareError, HardwareResult, Ioctl, IoctlOutput, VersionInfo};

/// K-line initialisation ECUs of a link wake up on
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SimInit {
    /// Always listening
    None,
    /// 5 baud address
    FiveBaud,
    /// Fast init wake up pattern and start communication request
    Fast,
}

/// Network a simulated responder is attached to
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SimLink {
    /// Transport
    pub kind: TransportKind,
    /// 29bit CAN identifiers
    pub extended: bool,
    /// Bit rate
    pub baud: u32,
    /// Initialisation the ECUs answer
    pub init: SimInit,
}

impl SimLink {
    /// Link a catalog protocol connects to
    pub fn for_protocol(tag: ProtocolTag) -> Self {
        let desc = ProtocolDescriptor::canonical(tag);
        let init = if desc.init_flags.contains(InitFlags::FIVE_BAUD_INIT) {
            SimInit::FiveBaud
        } else if desc.init_flags.contains(InitFlags::FAST_INIT) {
            SimInit::Fast
        } else {
            SimInit::None
        };
        Self {
            kind: desc.kind,
            extended: desc.is_extended_can(),
            baud: desc.baud,
            init,
        }
    }

    fn with_init(self, init: SimInit) -> Self {
        Self { init, ..self }
    }
}

/// One frame a simulated vehicle sends in reply to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimReply {
    /// Time since the end of the request, or of the previous reply
    pub delay_ms: u32,
    /// Header and payload
    pub data: Vec<u8>,
    /// Receive status reported with the frame
    pub rx_status: RxStatus,
}

impl SimReply {
    /// Complete message
    pub fn new(delay_ms: u32, data: &[u8]) -> Self {
        Self {
            delay_ms,
            data: data.to_vec(),
            rx_status: RxStatus::empty(),
        }
    }

    /// ISO 15765 first frame indication of the ECU with CAN identifier `can_id`
    pub fn first_frame(delay_ms: u32, can_id: u32) -> Self {
        Self {
            delay_ms,
            data: can_id.to_be_bytes().to_vec(),
            rx_status: RxStatus::START_OF_MESSAGE,
        }
    }

    /// Adds receive status bits
    pub fn with_status(mut self, status: RxStatus) -> Self {
        self.rx_status |= status;
        self
    }
}

type Responder = Box<dyn FnMut(&[u8]) -> Vec<SimReply> + Send + Sync>;

struct SimChannel {
    link: SimLink,
    loopback: bool,
    filters: Vec<u32>,
}

struct SimState {
    open: bool,
    clock_us: u32,
    next_handle: u32,
    battery_mv: u32,
    channels: HashMap<u32, SimChannel>,
    rx_queue: VecDeque<(u32, WireFrame)>,
    responders: Vec<(SimLink, Responder)>,
    sent: Vec<WireFrame>,
    connects: Vec<SimLink>,
    periodic: HashMap<u32, (u32, WireFrame)>,
    receive_error: Option<ChannelError>,
}

impl SimState {
    fn has_responder(&self, link: SimLink) -> bool {
        self.responders.iter().any(|(l, _)| *l == link)
    }

    fn set_link(&mut self, channel: u32, link: SimLink) {
        if let Some(c) = self.channels.get_mut(&channel) {
            c.link = link;
        }
    }

    fn channel(&self, channel: u32) -> ChannelResult<&SimChannel> {
        self.channels.get(&channel).ok_or(ChannelError::InvalidChannel(channel))
    }

    fn handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }
}

/// Scripted adapter
#[derive(Clone)]
pub struct SimulatedAdapter {
    state: Arc<RwLock<SimState>>,
}

impl std::fmt::Debug for SimulatedAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedAdapter").finish_non_exhaustive()
    }
}

impl Default for SimulatedAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> ChannelError {
    ChannelError::APIError {
        api_name: "Simulation".into(),
        code: 0,
        desc: "simulation state lock poisoned".into(),
    }
}

impl SimulatedAdapter {
    /// Creates an adapter with no vehicle attached
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(SimState {
                open: false,
                clock_us: 1_000_000,
                next_handle: 0,
                battery_mv: 12_600,
                channels: HashMap::new(),
                rx_queue: VecDeque::new(),
                responders: Vec::new(),
                sent: Vec::new(),
                connects: Vec::new(),
                periodic: HashMap::new(),
                receive_error: None,
            })),
        }
    }

    fn write(&self) -> ChannelResult<RwLockWriteGuard<'_, SimState>> {
        self.state.write().map_err(|_| poisoned())
    }

    fn read(&self) -> ChannelResult<RwLockReadGuard<'_, SimState>> {
        self.state.read().map_err(|_| poisoned())
    }

    /// Attaches a responder to a link. It receives every request transmitted
    /// on that link (header included) and returns the replies of all ECUs
    pub fn add_responder<F>(&self, link: SimLink, responder: F)
    where
        F: FnMut(&[u8]) -> Vec<SimReply> + Send + Sync + 'static,
    {
        if let Ok(mut s) = self.write() {
            s.responders.push((link, Box::new(responder)));
        }
    }

    /// Removes every responder
    pub fn clear_responders(&self) {
        if let Ok(mut s) = self.write() {
            s.responders.clear();
        }
    }

    /// Sets the battery voltage in millivolts
    pub fn set_battery_mv(&self, mv: u32) {
        if let Ok(mut s) = self.write() {
            s.battery_mv = mv;
        }
    }

    /// The next receive call fails with `err`
    pub fn fail_next_receive(&self, err: ChannelError) {
        if let Ok(mut s) = self.write() {
            s.receive_error = Some(err);
        }
    }

    /// Every frame transmitted so far
    pub fn sent_frames(&self) -> Vec<WireFrame> {
        self.read().map(|s| s.sent.clone()).unwrap_or_default()
    }

    /// Links of every connect so far
    pub fn connections(&self) -> Vec<SimLink> {
        self.read().map(|s| s.connects.clone()).unwrap_or_default()
    }

    /// Number of open channels
    pub fn open_channels(&self) -> usize {
        self.read().map(|s| s.channels.len()).unwrap_or_default()
    }

    /// Periodic messages currently running
    pub fn periodic_messages(&self) -> Vec<WireFrame> {
        self.read()
            .map(|s| s.periodic.values().map(|(_, f)| f.clone()).collect())
            .unwrap_or_default()
    }

    /// Filters of a channel
    pub fn filter_count(&self, channel: u32) -> usize {
        self.read()
            .ok()
            .and_then(|s| s.channels.get(&channel).map(|c| c.filters.len()))
            .unwrap_or_default()
    }
}

impl Adapter for SimulatedAdapter {
    fn open(&mut self) -> HardwareResult<()> {
        let mut s = self.write().map_err(|_| HardwareError::DeviceNotOpen)?;
        s.open = true;
        Ok(())
    }

    fn close(&mut self) -> HardwareResult<()> {
        let mut s = self.write().map_err(|_| HardwareError::DeviceNotOpen)?;
        s.open = false;
        s.channels.clear();
        s.rx_queue.clear();
        s.periodic.clear();
        Ok(())
    }

    fn read_version(&mut self) -> HardwareResult<VersionInfo> {
        let s = self.read().map_err(|_| HardwareError::DeviceNotOpen)?;
        if !s.open {
            return Err(HardwareError::DeviceNotOpen);
        }
        Ok(VersionInfo {
            firmware: "SIM 1.0".into(),
            driver: "simulation".into(),
            api: "04.04".into(),
        })
    }

    fn connect(&mut self, kind: TransportKind, flags: ConnectFlags, baud: u32) -> ChannelResult<u32> {
        let mut s = self.write()?;
        if !s.open {
            return Err(ChannelError::InterfaceNotOpen);
        }
        let link = SimLink {
            kind,
            extended: flags.contains(ConnectFlags::CAN_29BIT_ID),
            baud,
            init: SimInit::None,
        };
        let handle = s.handle();
        s.channels.insert(
            handle,
            SimChannel {
                link,
                loopback: false,
                filters: Vec::new(),
            },
        );
        s.connects.push(link);
        Ok(handle)
    }

    fn disconnect(&mut self, channel: u32) -> ChannelResult<()> {
        let mut s = self.write()?;
        s.channels.remove(&channel).ok_or(ChannelError::InvalidChannel(channel))?;
        s.rx_queue.retain(|(c, _)| *c != channel);
        s.periodic.retain(|_, (c, _)| *c != channel);
        Ok(())
    }

    fn send_frames(&mut self, channel: u32, frames: &[WireFrame], _timeout_ms: u32) -> ChannelResult<usize> {
        let mut guard = self.write()?;
        let s = &mut *guard;
        let (link, loopback) = {
            let c = s.channel(channel)?;
            (c.link, c.loopback)
        };
        let id_flag = if link.extended { RxStatus::CAN_29BIT_ID } else { RxStatus::empty() };
        for frame in frames {
            s.clock_us = s.clock_us.wrapping_add(1000);
            s.sent.push(frame.clone());
            if loopback {
                let echo = WireFrame::received(link.kind, RxStatus::TX_MSG_TYPE | id_flag, s.clock_us, &frame.data);
                s.rx_queue.push_back((channel, echo));
            }
            let mut replies = Vec::new();
            for (l, responder) in s.responders.iter_mut() {
                if *l == link {
                    replies.extend(responder(&frame.data));
                }
            }
            let mut cursor = s.clock_us;
            for reply in replies {
                let start = cursor.wrapping_add(reply.delay_ms * 1000);
                let mut end = start;
                if link.kind.is_kline() && reply.rx_status.is_empty() {
                    let som = WireFrame::received(link.kind, RxStatus::START_OF_MESSAGE, start, &[]);
                    s.rx_queue.push_back((channel, som));
                    // Roughly one millisecond per byte at 10.4 kbps
                    end = start.wrapping_add(reply.data.len() as u32 * 1000);
                }
                let rx = WireFrame::received(link.kind, reply.rx_status | id_flag, end, &reply.data);
                s.rx_queue.push_back((channel, rx));
                cursor = end;
            }
            s.clock_us = cursor;
        }
        Ok(frames.len())
    }

    fn receive_frame(&mut self, channel: u32, _timeout_ms: u32) -> ChannelResult<WireFrame> {
        let mut s = self.write()?;
        s.channel(channel)?;
        if let Some(e) = s.receive_error.take() {
            return Err(e);
        }
        match s.rx_queue.iter().position(|(c, _)| *c == channel) {
            Some(pos) => s.rx_queue.remove(pos).map(|(_, f)| f).ok_or(ChannelError::ReadTimeout),
            None => Err(ChannelError::ReadTimeout),
        }
    }

    fn ioctl(&mut self, channel: u32, request: Ioctl) -> ChannelResult<IoctlOutput> {
        let mut s = self.write()?;
        if let Ioctl::ReadBatteryVoltage = request {
            return Ok(IoctlOutput::Voltage(s.battery_mv));
        }
        let link = s.channel(channel)?.link;
        match request {
            Ioctl::ClearTxBuffer => {}
            Ioctl::ClearRxBuffer => s.rx_queue.retain(|(c, _)| *c != channel),
            Ioctl::ClearMsgFilters => {
                if let Some(c) = s.channels.get_mut(&channel) {
                    c.filters.clear();
                }
            }
            Ioctl::ClearPeriodicMsgs => s.periodic.retain(|_, (c, _)| *c != channel),
            Ioctl::SetConfig(params) => {
                for (param, value) in params {
                    if param == ConfigParam::Loopback {
                        if let Some(c) = s.channels.get_mut(&channel) {
                            c.loopback = value != 0;
                        }
                    }
                }
            }
            Ioctl::FiveBaudInit(_) => {
                let link = link.with_init(SimInit::FiveBaud);
                if !s.has_responder(link) {
                    return Err(init_failed("5 baud"));
                }
                s.set_link(channel, link);
                return Ok(IoctlOutput::KeyBytes(vec![0x08, 0x08]));
            }
            Ioctl::FastInit(_) => {
                let link = link.with_init(SimInit::Fast);
                if !s.has_responder(link) {
                    return Err(init_failed("fast"));
                }
                s.set_link(channel, link);
                let clock = s.clock_us;
                return Ok(IoctlOutput::Frame(WireFrame::received(
                    link.kind,
                    RxStatus::empty(),
                    clock,
                    &[0x83, 0xF1, 0x10, 0xC1, 0xE9, 0x8F],
                )));
            }
            Ioctl::ReadBatteryVoltage => {}
        }
        Ok(IoctlOutput::None)
    }

    fn start_msg_filter(
        &mut self,
        channel: u32,
        _kind: FilterKind,
        _mask: &WireFrame,
        _pattern: &WireFrame,
        _flow_control: Option<&WireFrame>,
    ) -> ChannelResult<u32> {
        let mut s = self.write()?;
        s.channel(channel)?;
        let id = s.handle();
        if let Some(c) = s.channels.get_mut(&channel) {
            c.filters.push(id);
        }
        Ok(id)
    }

    fn start_periodic_msg(&mut self, channel: u32, frame: &WireFrame, _interval_ms: u32) -> ChannelResult<u32> {
        let mut s = self.write()?;
        s.channel(channel)?;
        let id = s.handle();
        s.periodic.insert(id, (channel, frame.clone()));
        Ok(id)
    }
}

fn init_failed(kind: &str) -> ChannelError {
    ChannelError::APIError {
        api_name: "Simulation".into(),
        code: 0x07,
        desc: format!("no ECU answered the {kind} initialisation"),
    }
}
