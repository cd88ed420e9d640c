//! Tester session
//!
//! A [Session] owns the adapter and every piece of state that lives longer
//! than a single request: the candidate protocols and which of them is
//! targeted, the ECU table, the response store, the connect fingerprint and
//! the keep-alive message.

use std::time::Duration;

use log::{debug, error, info, warn};

use crate::channel::{ChannelResult, TransportKind, TxFlags, WireFrame};
use crate::config::{self, TesterConfig};
use crate::events::{EventHandler, TesterEvent, VoidHandler};
use crate::fingerprint::ConnectFingerprint;
use crate::hardware::{Adapter, ConfigParam, FilterKind, Ioctl, IoctlOutput, VersionInfo};
use crate::helpers::retry;
use crate::protocol::{InitFlags, ProtocolCatalog, ProtocolDescriptor, ProtocolFamily};
use crate::request::{RequestFlags, ServiceRequest, TESTER_ADDRESS};
use crate::store::{ResponseStore, ServiceResponse};
use crate::timing::{EcuTiming, EcuTimingTable};
use crate::verdict::Verdict;
use crate::{engine, prober, TesterResult};

/// Handle value addressing the device itself rather than a channel
pub const DEVICE_HANDLE: u32 = 0;

/// Conformance test session over one adapter
pub struct Session<A: Adapter> {
    pub(crate) adapter: A,
    pub(crate) config: TesterConfig,
    pub(crate) catalog: ProtocolCatalog,
    pub(crate) protocols: Vec<ProtocolDescriptor>,
    pub(crate) active: Option<usize>,
    pub(crate) determined: bool,
    pub(crate) determining: bool,
    pub(crate) timing: EcuTimingTable,
    pub(crate) store: ResponseStore,
    pub(crate) responders: usize,
    pub(crate) ecu_count: usize,
    pub(crate) fingerprint: Option<ConnectFingerprint>,
    pub(crate) target_addresses: Vec<u8>,
    pub(crate) padding_error_reported: bool,
    pub(crate) transport_fault: bool,
    pub(crate) keep_alive: Option<u32>,
    pub(crate) events: Box<dyn EventHandler>,
}

impl<A: Adapter> std::fmt::Debug for Session<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("protocol", &self.protocol().map(|p| p.tag))
            .field("determined", &self.determined)
            .field("ecu_count", &self.ecu_count)
            .finish()
    }
}

impl<A: Adapter> Session<A> {
    /// Creates a session. The adapter is not touched until [Session::open]
    pub fn new(adapter: A, config: TesterConfig) -> Self {
        let store = ResponseStore::new(ProtocolFamily::Legacy, config.max_ecus);
        Self {
            adapter,
            config,
            catalog: ProtocolCatalog::new(),
            protocols: Vec::new(),
            active: None,
            determined: false,
            determining: false,
            timing: EcuTimingTable::default(),
            store,
            responders: 0,
            ecu_count: 0,
            fingerprint: None,
            target_addresses: Vec::new(),
            padding_error_reported: false,
            transport_fault: false,
            keep_alive: None,
            events: Box::new(VoidHandler),
        }
    }

    /// Replaces the event handler
    pub fn with_event_handler<H: EventHandler + 'static>(mut self, handler: H) -> Self {
        self.events = Box::new(handler);
        self
    }

    /// Replaces the protocol catalog, to start from a specific rotation
    pub fn with_catalog(mut self, catalog: ProtocolCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Opens the adapter, logging its version and the battery voltage
    pub fn open(&mut self) -> TesterResult<VersionInfo> {
        self.adapter.open()?;
        let version = self.adapter.read_version()?;
        info!(
            "Adapter firmware {}, driver {}, API {}",
            version.firmware, version.driver, version.api
        );
        match self.adapter.ioctl(DEVICE_HANDLE, Ioctl::ReadBatteryVoltage) {
            Ok(IoctlOutput::Voltage(mv)) => {
                if mv < config::MIN_BATTERY_MV {
                    warn!("Battery voltage {:.2} V is too low for reliable results", mv as f32 / 1000.0);
                } else {
                    info!("Battery voltage {:.2} V", mv as f32 / 1000.0);
                }
            }
            Ok(other) => warn!("Unexpected battery voltage reply {:?}", other),
            Err(e) => warn!("Could not read battery voltage: {}", e),
        }
        Ok(version)
    }

    /// Disconnects everything and closes the adapter
    pub fn close(&mut self) -> TesterResult<()> {
        self.log_timing_summary();
        self.disconnect_all();
        self.determined = false;
        self.adapter.close()?;
        Ok(())
    }

    /// Runs protocol determination. See [crate::prober]
    pub fn determine_protocol(&mut self) -> Verdict {
        prober::determine_protocol(self)
    }

    /// Executes a request on the targeted protocol. See [crate::engine]
    pub fn execute(&mut self, request: &ServiceRequest, flags: RequestFlags) -> Verdict {
        engine::execute(self, request, flags)
    }

    /// Checks the vehicle still answers SID 01 PID 00, without disturbing the keep-alive
    pub fn verify_link_active(&mut self) -> Verdict {
        let v = self.execute(
            &ServiceRequest::probe(),
            RequestFlags::NO_PERIODIC_DISABLE | RequestFlags::RETURN_AFTER_ALL_RESPONSES,
        );
        if v == Verdict::Fail {
            error!("Vehicle link is no longer active");
            if let Some(tag) = self.protocol().map(|p| p.tag) {
                self.emit(TesterEvent::LinkLost(tag));
            }
        }
        v
    }

    /// Clears diagnostic information (SID 04). The request is repeated while
    /// some ECUs refuse it with a conditions-not-correct response
    pub fn clear_codes(&mut self) -> Verdict {
        let request = match ServiceRequest::new(0x04, &[]) {
            Ok(r) => r,
            Err(e) => {
                error!("{}", e);
                return Verdict::Fail;
            }
        };
        let backoff = Duration::from_millis(self.config.delays.probe_retry_backoff_ms as u64);
        let ecu_count = self.ecu_count;
        let (verdict, acknowledged) = retry(
            config::PROBE_ATTEMPTS,
            backoff,
            |(v, acked): &(Verdict, usize)| v.is_usable() && *acked < ecu_count,
            |attempt| {
                let v = self.execute(&request, RequestFlags::NORMAL);
                let acked = (0..self.store.len())
                    .filter(|slot| self.store.response(*slot, 0x04).map(|r| r.received).unwrap_or(false))
                    .count();
                debug!("Clear codes attempt {}: {} of {} ECUs acknowledged", attempt + 1, acked, ecu_count);
                (v, acked)
            },
        );
        if verdict.is_usable() && acknowledged < self.ecu_count {
            warn!("Only {} of {} ECUs acknowledged clearing diagnostic information", acknowledged, self.ecu_count);
            return verdict.worst(Verdict::Errors);
        }
        verdict
    }

    /// Logs the response timing of every ECU of the last request
    pub fn log_timing_summary(&self) {
        for (slot, t) in self.timing.iter() {
            let id = self.store.ecu_id(slot).unwrap_or_default();
            match t.average_ms() {
                Some(avg) => info!(
                    "ECU 0x{:X}: {} responses, average {} ms, longest {} ms, {} too soon, {} too late",
                    id, t.response_count, avg, t.longest_response_ms, t.too_soon, t.too_late
                ),
                None => info!("ECU 0x{:X}: no responses timed", id),
            }
        }
    }

    /// Tester configuration
    pub fn config(&self) -> &TesterConfig {
        &self.config
    }

    /// The adapter
    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// The adapter, mutably
    pub fn adapter_mut(&mut self) -> &mut A {
        &mut self.adapter
    }

    /// Protocol currently targeted by the engine
    pub fn protocol(&self) -> Option<&ProtocolDescriptor> {
        self.active.and_then(|idx| self.protocols.get(idx))
    }

    /// Candidate list of the last determination cycle
    pub fn candidates(&self) -> &[ProtocolDescriptor] {
        &self.protocols
    }

    /// True once protocol determination succeeded
    pub fn is_determined(&self) -> bool {
        self.determined
    }

    /// Number of ECUs that responded to the last request
    pub fn responder_count(&self) -> usize {
        self.responders
    }

    /// Number of OBD ECUs found by protocol determination
    pub fn ecu_count(&self) -> usize {
        self.ecu_count
    }

    /// Number of ECU slots in use
    pub fn ecu_slots(&self) -> usize {
        self.store.len()
    }

    /// Numeric identity of the ECU in a slot
    pub fn ecu_id(&self, slot: usize) -> Option<u32> {
        self.store.ecu_id(slot)
    }

    /// Response of the ECU in a slot to a service
    pub fn response(&self, slot: usize, sid: u8) -> Option<&ServiceResponse> {
        self.store.response(slot, sid)
    }

    /// The response store
    pub fn store(&self) -> &ResponseStore {
        &self.store
    }

    /// Timing record of the ECU in a slot, for the last request
    pub fn timing(&self, slot: usize) -> Option<&EcuTiming> {
        self.timing.get(slot)
    }

    /// Connect fingerprint captured by protocol determination
    pub fn fingerprint(&self) -> Option<&ConnectFingerprint> {
        self.fingerprint.as_ref()
    }

    /// Physical target addresses found on a 29bit CAN network
    pub fn target_addresses(&self) -> &[u8] {
        &self.target_addresses
    }

    /// Snapshot of the current connection: protocol and the headers of the
    /// ECUs that responded to the last request
    pub fn current_connection(&self) -> Option<ConnectFingerprint> {
        let protocol = self.protocol()?;
        let headers = self
            .timing
            .iter()
            .filter(|(_, t)| t.responded)
            .filter_map(|(slot, _)| self.store.header(slot).map(|h| h.to_vec()))
            .collect();
        Some(ConnectFingerprint::new(protocol.tag, protocol.header_size, headers))
    }

    pub(crate) fn emit(&mut self, e: TesterEvent) {
        self.events.on_event(e);
    }

    /// Logs a violation found outside of a request and reports it
    pub(crate) fn violation(&mut self, verdict: Verdict, desc: String) -> Verdict {
        match verdict {
            Verdict::Fail => error!("{}", desc),
            _ => warn!("{}", desc),
        }
        self.emit(TesterEvent::Violation { verdict, desc });
        verdict
    }

    /// Forgets every ECU, before a new protocol is tried
    pub(crate) fn reset_ecus(&mut self, family: ProtocolFamily) {
        self.store.reset(family);
        self.timing.clear();
        self.responders = 0;
    }

    /// Connects a candidate protocol and initialises the link
    pub(crate) fn connect_protocol(&mut self, idx: usize) -> ChannelResult<()> {
        let desc = self.protocols[idx].clone();
        debug!("Connecting {} at {} bps", desc.tag, desc.baud);
        let channel = self.adapter.connect(desc.kind, desc.connect_flags(), desc.baud)?;
        self.protocols[idx].channel_id = Some(channel);
        if let Err(e) = self.init_link(idx, channel) {
            // Leave nothing half connected behind
            let _ = self.adapter.disconnect(channel);
            self.protocols[idx].clear_handles();
            return Err(e);
        }
        Ok(())
    }

    fn init_link(&mut self, idx: usize, channel: u32) -> ChannelResult<()> {
        let desc = self.protocols[idx].clone();
        let mut params = vec![(ConfigParam::Loopback, 1)];
        match desc.kind {
            TransportKind::J1850Pwm => params.push((ConfigParam::NodeAddress, TESTER_ADDRESS as u32)),
            // Adapter timing is in 0.5 ms units
            TransportKind::Iso9141 | TransportKind::Iso14230 => params.extend_from_slice(&[
                (ConfigParam::P1Max, 20 * 2),
                (ConfigParam::P3Min, 55 * 2),
                (ConfigParam::P4Min, 5 * 2),
            ]),
            TransportKind::Iso15765 => params.extend_from_slice(&[(ConfigParam::Iso15765Bs, 0), (ConfigParam::Iso15765StMin, 0)]),
            _ => {}
        }
        self.adapter.ioctl(channel, Ioctl::SetConfig(params))?;

        let filters = self.install_filters(&desc, channel)?;
        self.protocols[idx].filter_ids = filters;

        if desc.init_flags.contains(InitFlags::FIVE_BAUD_INIT) {
            match self.adapter.ioctl(channel, Ioctl::FiveBaudInit(0x33))? {
                IoctlOutput::KeyBytes(kb) => debug!("5 baud init key bytes {:02X?}", kb),
                other => warn!("Unexpected 5 baud init reply {:?}", other),
            }
        } else if desc.init_flags.contains(InitFlags::FAST_INIT) {
            let start_comms = WireFrame::new(desc.kind, TxFlags::empty(), &[0xC1, 0x33, TESTER_ADDRESS, 0x81]);
            match self.adapter.ioctl(channel, Ioctl::FastInit(start_comms))? {
                IoctlOutput::Frame(f) if f.payload(desc.header_size).first() == Some(&0xC1) => {
                    debug!("Fast init response {:02X?}", f.data)
                }
                other => warn!("Unexpected fast init reply {:?}", other),
            }
        }
        Ok(())
    }

    pub(crate) fn install_filters(&mut self, desc: &ProtocolDescriptor, channel: u32) -> ChannelResult<Vec<u32>> {
        let mut ids = Vec::new();
        match desc.family() {
            ProtocolFamily::Legacy => {
                // Responses are addressed to the tester (K-line) or to the functional response address (J1850)
                let target = if desc.kind == TransportKind::Iso14230 { TESTER_ADDRESS } else { 0x6B };
                let mask = WireFrame::new(desc.kind, TxFlags::empty(), &[0x00, 0xFF, 0x00]);
                let pattern = WireFrame::new(desc.kind, TxFlags::empty(), &[0x00, target, 0x00]);
                ids.push(self.adapter.start_msg_filter(channel, FilterKind::Pass, &mask, &pattern, None)?);
            }
            ProtocolFamily::Segmented if desc.is_extended_can() => {
                let flags = TxFlags::ISO15765_FRAME_PAD | TxFlags::CAN_29BIT_ID;
                let mask = WireFrame::new(desc.kind, flags, &0x1FFF_FFFFu32.to_be_bytes());
                for addr in self.target_addresses.clone() {
                    let pattern = WireFrame::new(desc.kind, flags, &(0x18DA_F100 | addr as u32).to_be_bytes());
                    let fc = WireFrame::new(desc.kind, flags, &(0x18DA_00F1 | (addr as u32) << 8).to_be_bytes());
                    ids.push(self.adapter.start_msg_filter(channel, FilterKind::FlowControl, &mask, &pattern, Some(&fc))?);
                }
            }
            ProtocolFamily::Segmented => {
                let flags = TxFlags::ISO15765_FRAME_PAD;
                let mask = WireFrame::new(desc.kind, flags, &0x0000_07FFu32.to_be_bytes());
                for ecu in 0..config::MAX_ECUS as u32 {
                    let pattern = WireFrame::new(desc.kind, flags, &(0x7E8 + ecu).to_be_bytes());
                    let fc = WireFrame::new(desc.kind, flags, &(0x7E0 + ecu).to_be_bytes());
                    ids.push(self.adapter.start_msg_filter(channel, FilterKind::FlowControl, &mask, &pattern, Some(&fc))?);
                }
            }
        }
        Ok(ids)
    }

    /// Disconnects a candidate protocol, if connected
    pub(crate) fn disconnect_protocol(&mut self, idx: usize) -> ChannelResult<()> {
        let Some(channel) = self.protocols.get(idx).and_then(|p| p.channel_id) else {
            return Ok(());
        };
        if self.keep_alive.take().is_some() {
            let _ = self.adapter.ioctl(channel, Ioctl::ClearPeriodicMsgs);
        }
        self.protocols[idx].clear_handles();
        debug!("Disconnecting {}", self.protocols[idx].tag);
        self.adapter.disconnect(channel)
    }

    pub(crate) fn disconnect_all(&mut self) {
        for idx in 0..self.protocols.len() {
            if let Err(e) = self.disconnect_protocol(idx) {
                warn!("Disconnecting {} failed: {}", self.protocols[idx].tag, e);
            }
        }
        self.active = None;
    }

    /// Starts the keep-alive message on the targeted protocol
    pub(crate) fn start_keep_alive(&mut self) -> ChannelResult<()> {
        let Some(desc) = self.protocol() else {
            return Ok(());
        };
        let Some(channel) = desc.channel_id else {
            return Ok(());
        };
        let frame = match ServiceRequest::probe().build_frame(desc) {
            Ok(f) => f,
            Err(e) => {
                error!("Cannot build keep-alive message: {}", e);
                return Ok(());
            }
        };
        let handle = self
            .adapter
            .start_periodic_msg(channel, &frame, self.config.keep_alive_interval_ms)?;
        self.keep_alive = Some(handle);
        Ok(())
    }

    /// Stops the keep-alive message, if running
    pub(crate) fn stop_keep_alive(&mut self, channel: u32) -> ChannelResult<()> {
        if self.keep_alive.take().is_some() {
            self.adapter.ioctl(channel, Ioctl::ClearPeriodicMsgs)?;
        }
        Ok(())
    }
}
