#![allow(dead_code)]

use obd_conformance::hardware::simulation::{SimLink, SimReply, SimulatedAdapter};
use obd_conformance::{DelayConfig, EventLog, ProtocolCatalog, ProtocolTag, ScanTable, Session, TesterConfig};

/// Positive response to SID 01 PID 00
pub const SUPPORTED_PIDS: [u8; 6] = [0x41, 0x00, 0xBE, 0x1F, 0xA8, 0x13];

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// J1850 VPW / ISO 9141 response of the ECU at source address `src`
pub fn legacy_reply(src: u8, delay_ms: u32, payload: &[u8]) -> SimReply {
    let mut data = vec![0x48, 0x6B, src];
    data.extend_from_slice(payload);
    SimReply::new(delay_ms, &data)
}

/// ISO 15765 response of the ECU with CAN identifier `can_id`
pub fn can_reply(can_id: u32, delay_ms: u32, payload: &[u8]) -> SimReply {
    let mut data = can_id.to_be_bytes().to_vec();
    data.extend_from_slice(payload);
    SimReply::new(delay_ms, &data)
}

/// Service payload of a request frame
pub fn service(frame: &[u8], header_size: usize) -> &[u8] {
    frame.get(header_size..).unwrap_or(&[])
}

pub fn link(tag: ProtocolTag) -> SimLink {
    SimLink::for_protocol(tag)
}

pub fn config(table: ScanTable) -> TesterConfig {
    TesterConfig {
        scan_table: table,
        delays: DelayConfig::none(),
        ..Default::default()
    }
}

/// Opened session over the simulated vehicle, probing in canonical order
pub fn session_with(sim: &SimulatedAdapter, config: TesterConfig) -> (Session<SimulatedAdapter>, EventLog) {
    init_logging();
    let log = EventLog::new();
    let mut session = Session::new(sim.clone(), config)
        .with_catalog(ProtocolCatalog::with_rotation(0))
        .with_event_handler(log.clone());
    session.open().unwrap();
    (session, log)
}

pub fn session(sim: &SimulatedAdapter, table: ScanTable) -> (Session<SimulatedAdapter>, EventLog) {
    session_with(sim, config(table))
}
