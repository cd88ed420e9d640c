mod common;

use common::*;
use obd_conformance::hardware::simulation::{SimReply, SimulatedAdapter};
use obd_conformance::{EventLog, ProtocolTag, RequestFlags, ScanTable, ServiceRequest, Session, TesterEvent, Verdict};

/// ISO 14230 response of the ECU at source address `src`, physical addressing
fn kwp_reply(src: u8, delay_ms: u32, payload: &[u8]) -> SimReply {
    let mut data = vec![0x80 | payload.len() as u8, 0xF1, src];
    data.extend_from_slice(payload);
    SimReply::new(delay_ms, &data)
}

/// Vehicle with ECU 0x10 on ISO 14230, woken up by fast init only
fn vehicle<F>(mut other: F) -> (SimulatedAdapter, Session<SimulatedAdapter>, EventLog)
where
    F: FnMut(&[u8]) -> Vec<SimReply> + Send + Sync + 'static,
{
    let sim = SimulatedAdapter::new();
    sim.add_responder(link(ProtocolTag::Iso14230Fast), move |req| match service(req, 3) {
        [0x01, 0x00] => vec![kwp_reply(0x10, 30, &SUPPORTED_PIDS)],
        s => other(s),
    });
    let (session, log) = session(&sim, ScanTable::Us);
    (sim, session, log)
}

#[test]
fn fast_init_vehicle_is_determined() {
    let (sim, mut session, log) = vehicle(|_| vec![]);

    assert_eq!(Verdict::Pass, session.determine_protocol());
    assert_eq!(Some(ProtocolTag::Iso14230Fast), session.protocol().map(|p| p.tag));
    assert_eq!(1, session.ecu_count());
    assert_eq!(Some(0x10), session.ecu_id(0));
    assert_eq!(ProtocolTag::Iso14230Fast, session.fingerprint().unwrap().protocol);
    assert_eq!(&SUPPORTED_PIDS[1..], session.response(0, 0x01).unwrap().data.as_slice());
    assert_eq!(0, log.violations(Verdict::Fail));
    assert!(log.events().contains(&TesterEvent::ProtocolDetermined {
        protocol: Some(ProtocolTag::Iso14230Fast),
        verdict: Verdict::Pass
    }));

    // Functional format byte, 2 service bytes
    let keep_alive = sim.periodic_messages();
    assert_eq!(vec![0xC2, 0x33, 0xF1, 0x01, 0x00], keep_alive[0].data);
}

#[test]
fn response_is_stored() {
    let (_sim, mut session, _log) = vehicle(|s| match s {
        [0x01, 0x0C] => vec![kwp_reply(0x10, 30, &[0x41, 0x0C, 0x1A, 0xF8])],
        _ => vec![],
    });
    assert_eq!(Verdict::Pass, session.determine_protocol());

    let req = ServiceRequest::new(0x01, &[0x0C]).unwrap();
    assert_eq!(Verdict::Pass, session.execute(&req, RequestFlags::NORMAL));
    assert_eq!(1, session.responder_count());
    assert_eq!(vec![0x0C, 0x1A, 0xF8], session.response(0, 0x01).unwrap().data);
    assert_eq!(30, session.timing(0).unwrap().longest_response_ms);
}

#[test]
fn format_byte_without_addressing() {
    let (_sim, mut session, log) = vehicle(|s| match s {
        [0x01, 0x0C] => vec![SimReply::new(30, &[0x44, 0xF1, 0x10, 0x41, 0x0C, 0x1A, 0xF8])],
        _ => vec![],
    });
    assert_eq!(Verdict::Pass, session.determine_protocol());
    log.clear();

    let req = ServiceRequest::new(0x01, &[0x0C]).unwrap();
    assert_eq!(Verdict::Fail, session.execute(&req, RequestFlags::NORMAL));
    assert!(log.violations(Verdict::Fail) >= 1);
    assert!(session.response(0, 0x01).is_none());
}

#[test]
fn format_byte_with_wrong_length() {
    let (_sim, mut session, _log) = vehicle(|s| match s {
        [0x01, 0x0C] => vec![SimReply::new(30, &[0x86, 0xF1, 0x10, 0x41, 0x0C, 0x1A, 0xF8])],
        _ => vec![],
    });
    assert_eq!(Verdict::Pass, session.determine_protocol());

    let req = ServiceRequest::new(0x01, &[0x0C]).unwrap();
    assert_eq!(Verdict::Fail, session.execute(&req, RequestFlags::NORMAL));
}

#[test]
fn five_baud_candidate_is_skipped() {
    let (sim, mut session, _log) = vehicle(|_| vec![]);

    assert_eq!(Verdict::Pass, session.determine_protocol());
    // Only the fast init candidate got an answer to its probe
    let kwp_probes = sim
        .sent_frames()
        .iter()
        .filter(|f| f.data == [0xC2, 0x33, 0xF1, 0x01, 0x00])
        .count();
    assert_eq!(2, kwp_probes);
}
