mod common;

use common::*;
use obd_conformance::channel::RxStatus;
use obd_conformance::hardware::simulation::{SimReply, SimulatedAdapter};
use obd_conformance::{EventLog, ProtocolTag, RequestFlags, ScanTable, ServiceRequest, Session, Verdict};

const VIN: &[u8] = b"1G1JC5444R7252367";

/// Vehicle with ECUs 0x7E8 and 0x7E9 on ISO 15765 (11bit, 500K). Both answer
/// the probe, every other request is handed to `other`
fn vehicle<F>(mut other: F) -> (SimulatedAdapter, Session<SimulatedAdapter>, EventLog)
where
    F: FnMut(&[u8]) -> Vec<SimReply> + Send + Sync + 'static,
{
    let sim = SimulatedAdapter::new();
    sim.add_responder(link(ProtocolTag::Iso15765), move |req| match service(req, 4) {
        [0x01, 0x00] => vec![can_reply(0x7E8, 5, &SUPPORTED_PIDS), can_reply(0x7E9, 5, &SUPPORTED_PIDS)],
        s => other(s),
    });
    let (mut session, log) = session(&sim, ScanTable::Us);
    assert_eq!(Verdict::Pass, session.determine_protocol());
    assert_eq!(Some(ProtocolTag::Iso15765), session.protocol().map(|p| p.tag));
    log.clear();
    (sim, session, log)
}

fn vin_response() -> Vec<u8> {
    let mut r = vec![0x49, 0x02, 0x01];
    r.extend_from_slice(VIN);
    r
}

fn rpm() -> Vec<u8> {
    vec![0x41, 0x0C, 0x1A, 0xF8]
}

#[test]
fn multi_frame_response() {
    let (_sim, mut session, _log) = vehicle(|s| match s {
        [0x09, 0x02] => vec![SimReply::first_frame(10, 0x7E8), can_reply(0x7E8, 100, &vin_response())],
        _ => vec![],
    });

    let req = ServiceRequest::new(0x09, &[0x02]).unwrap();
    assert_eq!(Verdict::Pass, session.execute(&req, RequestFlags::NORMAL));
    assert_eq!(1, session.responder_count());
    let t = session.timing(0).unwrap();
    assert_eq!(0, t.extension_ms);
    // Only the first frame is timed
    assert_eq!(1, t.response_count);
    assert_eq!(10, t.longest_response_ms);
    assert_eq!(VIN.len() + 2, session.response(0, 0x09).unwrap().size());
}

#[test]
fn unfinished_multi_frame_response() {
    let (_sim, mut session, log) = vehicle(|s| match s {
        [0x09, 0x02] => vec![SimReply::first_frame(10, 0x7E8)],
        _ => vec![],
    });

    let req = ServiceRequest::new(0x09, &[0x02]).unwrap();
    assert_eq!(Verdict::Fail, session.execute(&req, RequestFlags::NORMAL));
    assert_eq!(1, log.violations(Verdict::Fail));
}

#[test]
fn response_pending_is_overwritten() {
    let (_sim, mut session, _log) = vehicle(|s| match s {
        [0x01, 0x0C] => vec![
            can_reply(0x7E8, 10, &[0x7F, 0x01, 0x78]),
            can_reply(0x7E9, 5, &rpm()),
            can_reply(0x7E8, 2000, &rpm()),
        ],
        _ => vec![],
    });

    let req = ServiceRequest::new(0x01, &[0x0C]).unwrap();
    assert_eq!(Verdict::Pass, session.execute(&req, RequestFlags::NORMAL));
    assert_eq!(2, session.responder_count());
    let resp = session.response(0, 0x01).unwrap();
    assert!(resp.received);
    assert_eq!(vec![0x0C, 0x1A, 0xF8], resp.data);
}

#[test]
fn negative_answer_after_response_pending() {
    let (_sim, mut session, log) = vehicle(|s| match s {
        [0x04] => vec![
            can_reply(0x7E8, 10, &[0x7F, 0x04, 0x78]),
            can_reply(0x7E9, 5, &[0x44]),
            can_reply(0x7E8, 2000, &[0x7F, 0x04, 0x22]),
        ],
        _ => vec![],
    });

    let req = ServiceRequest::new(0x04, &[]).unwrap();
    assert_eq!(Verdict::Pass, session.execute(&req, RequestFlags::NORMAL));
    assert_eq!(2, session.responder_count());
    assert_eq!(0, session.timing(0).unwrap().pending_delay_ms);
    assert_eq!(0, log.violations(Verdict::Fail));
}

#[test]
fn padding_error_is_reported_once() {
    let (_sim, mut session, log) = vehicle(|s| match s {
        [0x01, 0x0C] => vec![
            can_reply(0x7E8, 5, &rpm()).with_status(RxStatus::ISO15765_PADDING_ERROR),
            can_reply(0x7E9, 5, &rpm()),
        ],
        _ => vec![],
    });

    let req = ServiceRequest::new(0x01, &[0x0C]).unwrap();
    assert_eq!(Verdict::Fail, session.execute(&req, RequestFlags::NORMAL));
    assert_eq!(1, log.violations(Verdict::Fail));
    assert_eq!(Verdict::Pass, session.execute(&req, RequestFlags::NORMAL));
    assert_eq!(1, log.violations(Verdict::Fail));
    assert_eq!(2, session.responder_count());
}

#[test]
fn late_single_frame() {
    let (_sim, mut session, _log) = vehicle(|s| match s {
        [0x01, 0x0C] => vec![can_reply(0x7E8, 5, &rpm()), can_reply(0x7E9, 80, &rpm())],
        _ => vec![],
    });

    let req = ServiceRequest::new(0x01, &[0x0C]).unwrap();
    assert_eq!(Verdict::Errors, session.execute(&req, RequestFlags::NORMAL));
    assert_eq!(1, session.timing(1).unwrap().too_late);
}

#[test]
fn return_after_all_responses() {
    let (_sim, mut session, _log) = vehicle(|s| match s {
        [0x01, 0x0C] => vec![
            can_reply(0x7E8, 5, &rpm()),
            can_reply(0x7E9, 5, &rpm()),
            // Never read when returning early
            can_reply(0x7E8, 5, &rpm()),
        ],
        _ => vec![],
    });

    let req = ServiceRequest::new(0x01, &[0x0C]).unwrap();
    assert_eq!(Verdict::Pass, session.execute(&req, RequestFlags::RETURN_AFTER_ALL_RESPONSES));
    assert_eq!(Verdict::Errors, session.execute(&req, RequestFlags::NORMAL));
}

#[test]
fn too_many_responders() {
    let (_sim, mut session, _log) = vehicle(|s| match s {
        [0x01, 0x0C] => vec![
            can_reply(0x7E8, 5, &rpm()),
            can_reply(0x7E9, 5, &rpm()),
            can_reply(0x7EA, 5, &rpm()),
        ],
        _ => vec![],
    });

    let req = ServiceRequest::new(0x01, &[0x0C]).unwrap();
    assert_eq!(Verdict::Fail, session.execute(&req, RequestFlags::NORMAL));
    assert_eq!(3, session.responder_count());
    assert_eq!(3, session.ecu_slots());
}
