mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::*;
use obd_conformance::channel::ChannelError;
use obd_conformance::hardware::simulation::{SimReply, SimulatedAdapter};
use obd_conformance::{EventLog, ProtocolTag, RequestFlags, ScanTable, ServiceRequest, Session, TesterEvent, Verdict};

/// Vehicle with ECUs 0x10 and 0x18 on J1850 VPW. Both answer the probe,
/// every other request is handed to `other`
fn vehicle<F>(mut other: F) -> (SimulatedAdapter, Session<SimulatedAdapter>, EventLog)
where
    F: FnMut(&[u8]) -> Vec<SimReply> + Send + Sync + 'static,
{
    let sim = SimulatedAdapter::new();
    sim.add_responder(link(ProtocolTag::J1850Vpw), move |req| match service(req, 3) {
        [0x01, 0x00] => vec![
            legacy_reply(0x10, 20, &SUPPORTED_PIDS),
            legacy_reply(0x18, 10, &SUPPORTED_PIDS),
        ],
        s => other(s),
    });
    let (mut session, log) = session(&sim, ScanTable::Us);
    assert_eq!(Verdict::Pass, session.determine_protocol());
    log.clear();
    (sim, session, log)
}

fn rpm(sid: u8) -> Vec<u8> {
    vec![sid, 0x0C, 0x1A, 0xF8]
}

fn request(sid: u8, sub_ids: &[u8]) -> ServiceRequest {
    ServiceRequest::new(sid, sub_ids).unwrap()
}

#[test]
fn positive_responses_are_stored() {
    let (_sim, mut session, _log) = vehicle(|s| match s {
        [0x01, 0x0C] => vec![legacy_reply(0x10, 20, &rpm(0x41)), legacy_reply(0x18, 10, &rpm(0x41))],
        _ => vec![],
    });

    assert_eq!(Verdict::Pass, session.execute(&request(0x01, &[0x0C]), RequestFlags::NORMAL));
    assert_eq!(2, session.responder_count());
    let resp = session.response(0, 0x01).unwrap();
    assert!(resp.received);
    assert_eq!(vec![0x0C, 0x1A, 0xF8], resp.data);
    assert_eq!(3, resp.size());
    assert_eq!(20, session.timing(0).unwrap().longest_response_ms);
}

#[test]
fn late_response() {
    let (_sim, mut session, log) = vehicle(|s| match s {
        [0x01, 0x0C] => vec![legacy_reply(0x10, 20, &rpm(0x41)), legacy_reply(0x18, 150, &rpm(0x41))],
        _ => vec![],
    });

    assert_eq!(Verdict::Errors, session.execute(&request(0x01, &[0x0C]), RequestFlags::NORMAL));
    assert_eq!(1, session.timing(1).unwrap().too_late);
    assert_eq!(0, session.timing(0).unwrap().too_late);
    assert_eq!(1, log.violations(Verdict::Errors));
    // Late, but stored
    assert!(session.response(1, 0x01).unwrap().received);
}

#[test]
fn wrong_response_sid() {
    let (_sim, mut session, _log) = vehicle(|s| match s {
        [0x01, 0x0C] => vec![legacy_reply(0x10, 20, &rpm(0x42)), legacy_reply(0x18, 10, &rpm(0x41))],
        _ => vec![],
    });

    assert_eq!(Verdict::Fail, session.execute(&request(0x01, &[0x0C]), RequestFlags::NORMAL));
}

#[test]
fn wrong_sub_id() {
    let (_sim, mut session, _log) = vehicle(|s| match s {
        [0x01, 0x0C] => vec![legacy_reply(0x10, 20, &[0x41, 0x0D, 0x20]), legacy_reply(0x18, 10, &rpm(0x41))],
        _ => vec![],
    });

    assert_eq!(Verdict::Fail, session.execute(&request(0x01, &[0x0C]), RequestFlags::NORMAL));
}

#[test]
fn duplicate_response_keeps_the_first() {
    let (_sim, mut session, _log) = vehicle(|s| match s {
        [0x01, 0x0C] => vec![
            legacy_reply(0x10, 20, &rpm(0x41)),
            legacy_reply(0x18, 10, &rpm(0x41)),
            legacy_reply(0x10, 10, &[0x41, 0x0C, 0x00, 0x00]),
        ],
        _ => vec![],
    });

    assert_eq!(Verdict::Errors, session.execute(&request(0x01, &[0x0C]), RequestFlags::NORMAL));
    assert_eq!(vec![0x0C, 0x1A, 0xF8], session.response(0, 0x01).unwrap().data);
    assert_eq!(2, session.responder_count());
}

#[test]
fn multi_message_services_append() {
    let (_sim, mut session, _log) = vehicle(|s| match s {
        [0x03] => vec![
            legacy_reply(0x10, 20, &[0x43, 0x01, 0x33, 0x02, 0x44, 0x00, 0x00]),
            legacy_reply(0x10, 10, &[0x43, 0x03, 0x01, 0x00, 0x00, 0x00, 0x00]),
            legacy_reply(0x18, 10, &[0x43, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]),
        ],
        _ => vec![],
    });

    assert_eq!(Verdict::Pass, session.execute(&request(0x03, &[]), RequestFlags::NORMAL));
    assert_eq!(12, session.response(0, 0x03).unwrap().size());
    assert_eq!(6, session.response(1, 0x03).unwrap().size());
}

#[test]
fn busy_is_a_failure_once_determined() {
    let (_sim, mut session, _log) = vehicle(|s| match s {
        [0x01, 0x0C] => vec![legacy_reply(0x10, 20, &[0x7F, 0x01, 0x21]), legacy_reply(0x18, 10, &rpm(0x41))],
        _ => vec![],
    });

    assert_eq!(Verdict::Fail, session.execute(&request(0x01, &[0x0C]), RequestFlags::NORMAL));
}

#[test]
fn response_pending_extends_the_window() {
    let (_sim, mut session, _log) = vehicle(|s| match s {
        [0x01, 0x0C] => vec![
            legacy_reply(0x10, 20, &[0x7F, 0x01, 0x78]),
            legacy_reply(0x18, 10, &rpm(0x41)),
            legacy_reply(0x10, 1000, &rpm(0x41)),
        ],
        _ => vec![],
    });

    assert_eq!(Verdict::Pass, session.execute(&request(0x01, &[0x0C]), RequestFlags::NORMAL));
    assert_eq!(2, session.responder_count());
    assert!(session.response(0, 0x01).unwrap().received);
    assert_eq!(0, session.timing(0).unwrap().pending_delay_ms);
}

#[test]
fn response_pending_never_answered() {
    let (_sim, mut session, _log) = vehicle(|s| match s {
        [0x01, 0x0C] => vec![legacy_reply(0x10, 20, &[0x7F, 0x01, 0x78]), legacy_reply(0x18, 10, &rpm(0x41))],
        _ => vec![],
    });

    assert_eq!(Verdict::Fail, session.execute(&request(0x01, &[0x0C]), RequestFlags::NORMAL));
}

#[test]
fn negative_answer_after_response_pending() {
    let (_sim, mut session, log) = vehicle(|s| match s {
        [0x08, 0x01] => vec![
            legacy_reply(0x10, 20, &[0x7F, 0x08, 0x78]),
            legacy_reply(0x18, 10, &[0x48, 0x01, 0x00]),
            legacy_reply(0x10, 1000, &[0x7F, 0x08, 0x31]),
        ],
        _ => vec![],
    });

    assert_eq!(Verdict::Pass, session.execute(&request(0x08, &[0x01]), RequestFlags::NORMAL));
    assert_eq!(2, session.responder_count());
    assert_eq!(0, session.timing(0).unwrap().pending_delay_ms);
    assert_eq!(0, log.violations(Verdict::Fail));
}

#[test]
fn repeated_negative_answer() {
    let (_sim, mut session, log) = vehicle(|s| match s {
        [0x04] => vec![
            legacy_reply(0x10, 20, &[0x44]),
            legacy_reply(0x18, 10, &[0x7F, 0x04, 0x22]),
            legacy_reply(0x18, 10, &[0x7F, 0x04, 0x22]),
        ],
        _ => vec![],
    });

    assert_eq!(Verdict::Errors, session.execute(&request(0x04, &[]), RequestFlags::NORMAL));
    assert_eq!(2, session.responder_count());
    assert_eq!(1, log.violations(Verdict::Errors));
}

#[test]
fn support_query_needs_every_ecu() {
    let (_sim, mut session, _log) = vehicle(|s| match s {
        [0x09, 0x00] => vec![legacy_reply(0x10, 20, &[0x49, 0x00, 0x55, 0x40, 0x00, 0x00])],
        [0x01, 0x0C] => vec![legacy_reply(0x10, 20, &rpm(0x41))],
        _ => vec![],
    });

    assert_eq!(Verdict::Fail, session.execute(&request(0x09, &[0x00]), RequestFlags::NORMAL));
    // Not every ECU supports every PID
    assert_eq!(Verdict::Pass, session.execute(&request(0x01, &[0x0C]), RequestFlags::NORMAL));
    assert_eq!(1, session.responder_count());
}

#[test]
fn no_response() {
    let (_sim, mut session, _log) = vehicle(|_| vec![]);

    let req = request(0x01, &[0x0C]);
    assert_eq!(Verdict::Fail, session.execute(&req, RequestFlags::NORMAL));
    assert_eq!(Verdict::Fail, session.execute(&req, RequestFlags::IGNORE_NO_RESPONSE));
    assert_eq!(Verdict::Pass, session.execute(&req, RequestFlags::ALLOW_NO_RESPONSE));
    assert_eq!(0, session.responder_count());
}

#[test]
fn keep_alive_survives_requests() {
    let (sim, mut session, _log) = vehicle(|s| match s {
        [0x01, 0x0C] => vec![legacy_reply(0x10, 20, &rpm(0x41)), legacy_reply(0x18, 10, &rpm(0x41))],
        _ => vec![],
    });

    assert_eq!(1, sim.periodic_messages().len());
    assert_eq!(Verdict::Pass, session.execute(&request(0x01, &[0x0C]), RequestFlags::NORMAL));
    assert_eq!(1, sim.periodic_messages().len());
    assert_eq!(Verdict::Pass, session.execute(&request(0x01, &[0x0C]), RequestFlags::NO_PERIODIC_DISABLE));
    assert_eq!(1, sim.periodic_messages().len());
    assert_eq!(Verdict::Pass, session.verify_link_active());
}

#[test]
fn clear_codes_repeats_until_every_ecu_agrees() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let (_sim, mut session, _log) = vehicle(move |s| match s {
        [0x04] if c.fetch_add(1, Ordering::SeqCst) == 0 => {
            vec![legacy_reply(0x10, 20, &[0x44]), legacy_reply(0x18, 10, &[0x7F, 0x04, 0x22])]
        }
        [0x04] => vec![legacy_reply(0x10, 20, &[0x44]), legacy_reply(0x18, 10, &[0x44])],
        _ => vec![],
    });

    assert_eq!(Verdict::Pass, session.clear_codes());
    assert_eq!(2, calls.load(Ordering::SeqCst));
    assert!(session.response(1, 0x04).unwrap().received);
}

#[test]
fn transport_failure() {
    let (sim, mut session, _log) = vehicle(|s| match s {
        [0x01, 0x0C] => vec![legacy_reply(0x10, 20, &rpm(0x41)), legacy_reply(0x18, 10, &rpm(0x41))],
        _ => vec![],
    });

    sim.fail_next_receive(ChannelError::APIError {
        api_name: "Simulation".into(),
        code: 0x08,
        desc: "device not connected".into(),
    });
    assert_eq!(Verdict::Fail, session.execute(&request(0x01, &[0x0C]), RequestFlags::NORMAL));
}

#[test]
fn request_needs_a_protocol() {
    init_logging();
    let sim = SimulatedAdapter::new();
    let mut session = Session::new(sim, config(ScanTable::Us));
    session.open().unwrap();
    assert_eq!(Verdict::Fail, session.execute(&ServiceRequest::probe(), RequestFlags::NORMAL));
}

#[test]
fn lost_link_is_reported() {
    let (sim, mut session, log) = vehicle(|_| vec![]);

    sim.clear_responders();
    assert_eq!(Verdict::Fail, session.verify_link_active());
    assert!(log.events().contains(&TesterEvent::LinkLost(ProtocolTag::J1850Vpw)));
}
