mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::*;
use obd_conformance::channel::TransportKind;
use obd_conformance::hardware::simulation::SimulatedAdapter;
use obd_conformance::{ProtocolTag, ScanTable, TesterConfig, TesterEvent, Verdict};

fn attempts(events: &[TesterEvent]) -> Vec<ProtocolTag> {
    events
        .iter()
        .filter_map(|e| match e {
            TesterEvent::ProtocolAttempt(tag) => Some(*tag),
            _ => None,
        })
        .collect()
}

fn two_vpw_ecus(sim: &SimulatedAdapter) {
    sim.add_responder(link(ProtocolTag::J1850Vpw), |req| match service(req, 3) {
        [0x01, 0x00] => vec![
            legacy_reply(0x10, 20, &SUPPORTED_PIDS),
            legacy_reply(0x18, 10, &SUPPORTED_PIDS),
        ],
        _ => vec![],
    });
}

#[test]
fn finds_two_ecus_on_vpw() {
    let sim = SimulatedAdapter::new();
    two_vpw_ecus(&sim);
    let (mut session, log) = session(&sim, ScanTable::Us);

    assert_eq!(Verdict::Pass, session.determine_protocol());
    assert!(session.is_determined());
    assert_eq!(Some(ProtocolTag::J1850Vpw), session.protocol().map(|p| p.tag));
    assert_eq!(2, session.ecu_count());
    assert_eq!(Some(0x10), session.ecu_id(0));
    assert_eq!(Some(0x18), session.ecu_id(1));

    let fp = session.fingerprint().unwrap();
    assert_eq!(ProtocolTag::J1850Vpw, fp.protocol);
    assert_eq!(2, fp.ecu_count());

    let events = log.events();
    assert_eq!(7, attempts(&events).len());
    assert!(events.contains(&TesterEvent::ProtocolDetermined {
        protocol: Some(ProtocolTag::J1850Vpw),
        verdict: Verdict::Pass
    }));

    // Only the protocol found stays connected, with the keep-alive running
    assert_eq!(1, sim.open_channels());
    let keep_alive = sim.periodic_messages();
    assert_eq!(1, keep_alive.len());
    assert_eq!(vec![0x68, 0x6A, 0xF1, 0x01, 0x00], keep_alive[0].data);
}

#[test]
fn second_connect_must_match_the_first() {
    let sim = SimulatedAdapter::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    sim.add_responder(link(ProtocolTag::J1850Vpw), move |req| {
        if !matches!(service(req, 3), [0x01, 0x00]) {
            return vec![];
        }
        let mut replies = vec![legacy_reply(0x10, 20, &SUPPORTED_PIDS)];
        // A second ECU wakes up after the first probe
        if c.fetch_add(1, Ordering::SeqCst) > 0 {
            replies.push(legacy_reply(0x18, 10, &SUPPORTED_PIDS));
        }
        replies
    });
    let (mut session, log) = session(&sim, ScanTable::Us);

    assert_eq!(Verdict::Fail, session.determine_protocol());
    assert!(!session.is_determined());
    assert!(calls.load(Ordering::SeqCst) >= 2);
    assert!(log.violations(Verdict::Fail) >= 1);
    assert_eq!(0, sim.open_channels());
    assert!(sim.periodic_messages().is_empty());
}

#[test]
fn kline_response_too_soon() {
    let sim = SimulatedAdapter::new();
    sim.add_responder(link(ProtocolTag::Iso9141), |req| match service(req, 3) {
        [0x01, 0x00] => vec![legacy_reply(0x10, 15, &SUPPORTED_PIDS)],
        _ => vec![],
    });
    let (mut session, log) = session(&sim, ScanTable::Us);

    assert_eq!(Verdict::Errors, session.determine_protocol());
    assert!(session.is_determined());
    assert_eq!(Some(ProtocolTag::Iso9141), session.protocol().map(|p| p.tag));
    assert_eq!(1, session.ecu_count());
    assert_eq!(1, session.timing(0).unwrap().too_soon);
    assert!(log.violations(Verdict::Errors) >= 1);

    // The response is still stored
    let resp = session.response(0, 0x01).unwrap();
    assert!(resp.received);
    assert_eq!(&SUPPORTED_PIDS[1..], resp.data.as_slice());
}

#[test]
fn vehicle_answering_two_protocols_fails() {
    let sim = SimulatedAdapter::new();
    two_vpw_ecus(&sim);
    sim.add_responder(link(ProtocolTag::Iso15765), |req| match service(req, 4) {
        [0x01, 0x00] => vec![can_reply(0x7E8, 5, &SUPPORTED_PIDS)],
        _ => vec![],
    });
    let (mut session, log) = session(&sim, ScanTable::Us);

    assert_eq!(Verdict::Fail, session.determine_protocol());
    assert!(!session.is_determined());
    assert!(log.events().contains(&TesterEvent::ProtocolDetermined {
        protocol: None,
        verdict: Verdict::Fail
    }));
}

#[test]
fn no_vehicle() {
    let sim = SimulatedAdapter::new();
    let (mut session, log) = session(&sim, ScanTable::Eu);

    assert_eq!(Verdict::Fail, session.determine_protocol());
    assert!(!session.is_determined());
    assert_eq!(9, attempts(&log.events()).len());
    assert_eq!(0, sim.open_channels());
}

#[test]
fn busy_ecu_is_probed_again() {
    let sim = SimulatedAdapter::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    sim.add_responder(link(ProtocolTag::J1850Vpw), move |req| {
        if !matches!(service(req, 3), [0x01, 0x00]) {
            return vec![];
        }
        match c.fetch_add(1, Ordering::SeqCst) {
            0 => vec![legacy_reply(0x10, 20, &[0x7F, 0x01, 0x21])],
            _ => vec![legacy_reply(0x10, 20, &SUPPORTED_PIDS)],
        }
    });
    let (mut session, _log) = session(&sim, ScanTable::Us);

    assert_eq!(Verdict::Pass, session.determine_protocol());
    assert_eq!(1, session.ecu_count());
    // Busy probe, repeated probe, then the probe of the reconnect
    let vpw_requests = sim
        .sent_frames()
        .iter()
        .filter(|f| f.protocol == Some(TransportKind::J1850Vpw))
        .count();
    assert_eq!(3, vpw_requests);
}

#[test]
fn extended_can_discovers_targets() {
    let sim = SimulatedAdapter::new();
    sim.add_responder(link(ProtocolTag::Iso15765Ext), |req| match service(req, 4) {
        [0x01, 0x00] => vec![
            can_reply(0x18DA_F110, 5, &SUPPORTED_PIDS),
            can_reply(0x18DA_F118, 5, &SUPPORTED_PIDS),
        ],
        _ => vec![],
    });
    let (mut session, _log) = session(&sim, ScanTable::Us);

    assert_eq!(Verdict::Pass, session.determine_protocol());
    assert_eq!(Some(ProtocolTag::Iso15765Ext), session.protocol().map(|p| p.tag));
    assert_eq!(&[0x10, 0x18], session.target_addresses());
    assert_eq!(2, session.ecu_count());
    // Discovery pass filter, then one flow control filter per ECU
    assert_eq!(3, session.protocol().unwrap().filter_ids.len());
    assert_eq!(Some(0x18DA_F110), session.ecu_id(0));
}

#[test]
fn too_many_ecus_on_extended_can() {
    let sim = SimulatedAdapter::new();
    sim.add_responder(link(ProtocolTag::Iso15765Ext), |req| match service(req, 4) {
        [0x01, 0x00] => vec![
            can_reply(0x18DA_F110, 5, &SUPPORTED_PIDS),
            can_reply(0x18DA_F118, 5, &SUPPORTED_PIDS),
        ],
        _ => vec![],
    });
    let (mut session, log) = session_with(
        &sim,
        TesterConfig {
            max_ecus: 1,
            ..config(ScanTable::Us)
        },
    );

    assert_eq!(Verdict::Fail, session.determine_protocol());
    assert!(!session.is_determined());
    assert!(log.violations(Verdict::Fail) >= 1);
}

#[test]
fn declared_ecu_count_is_checked() {
    let sim = SimulatedAdapter::new();
    two_vpw_ecus(&sim);
    let (mut session, _log) = session_with(
        &sim,
        TesterConfig {
            expected_ecu_count: Some(1),
            ..config(ScanTable::Us)
        },
    );

    assert_eq!(Verdict::Fail, session.determine_protocol());
    assert!(!session.is_determined());
}

#[test]
fn determination_order_rotates() {
    let sim = SimulatedAdapter::new();
    two_vpw_ecus(&sim);
    let (mut session, log) = session(&sim, ScanTable::Us);

    assert_eq!(Verdict::Pass, session.determine_protocol());
    let first = attempts(&log.events());
    log.clear();
    assert_eq!(Verdict::Pass, session.determine_protocol());
    let second = attempts(&log.events());

    assert_eq!(first.len(), second.len());
    assert_ne!(first, second);
    assert_eq!(2, session.ecu_count());
    assert_eq!(1, sim.open_channels());
}

#[test]
fn close_disconnects_everything() {
    let sim = SimulatedAdapter::new();
    two_vpw_ecus(&sim);
    let (mut session, _log) = session(&sim, ScanTable::Us);

    assert_eq!(Verdict::Pass, session.determine_protocol());
    session.close().unwrap();
    assert_eq!(0, sim.open_channels());
    assert!(!session.is_determined());
}
