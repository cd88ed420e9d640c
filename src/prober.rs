//! Protocol determination
//!
//! Every candidate of the catalog's list is connected and probed with
//! SID 01 PID 00. Exactly one protocol may answer: the first one found
//! captures the connect fingerprint, any other protocol answering later in
//! the same cycle fails the determination. The protocol found is then
//! reconnected, probed again against the fingerprint, and becomes the
//! target of the request engine.
//!
//! 29bit CAN candidates first discover the physical addresses of the ECUs,
//! so flow control filters can be installed for each of them.

use std::time::Duration;

use log::{debug, error, info, warn};

use crate::channel::{ChannelError, ConnectFlags, RxStatus, TxFlags, WireFrame};
use crate::config::{PROBE_ATTEMPTS, TARGET_DISCOVERY_TIMEOUT_MS};
use crate::events::TesterEvent;
use crate::fingerprint::ConnectFingerprint;
use crate::hardware::{Adapter, ConfigParam, FilterKind, Ioctl};
use crate::helpers::retry;
use crate::request::{FrameError, RequestFlags, ServiceRequest, POSITIVE_RESPONSE_OFFSET};
use crate::session::Session;
use crate::verdict::Verdict;

/// Error of the 29bit target address discovery
#[derive(Debug, Clone, thiserror::Error)]
pub enum DiscoveryError {
    /// More ECUs answered than the session allows
    #[error("too many responses, more than {0} ECUs answered")]
    TooManyResponses(usize),
    /// The channel could not be set up
    #[error("channel setup failed: {0}")]
    Setup(#[from] ChannelError),
    /// The discovery request could not be built
    #[error("discovery request could not be built: {0}")]
    Frame(#[from] FrameError),
}

/// Determines the protocol of the vehicle. On [Verdict::Pass] (or
/// [Verdict::Errors]) the session targets the protocol found, the ECU count
/// is known and the keep-alive message runs.
pub fn determine_protocol<A: Adapter>(session: &mut Session<A>) -> Verdict {
    session.disconnect_all();
    session.determined = false;
    session.fingerprint = None;
    session.ecu_count = 0;
    session.protocols = session.catalog.build_list(session.config.scan_table);
    session.determining = true;

    let (found, cycle) = probe_candidates(session);
    let verdict = match found {
        None => {
            warn!("No OBD protocol found");
            Verdict::Fail
        }
        Some(_) if cycle == Verdict::Fail => {
            error!("Protocol determination failed");
            Verdict::Fail
        }
        Some(idx) => commit(session, idx),
    };
    session.determining = false;

    let protocol = if session.determined { session.protocol().map(|p| p.tag) } else { None };
    session.emit(TesterEvent::ProtocolDetermined { protocol, verdict });
    verdict
}

fn probe_candidates<A: Adapter>(session: &mut Session<A>) -> (Option<usize>, Verdict) {
    let mut verdict = Verdict::Pass;
    let mut found = None;
    for idx in 0..session.protocols.len() {
        let desc = session.protocols[idx].clone();
        info!("Checking for OBD on {}", desc.tag);
        session.emit(TesterEvent::ProtocolAttempt(desc.tag));
        session.reset_ecus(desc.family());

        match probe_candidate(session, idx) {
            Ok(Some(current)) => {
                info!("{} ECUs responded on {}", current.ecu_count(), desc.tag);
                session.emit(TesterEvent::ProtocolResponded {
                    protocol: desc.tag,
                    ecu_count: current.ecu_count(),
                });
                match session.fingerprint.clone() {
                    None => {
                        session.emit(TesterEvent::FingerprintCaptured {
                            protocol: desc.tag,
                            ecu_count: current.ecu_count(),
                        });
                        session.fingerprint = Some(current);
                        found = Some(idx);
                    }
                    Some(fp) => {
                        if fp.verify(&current) == Verdict::Fail {
                            let first = fp.protocol;
                            verdict.escalate(session.violation(
                                Verdict::Fail,
                                format!("Vehicle responded on {} after responding on {}", desc.tag, first),
                            ));
                        }
                    }
                }
            }
            Ok(None) => debug!("No OBD response on {}", desc.tag),
            Err(v) => verdict.escalate(v),
        }

        if let Err(e) = session.disconnect_protocol(idx) {
            error!("Disconnecting {} failed: {}", desc.tag, e);
            verdict.escalate(Verdict::Fail);
        }
        session.active = None;
        if desc.is_kline() && session.config.delays.kline_settle_ms > 0 {
            debug!("Waiting {} ms for the K-line to settle", session.config.delays.kline_settle_ms);
            std::thread::sleep(Duration::from_millis(session.config.delays.kline_settle_ms as u64));
        }
    }
    (found, verdict)
}

/// Connects and probes one candidate.
///
/// `Ok(Some(_))` if the vehicle answered, `Ok(None)` if not, `Err` with the
/// verdict of a hard failure
fn probe_candidate<A: Adapter>(session: &mut Session<A>, idx: usize) -> Result<Option<ConnectFingerprint>, Verdict> {
    let desc = session.protocols[idx].clone();
    if desc.is_extended_can() {
        match discover_targets(session, idx) {
            Ok(0) => return Ok(None),
            Ok(n) => debug!("{} ECUs found by target address discovery", n),
            Err(e @ DiscoveryError::TooManyResponses(_)) => {
                return Err(session.violation(Verdict::Fail, format!("{}: {}", desc.tag, e)))
            }
            Err(e) => {
                info!("Target address discovery on {} failed: {}", desc.tag, e);
                return Ok(None);
            }
        }
    } else if let Err(e) = session.connect_protocol(idx) {
        info!("Could not connect {}: {}", desc.tag, e);
        return Ok(None);
    }

    session.active = Some(idx);
    session.transport_fault = false;
    let v = probe(session);
    if session.transport_fault {
        error!("Transport failure while probing {}", desc.tag);
        return Err(Verdict::Fail);
    }
    match v {
        Verdict::Fail | Verdict::Retry => Ok(None),
        _ => Ok(ConnectFingerprint::capture(session)),
    }
}

/// SID 01 PID 00, repeated while ECUs report busy
fn probe<A: Adapter>(session: &mut Session<A>) -> Verdict {
    let backoff = Duration::from_millis(session.config.delays.probe_retry_backoff_ms as u64);
    let request = ServiceRequest::probe();
    retry(
        PROBE_ATTEMPTS,
        backoff,
        |v: &Verdict| *v == Verdict::Retry,
        |_| session.execute(&request, RequestFlags::NORMAL),
    )
}

/// Reconnects the protocol found and checks it against the fingerprint
fn commit<A: Adapter>(session: &mut Session<A>, idx: usize) -> Verdict {
    let desc = session.protocols[idx].clone();
    info!("Vehicle uses {}", desc.tag);
    session.reset_ecus(desc.family());

    let connected = if desc.is_extended_can() {
        match discover_targets(session, idx) {
            Ok(0) => Err("no ECU answered target address discovery".to_string()),
            Ok(_) => Ok(()),
            Err(e) => Err(e.to_string()),
        }
    } else {
        session.connect_protocol(idx).map_err(|e| e.to_string())
    };
    if let Err(e) = connected {
        error!("Could not reconnect {}: {}", desc.tag, e);
        let _ = session.disconnect_protocol(idx);
        return Verdict::Fail;
    }

    session.active = Some(idx);
    let mut verdict = probe(session);
    if !verdict.is_usable() {
        verdict = session.violation(Verdict::Fail, format!("Vehicle stopped responding on {}", desc.tag));
    } else if let Some(fp) = session.fingerprint.clone() {
        if fp.verify_session(session) == Verdict::Fail {
            verdict = session.violation(
                Verdict::Fail,
                format!("Reconnecting {} does not reproduce the first connect", desc.tag),
            );
        }
    }

    let responders = session.responders;
    if verdict.is_usable() {
        if let Some(expected) = session.config.expected_ecu_count {
            if expected != responders {
                verdict = session.violation(
                    Verdict::Fail,
                    format!("{} OBD ECUs responded, {} were declared for this vehicle", responders, expected),
                );
            }
        }
    }
    if verdict == Verdict::Fail {
        if let Err(e) = session.disconnect_protocol(idx) {
            warn!("Disconnecting {} failed: {}", desc.tag, e);
        }
        session.active = None;
        return Verdict::Fail;
    }

    session.ecu_count = responders;
    session.determined = true;
    if let Err(e) = session.start_keep_alive() {
        error!("Could not start the keep-alive message on {}: {}", desc.tag, e);
        verdict.escalate(Verdict::Fail);
    }
    info!("{} determined, {} OBD ECUs", desc.tag, responders);
    verdict
}

/// Discovers the physical addresses of the ECUs on a 29bit CAN network.
/// On success the channel stays connected with its filters in place,
/// otherwise it is disconnected
pub(crate) fn discover_targets<A: Adapter>(session: &mut Session<A>, idx: usize) -> Result<usize, DiscoveryError> {
    let desc = session.protocols[idx].clone();
    let channel = session.adapter.connect(desc.kind, ConnectFlags::CAN_29BIT_ID, desc.baud)?;
    session.protocols[idx].channel_id = Some(channel);
    match listen_for_targets(session, idx, channel) {
        Ok(n) => Ok(n),
        Err(e) => {
            let _ = session.adapter.disconnect(channel);
            session.protocols[idx].clear_handles();
            Err(e)
        }
    }
}

fn listen_for_targets<A: Adapter>(session: &mut Session<A>, idx: usize, channel: u32) -> Result<usize, DiscoveryError> {
    let desc = session.protocols[idx].clone();
    let mask = WireFrame::new(desc.kind, TxFlags::CAN_29BIT_ID, &0x1FFF_FF00u32.to_be_bytes());
    let pattern = WireFrame::new(desc.kind, TxFlags::CAN_29BIT_ID, &0x18DA_F100u32.to_be_bytes());
    let pass = session
        .adapter
        .start_msg_filter(channel, FilterKind::Pass, &mask, &pattern, None)?;
    session.protocols[idx].filter_ids.push(pass);
    session
        .adapter
        .ioctl(channel, Ioctl::SetConfig(vec![(ConfigParam::Loopback, 1)]))?;
    session.adapter.ioctl(channel, Ioctl::ClearRxBuffer)?;

    let request = ServiceRequest::probe().build_frame(&desc)?;
    session
        .adapter
        .send_frames(channel, std::slice::from_ref(&request), session.config.write_timeout_ms)?;

    session.target_addresses.clear();
    loop {
        let frame = match session.adapter.receive_frame(channel, TARGET_DISCOVERY_TIMEOUT_MS) {
            Ok(f) => f,
            Err(e) if e.is_no_response() => break,
            Err(e) => return Err(e.into()),
        };
        if frame.rx_status.intersects(RxStatus::TX_MSG_TYPE | RxStatus::TX_INDICATION) {
            continue;
        }
        if frame.data.get(4) != Some(&(0x01 + POSITIVE_RESPONSE_OFFSET)) {
            debug!("Ignoring {:02X?} during target address discovery", frame.data);
            continue;
        }
        let addr = frame.data[3];
        if session.target_addresses.contains(&addr) {
            continue;
        }
        if session.target_addresses.len() >= session.config.max_ecus {
            return Err(DiscoveryError::TooManyResponses(session.config.max_ecus));
        }
        debug!("ECU at target address 0x{:02X}", addr);
        session.target_addresses.push(addr);
    }

    let flow_control = session.install_filters(&desc, channel)?;
    session.protocols[idx].filter_ids.extend(flow_control);
    Ok(session.target_addresses.len())
}
