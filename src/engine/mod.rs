//! Request / response engine
//!
//! [execute] sends one functional request on the targeted protocol, then
//! collects every response until the receive timeout expires. Each received
//! frame is classified by the strategy of the protocol's family:
//!
//! * [legacy] - J1850 and K-line, one message per frame, 3 byte header
//! * [segmented] - ISO 15765, 4 byte CAN identifier header, multi frame responses
//!
//! Classification stores positive responses, checks the response time
//! window of every ECU, and reduces every violation to a [Verdict].

mod legacy;
mod segmented;

use std::time::Duration;

use log::{debug, error, info, warn};

use crate::channel::WireFrame;
use crate::config::RECEIVE_TIMEOUT_FACTOR;
use crate::events::{EventHandler, TesterEvent};
use crate::hardware::{Adapter, Ioctl};
use crate::helpers::{check_pos_response_id, hex};
use crate::nrc::{self, NrcAction};
use crate::protocol::{ProtocolDescriptor, ProtocolFamily};
use crate::request::{RequestFlags, ServiceRequest};
use crate::session::Session;
use crate::store::ResponseStore;
use crate::timing::EcuTimingTable;
use crate::verdict::Verdict;

pub(crate) use legacy::LegacyClassifier;
pub(crate) use segmented::SegmentedClassifier;

/// Classification strategy of a protocol family
pub(crate) trait ResponseClassifier {
    /// Classifies one received frame, returning the verdict it contributes
    fn process(&mut self, x: &mut Exchange<'_>, frame: &WireFrame) -> Verdict;
}

/// State of the request being executed, shared by both classifiers
pub(crate) struct Exchange<'a> {
    pub protocol: &'a ProtocolDescriptor,
    pub request: &'a ServiceRequest,
    pub determining: bool,
    pub timing: &'a mut EcuTimingTable,
    pub store: &'a mut ResponseStore,
    pub events: &'a mut Box<dyn EventHandler>,
    pub padding_error_reported: &'a mut bool,
    /// ECUs counted as responders so far
    pub responders: usize,
    /// Largest window extension currently active
    pub extension_ms: u32,
}

/// Services whose legacy responses are spread over several messages, each
/// appended to the stored response
const MULTI_MESSAGE_SERVICES: [u8; 4] = [0x03, 0x07, 0x09, 0x0A];

/// Services whose positive responses repeat the requested sub-id
fn echoes_sub_id(sid: u8) -> bool {
    matches!(sid, 0x01 | 0x02 | 0x05 | 0x06 | 0x08 | 0x09)
}

impl Exchange<'_> {
    /// Logs a violation and reports it to the event handler
    pub fn violation(&mut self, verdict: Verdict, desc: String) -> Verdict {
        match verdict {
            Verdict::Fail => error!("{}", desc),
            _ => warn!("{}", desc),
        }
        self.events.on_event(TesterEvent::Violation { verdict, desc });
        verdict
    }

    /// Slot of the ECU that sent `header`
    pub fn slot_for(&mut self, header: &[u8]) -> Result<usize, Verdict> {
        match self.store.slot_for(header) {
            Ok(slot) => {
                self.timing.slot_mut(slot);
                Ok(slot)
            }
            Err(e) => Err(self.violation(Verdict::Fail, format!("Response with header {}: {}", hex(header), e))),
        }
    }

    pub fn ecu_id(&self, slot: usize) -> u32 {
        self.store.ecu_id(slot).unwrap_or_default()
    }

    /// Checks a response time against the window of an ECU. Only recorded
    /// times count towards the ECU's timing statistics
    pub fn check_window(&mut self, slot: usize, response_ms: Option<u32>, max_ms: u32, record: bool) -> Verdict {
        let Some(ms) = response_ms else {
            return Verdict::Pass;
        };
        let min = self.protocol.min_response_ms();
        let id = self.ecu_id(slot);
        let t = self.timing.slot_mut(slot);
        if record {
            t.record(ms);
        }
        if record && ms < min {
            t.too_soon += 1;
            return self.violation(
                Verdict::Errors,
                format!("ECU 0x{id:X} responded too soon ({ms} ms, minimum {min} ms)"),
            );
        }
        if ms > max_ms {
            t.too_late += 1;
            return self.violation(
                Verdict::Errors,
                format!("ECU 0x{id:X} responded too late ({ms} ms, maximum {max_ms} ms)"),
            );
        }
        Verdict::Pass
    }

    pub fn count_responder(&mut self, slot: usize) {
        let t = self.timing.slot_mut(slot);
        if !t.responded {
            t.responded = true;
            self.responders += 1;
        }
    }

    /// Checks the SID and sub-id of a positive response payload
    pub fn check_positive(&mut self, slot: usize, payload: &[u8]) -> Verdict {
        let id = self.ecu_id(slot);
        if !check_pos_response_id(self.request.sid(), payload) {
            return self.violation(
                Verdict::Fail,
                format!("ECU 0x{id:X} answered {} with {}", self.request, hex(payload)),
            );
        }
        if echoes_sub_id(self.request.sid()) && !self.request.sub_ids().is_empty() {
            match payload.get(1) {
                Some(sub) if self.request.sub_ids().contains(sub) => {}
                _ => {
                    return self.violation(
                        Verdict::Fail,
                        format!("ECU 0x{id:X} answered {} for another sub-id: {}", self.request, hex(payload)),
                    )
                }
            }
        }
        Verdict::Pass
    }

    /// Stores a positive response payload. A second response of the same ECU
    /// is appended for multi message services and a duplicate otherwise
    pub fn store_positive(&mut self, slot: usize, payload: &[u8], append: bool) -> Verdict {
        let sid = self.request.sid();
        let id = self.ecu_id(slot);
        let data = payload.get(1..).unwrap_or(&[]);
        let outcome = match self.store.response_mut(slot, sid) {
            Some(r) if r.received && append => {
                r.data.extend_from_slice(data);
                Some(false)
            }
            Some(r) if r.received => Some(true),
            Some(r) => {
                r.data = data.to_vec();
                r.received = true;
                Some(false)
            }
            None => None,
        };
        let Some(duplicate) = outcome else {
            return self.violation(Verdict::Fail, format!("No response slot {slot} for ECU 0x{id:X}"));
        };
        self.count_responder(slot);
        if duplicate {
            return self.violation(
                Verdict::Errors,
                format!("ECU 0x{id:X} answered {} more than once, keeping the first response", self.request),
            );
        }
        Verdict::Pass
    }

    /// Handles a negative response payload (`7F SID NRC`)
    pub fn negative(&mut self, slot: usize, payload: &[u8]) -> Verdict {
        let id = self.ecu_id(slot);
        if payload.len() < 3 {
            return self.violation(
                Verdict::Fail,
                format!("ECU 0x{id:X} sent a malformed negative response {}", hex(payload)),
            );
        }
        if payload[1] != self.request.sid() {
            return self.violation(
                Verdict::Fail,
                format!("ECU 0x{id:X} sent a negative response for SID 0x{:02X} to {}", payload[1], self.request),
            );
        }
        let code = payload[2];
        let action = nrc::disposition(code, self.request, self.determining);
        if action != NrcAction::Pending {
            // A final answer ends any response pending wait of this ECU
            self.timing.slot_mut(slot).pending_delay_ms = 0;
            self.extension_ms = self.timing.largest_extension_ms();
        }
        match action {
            NrcAction::Pending => {
                let pending = self.protocol.response_pending_ms();
                debug!("ECU 0x{id:X} needs more time, extending its window by {pending} ms");
                self.timing.slot_mut(slot).pending_delay_ms = pending;
                if let Some(r) = self.store.response_mut(slot, self.request.sid()) {
                    r.received = false;
                }
                self.extension_ms = self.extension_ms.max(pending);
                Verdict::Pass
            }
            NrcAction::Tolerated => {
                let t = self.timing.slot_mut(slot);
                if t.nak_counted {
                    return self.violation(
                        Verdict::Errors,
                        format!("ECU 0x{id:X} answered {} more than once with {}", self.request, nrc::describe(code)),
                    );
                }
                t.nak_counted = true;
                info!("ECU 0x{id:X} answered {} with {}", self.request, nrc::describe(code));
                self.count_responder(slot);
                Verdict::Pass
            }
            NrcAction::Retry => {
                warn!("ECU 0x{id:X} is busy, {} will be repeated", self.request);
                Verdict::Retry
            }
            NrcAction::Fail => self.violation(
                Verdict::Fail,
                format!("ECU 0x{id:X} answered {} with {}", self.request, nrc::describe(code)),
            ),
        }
    }

    /// True while some ECU still owes a response
    pub fn awaiting_responses(&self) -> bool {
        self.timing.iter().any(|(_, t)| t.pending_delay_ms > 0 || t.extension_ms > 0)
    }

    /// Fails every ECU that left a response unfinished
    fn check_unfinished(&mut self) -> Verdict {
        let mut v = Verdict::Pass;
        let unfinished: Vec<(usize, bool, bool)> = self
            .timing
            .iter()
            .filter(|(_, t)| t.pending_delay_ms > 0 || t.extension_ms > 0)
            .map(|(slot, t)| (slot, t.pending_delay_ms > 0, t.extension_ms > 0))
            .collect();
        for (slot, pending, multi_frame) in unfinished {
            let id = self.ecu_id(slot);
            if pending {
                v.escalate(self.violation(
                    Verdict::Fail,
                    format!("ECU 0x{id:X} never answered {} after asking for more time", self.request),
                ));
            }
            if multi_frame {
                v.escalate(self.violation(
                    Verdict::Fail,
                    format!("ECU 0x{id:X} never completed its multi frame response to {}", self.request),
                ));
            }
        }
        v
    }
}

/// Executes a request on the targeted protocol and classifies every response.
///
/// Once the protocol is determined the responder count is reconciled with
/// the number of ECUs found, and [Verdict::Retry] is reported as
/// [Verdict::Fail]. Per-ECU timing of the request stays readable through
/// [Session::timing] until the next request.
pub fn execute<A: Adapter>(session: &mut Session<A>, request: &ServiceRequest, flags: RequestFlags) -> Verdict {
    let Some(protocol) = session.protocol().cloned() else {
        error!("No protocol is targeted, cannot send {}", request);
        return Verdict::Fail;
    };
    let Some(channel) = protocol.channel_id else {
        error!("{} is not connected, cannot send {}", protocol.tag, request);
        return Verdict::Fail;
    };
    let frame = match request.build_frame(&protocol) {
        Ok(f) => f,
        Err(e) => {
            error!("Cannot send {}: {}", request, e);
            return Verdict::Fail;
        }
    };

    session.timing.reset();
    session.store.begin_request(request.sid());
    session.responders = 0;

    let burst = flags.contains(RequestFlags::NO_PERIODIC_DISABLE);
    if !burst {
        if let Err(e) = session.stop_keep_alive(channel) {
            error!("Could not stop the keep-alive message: {}", e);
            session.transport_fault = true;
            return Verdict::Fail;
        }
        if session.config.delays.inter_request_delay {
            std::thread::sleep(Duration::from_millis(protocol.request_delay_ms() as u64));
        }
    }

    let sent = session
        .adapter
        .ioctl(channel, Ioctl::ClearTxBuffer)
        .and_then(|_| session.adapter.ioctl(channel, Ioctl::ClearRxBuffer))
        .and_then(|_| {
            session
                .adapter
                .send_frames(channel, std::slice::from_ref(&frame), session.config.write_timeout_ms)
        });
    if let Err(e) = sent {
        error!("Sending {} on {} failed: {}", request, protocol.tag, e);
        session.transport_fault = true;
        return Verdict::Fail;
    }
    debug!("Sent {} on {}", request, protocol.tag);

    let mut classifier: Box<dyn ResponseClassifier> = match protocol.family() {
        ProtocolFamily::Legacy => Box::new(LegacyClassifier::default()),
        ProtocolFamily::Segmented => Box::new(SegmentedClassifier::default()),
    };
    let return_early = flags.contains(RequestFlags::RETURN_AFTER_ALL_RESPONSES) && session.determined;
    let expected = session.ecu_count;

    let mut x = Exchange {
        protocol: &protocol,
        request,
        determining: session.determining,
        timing: &mut session.timing,
        store: &mut session.store,
        events: &mut session.events,
        padding_error_reported: &mut session.padding_error_reported,
        responders: 0,
        extension_ms: 0,
    };
    let mut verdict = Verdict::Pass;
    loop {
        let timeout = RECEIVE_TIMEOUT_FACTOR * protocol.max_response_ms() + x.extension_ms;
        match session.adapter.receive_frame(channel, timeout) {
            Ok(f) => verdict.escalate(classifier.process(&mut x, &f)),
            Err(e) if e.is_no_response() => break,
            Err(e) => {
                error!("Receiving responses to {} failed: {}", request, e);
                session.transport_fault = true;
                verdict.escalate(Verdict::Fail);
                break;
            }
        }
        if return_early && x.responders >= expected && !x.awaiting_responses() {
            debug!("All {} ECUs responded to {}", expected, request);
            break;
        }
    }
    verdict.escalate(x.check_unfinished());
    let responders = x.responders;

    if responders == 0 && verdict != Verdict::Retry {
        if flags.contains(RequestFlags::ALLOW_NO_RESPONSE) {
            debug!("No response to {}", request);
        } else {
            if session.determined && !flags.contains(RequestFlags::IGNORE_NO_RESPONSE) {
                warn!("No response to {}", request);
            }
            verdict.escalate(Verdict::Fail);
        }
    } else if session.determined {
        if responders > expected {
            error!("{} ECUs responded to {}, only {} OBD ECUs were found", responders, request, expected);
            verdict.escalate(Verdict::Fail);
        } else if request.is_support_query() && responders < expected {
            error!("{} of {} OBD ECUs responded to {}", responders, expected, request);
            verdict.escalate(Verdict::Fail);
        }
    }
    session.responders = responders;

    if session.determined {
        if !burst {
            if let Err(e) = session.start_keep_alive() {
                error!("Could not restart the keep-alive message: {}", e);
                verdict.escalate(Verdict::Fail);
            }
        }
        if verdict == Verdict::Retry {
            verdict = Verdict::Fail;
        }
    }

    debug!("{} on {}: {} responders, {}", request, protocol.tag, responders, verdict);
    session.emit(TesterEvent::Request {
        sid: request.sid(),
        sub_ids: request.sub_ids().to_vec(),
        responders,
        verdict,
    });
    verdict
}
