//! Classification of ISO 15765 responses
//!
//! The header is the 4 byte CAN identifier of the responding ECU. Response
//! times are measured from the adapter's transmit indication. A first frame
//! indication means a multi frame response is on its way: the ECU's window
//! is extended until its complete message arrives.

use log::debug;

use crate::channel::{RxStatus, WireFrame};
use crate::config::FIRST_FRAME_EXTENSION_MS;
use crate::helpers::hex;
use crate::request::NEGATIVE_RESPONSE_SID;
use crate::verdict::Verdict;

use super::{Exchange, ResponseClassifier};

const HEADER_SIZE: usize = 4;

#[derive(Debug, Default)]
pub(crate) struct SegmentedClassifier {
    reference_us: Option<u32>,
    /// First frames whose complete message has not arrived
    outstanding: usize,
}

impl ResponseClassifier for SegmentedClassifier {
    fn process(&mut self, x: &mut Exchange<'_>, frame: &WireFrame) -> Verdict {
        if frame.rx_status.intersects(RxStatus::TX_MSG_TYPE | RxStatus::TX_INDICATION) {
            self.reference_us = Some(frame.timestamp_us);
            return Verdict::Pass;
        }

        let mut v = Verdict::Pass;
        if frame.rx_status.contains(RxStatus::ISO15765_PADDING_ERROR) {
            if *x.padding_error_reported {
                debug!("Padding error on {} already reported", hex(&frame.data));
            } else {
                *x.padding_error_reported = true;
                v = x.violation(Verdict::Fail, format!("Frame {} is not padded to 8 bytes", hex(&frame.data)));
            }
        }

        let Some(header) = frame.header(HEADER_SIZE) else {
            return v.worst(x.violation(Verdict::Errors, format!("Ignoring short frame {}", hex(&frame.data))));
        };
        let slot = match x.slot_for(header) {
            Ok(slot) => slot,
            Err(f) => return v.worst(f),
        };
        let response_ms = self.reference_us.map(|r| frame.timestamp_us.wrapping_sub(r) / 1000);
        let base = x.protocol.max_response_ms();

        if frame.rx_status.contains(RxStatus::START_OF_MESSAGE) {
            // The first frame itself must be as quick as a single frame response
            let max = base + x.timing.slot_mut(slot).pending_delay_ms;
            v.escalate(x.check_window(slot, response_ms, max, true));
            let t = x.timing.slot_mut(slot);
            if t.extension_ms == 0 {
                t.extension_ms = FIRST_FRAME_EXTENSION_MS;
                self.outstanding += 1;
            }
            x.extension_ms = x.extension_ms.max(FIRST_FRAME_EXTENSION_MS);
            debug!("ECU 0x{:X} started a multi frame response", x.ecu_id(slot));
            return v;
        }

        let payload = frame.payload(HEADER_SIZE);
        if payload.is_empty() {
            return v.worst(x.violation(Verdict::Errors, format!("Ignoring empty message from {}", hex(header))));
        }
        let multi_frame = x.timing.slot_mut(slot).extension_ms > 0;
        let max = x.timing.slot_mut(slot).allowed_max_ms(base);
        v.escalate(x.check_window(slot, response_ms, max, !multi_frame));

        if payload[0] == NEGATIVE_RESPONSE_SID {
            v.escalate(x.negative(slot, payload));
            return v;
        }
        v.escalate(x.check_positive(slot, payload));
        if v != Verdict::Fail {
            v.escalate(x.store_positive(slot, payload, false));
        }

        let t = x.timing.slot_mut(slot);
        t.pending_delay_ms = 0;
        if multi_frame {
            t.extension_ms = 0;
            self.outstanding = self.outstanding.saturating_sub(1);
        }
        if self.outstanding == 0 {
            // Only pending delays of other ECUs remain
            x.extension_ms = x.timing.largest_extension_ms();
        }
        v
    }
}
