//! Classification of J1850 and K-line responses
//!
//! Every message carries a 3 byte header whose last byte is the ECU's
//! source address. Response times are measured from the end of the request
//! echo, or from the end of the previous ECU's response when several ECUs
//! answer one after another. On K-line links the adapter reports the start
//! of each message, and the time is taken at that point.

use crate::channel::{RxStatus, WireFrame};
use crate::helpers::hex;
use crate::request::NEGATIVE_RESPONSE_SID;
use crate::verdict::Verdict;

use super::{Exchange, ResponseClassifier, MULTI_MESSAGE_SERVICES};

#[derive(Debug, Default)]
pub(crate) struct LegacyClassifier {
    reference_us: Option<u32>,
    start_of_message_us: Option<u32>,
}

/// Validates an ISO 14230 format byte: physical (0x80) or functional (0xC0)
/// addressing, and a length of 1 to 7 matching the payload
fn check_format_byte(fmt: u8, payload_len: usize) -> Result<(), String> {
    let addressing = fmt & 0xC0;
    let len = (fmt & 0x3F) as usize;
    if addressing != 0x80 && addressing != 0xC0 {
        return Err(format!("format byte 0x{fmt:02X} has no address information"));
    }
    if !(1..=7).contains(&len) || len != payload_len {
        return Err(format!("format byte 0x{fmt:02X} announces {len} bytes, {payload_len} were received"));
    }
    Ok(())
}

impl ResponseClassifier for LegacyClassifier {
    fn process(&mut self, x: &mut Exchange<'_>, frame: &WireFrame) -> Verdict {
        if frame.is_echo() {
            self.reference_us = Some(frame.timestamp_us);
            self.start_of_message_us = None;
            return Verdict::Pass;
        }
        if frame.rx_status.contains(RxStatus::START_OF_MESSAGE) {
            if x.protocol.measures_from_start_of_message() {
                self.start_of_message_us = Some(frame.timestamp_us);
            }
            return Verdict::Pass;
        }

        let hs = x.protocol.header_size;
        let payload = frame.payload(hs);
        let header = match frame.header(hs) {
            Some(h) if !payload.is_empty() => h,
            _ => {
                return x.violation(
                    Verdict::Errors,
                    format!("Ignoring {} byte message {}", frame.len(), hex(&frame.data)),
                )
            }
        };
        if x.protocol.has_format_byte() {
            if let Err(e) = check_format_byte(header[0], payload.len()) {
                return x.violation(Verdict::Fail, format!("Message {}: {}", hex(&frame.data), e));
            }
        }
        let slot = match x.slot_for(header) {
            Ok(slot) => slot,
            Err(v) => return v,
        };

        let mark = self.start_of_message_us.take().unwrap_or(frame.timestamp_us);
        let response_ms = self.reference_us.map(|r| mark.wrapping_sub(r) / 1000);
        self.reference_us = Some(frame.timestamp_us);
        let max = x.timing.slot_mut(slot).allowed_max_ms(x.protocol.max_response_ms());
        let mut v = x.check_window(slot, response_ms, max, true);

        if payload[0] == NEGATIVE_RESPONSE_SID {
            v.escalate(x.negative(slot, payload));
            return v;
        }
        v.escalate(x.check_positive(slot, payload));
        if v == Verdict::Fail {
            return v;
        }
        let append = MULTI_MESSAGE_SERVICES.contains(&x.request.sid());
        v.escalate(x.store_positive(slot, payload, append));
        x.timing.slot_mut(slot).pending_delay_ms = 0;
        x.extension_ms = x.timing.largest_extension_ms();
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_byte() {
        assert!(check_format_byte(0x86, 6).is_ok());
        assert!(check_format_byte(0xC2, 2).is_ok());
        assert!(check_format_byte(0x46, 6).is_err());
        assert!(check_format_byte(0x86, 5).is_err());
        assert!(check_format_byte(0x88, 8).is_err());
        assert!(check_format_byte(0x80, 0).is_err());
    }
}
