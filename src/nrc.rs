//! Negative response codes of OBD ECUs, and how the tester treats them

use crate::request::ServiceRequest;
use crate::verdict::Verdict;

/// Negative response codes an OBD ECU may send
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, strum_macros::FromRepr, strum_macros::Display)]
#[repr(u8)]
pub enum Nrc {
    /// ECU rejected the request for unknown reason
    GeneralReject = 0x10,
    /// ECU does not support the requested service
    ServiceNotSupported = 0x11,
    /// ECU does not support the sub-id, or the message format is incorrect
    SubFunctionNotSupported = 0x12,
    /// ECU is too busy to perform the request
    BusyRepeatRequest = 0x21,
    /// ECU prerequisite conditions are not met / request sequence error
    ConditionsNotCorrect = 0x22,
    /// The request contains data which is out of range
    RequestOutOfRange = 0x31,
    /// The ECU has accepted the request, but cannot reply right now
    ResponsePending = 0x78,
}

/// What an engine does with a negative response
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NrcAction {
    /// Extend the response window and wait for the real response
    Pending,
    /// Accepted, the ECU counts as having responded
    Tolerated,
    /// The request must be repeated (protocol determination only)
    Retry,
    /// Conformance failure
    Fail,
}

impl NrcAction {
    /// Verdict contributed by the action
    pub fn verdict(&self) -> Verdict {
        match self {
            NrcAction::Pending | NrcAction::Tolerated => Verdict::Pass,
            NrcAction::Retry => Verdict::Retry,
            NrcAction::Fail => Verdict::Fail,
        }
    }
}

/// Decides how a negative response code is treated, given the request it answers.
///
/// | NRC        | Treatment                                                      |
/// |------------|----------------------------------------------------------------|
/// | 0x78       | pending                                                        |
/// | 0x21       | retry for SID 01 PID 00 during protocol determination, else fail |
/// | 0x22       | tolerated for SID 04 (clear diagnostic information), else fail |
/// | 0x12, 0x31 | tolerated for SID 08 (on-board system control), else fail     |
/// | other      | fail                                                           |
pub fn disposition(code: u8, request: &ServiceRequest, determining: bool) -> NrcAction {
    match Nrc::from_repr(code) {
        Some(Nrc::ResponsePending) => NrcAction::Pending,
        Some(Nrc::BusyRepeatRequest) if determining && request.is_probe() => NrcAction::Retry,
        Some(Nrc::ConditionsNotCorrect) if request.sid() == 0x04 => NrcAction::Tolerated,
        Some(Nrc::SubFunctionNotSupported | Nrc::RequestOutOfRange) if request.sid() == 0x08 => NrcAction::Tolerated,
        _ => NrcAction::Fail,
    }
}

/// Human readable name of a negative response code
pub fn describe(code: u8) -> String {
    match Nrc::from_repr(code) {
        Some(nrc) => format!("{nrc} (0x{code:02X})"),
        None => format!("unknown NRC 0x{code:02X}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_only_retries_the_probe_while_determining() {
        let probe = ServiceRequest::probe();
        assert_eq!(NrcAction::Retry, disposition(0x21, &probe, true));
        assert_eq!(NrcAction::Fail, disposition(0x21, &probe, false));
        let other = ServiceRequest::new(0x01, &[0x0C]).unwrap();
        assert_eq!(NrcAction::Fail, disposition(0x21, &other, true));
    }

    #[test]
    fn pending_is_never_an_error() {
        for sid in [0x01, 0x04, 0x09] {
            let req = ServiceRequest::new(sid, &[]).unwrap();
            assert_eq!(NrcAction::Pending, disposition(0x78, &req, false));
            assert_eq!(Verdict::Pass, NrcAction::Pending.verdict());
        }
    }

    #[test]
    fn tolerated_codes() {
        let clear = ServiceRequest::new(0x04, &[]).unwrap();
        assert_eq!(NrcAction::Tolerated, disposition(0x22, &clear, false));
        let mode1 = ServiceRequest::new(0x01, &[0x0D]).unwrap();
        assert_eq!(NrcAction::Fail, disposition(0x22, &mode1, false));
        let control = ServiceRequest::new(0x08, &[0x01]).unwrap();
        assert_eq!(NrcAction::Tolerated, disposition(0x31, &control, false));
        assert_eq!(NrcAction::Fail, disposition(0x11, &control, false));
        assert_eq!(NrcAction::Fail, disposition(0x99, &control, false));
    }

    #[test]
    fn descriptions() {
        assert_eq!("ResponsePending (0x78)", describe(0x78));
        assert_eq!("unknown NRC 0x99", describe(0x99));
    }
}
