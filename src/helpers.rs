//! Small helpers shared by the prober and the request engine

use std::time::Duration;

use log::{debug, error};

/// Checks if the response payload matches the request ServiceID.
/// The matching positive response SID is request + 0x40.
///
/// ## Parameters
/// * sid - The SID to match against
/// * resp - Response payload from the ECU, starting with its SID
pub(crate) fn check_pos_response_id(sid: u8, resp: &[u8]) -> bool {
    match resp.first() {
        Some(r) if *r == sid.wrapping_add(0x40) => true,
        Some(r) => {
            error!("ECU SID mismatch. Request SID was 0x{:02X}, response SID was 0x{:02X}", sid, r);
            false
        }
        None => {
            error!("ECU response to SID 0x{:02X} carries no SID", sid);
            false
        }
    }
}

/// Runs `attempt` until `should_retry` rejects its result or `max_attempts`
/// were made, sleeping `backoff` in between. Returns the last result.
///
/// `attempt` receives the zero based attempt number.
pub fn retry<T, P, F>(max_attempts: u32, backoff: Duration, should_retry: P, mut attempt: F) -> T
where
    P: Fn(&T) -> bool,
    F: FnMut(u32) -> T,
{
    let mut n = 0;
    loop {
        let res = attempt(n);
        n += 1;
        if n >= max_attempts || !should_retry(&res) {
            return res;
        }
        debug!("Attempt {} of {} needs repeating, waiting {:?}", n, max_attempts, backoff);
        if !backoff.is_zero() {
            std::thread::sleep(backoff);
        }
    }
}

/// Formats bytes as space separated hex
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_stops_on_success() {
        let mut calls = 0;
        let r = retry(6, Duration::ZERO, |v: &u32| *v < 3, |n| {
            calls += 1;
            n + 1
        });
        assert_eq!(3, r);
        assert_eq!(3, calls);
    }

    #[test]
    fn retry_is_bounded() {
        let mut calls = 0;
        let r = retry(4, Duration::ZERO, |_: &bool| true, |_| {
            calls += 1;
            false
        });
        assert!(!r);
        assert_eq!(4, calls);
    }

    #[test]
    fn positive_response_id() {
        assert!(check_pos_response_id(0x01, &[0x41, 0x00]));
        assert!(!check_pos_response_id(0x01, &[0x49, 0x00]));
        assert!(!check_pos_response_id(0x01, &[]));
        assert_eq!("41 00 BE", hex(&[0x41, 0x00, 0xBE]));
    }
}
