//! Connect fingerprint
//!
//! The first time protocol determination finds the vehicle, the protocol and
//! the set of responding ECU headers are captured. Every later connect in the
//! same session has to reproduce them exactly, or the vehicle behaves
//! inconsistently and the result is a failure.

use std::collections::BTreeSet;

use log::{error, info};

use crate::hardware::Adapter;
use crate::helpers::hex;
use crate::protocol::ProtocolTag;
use crate::session::Session;
use crate::verdict::Verdict;

/// Protocol and responding ECUs of a successful connect
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectFingerprint {
    /// Protocol the vehicle answered on
    pub protocol: ProtocolTag,
    /// Header size of that protocol
    pub header_size: usize,
    /// Headers of the responding ECUs. Order does not matter
    pub headers: BTreeSet<Vec<u8>>,
}

impl ConnectFingerprint {
    /// Creates a fingerprint
    pub fn new(protocol: ProtocolTag, header_size: usize, headers: Vec<Vec<u8>>) -> Self {
        Self {
            protocol,
            header_size,
            headers: headers.into_iter().collect(),
        }
    }

    /// Captures the connection of a session: its targeted protocol and the
    /// ECUs that responded to the last request
    pub fn capture<A: Adapter>(session: &Session<A>) -> Option<Self> {
        session.current_connection()
    }

    /// Compares the current connection of a session against this fingerprint
    pub fn verify_session<A: Adapter>(&self, session: &Session<A>) -> Verdict {
        match session.current_connection() {
            Some(current) => self.verify(&current),
            None => {
                error!("No protocol is targeted, the connection cannot match the fingerprint");
                Verdict::Fail
            }
        }
    }

    /// Number of responding ECUs
    pub fn ecu_count(&self) -> usize {
        self.headers.len()
    }

    /// Compares a later connect against this fingerprint. Every difference is
    /// logged, any difference is a [Verdict::Fail]
    pub fn verify(&self, current: &ConnectFingerprint) -> Verdict {
        let mut v = Verdict::Pass;
        if self.protocol != current.protocol {
            error!("Vehicle answered on {} after answering on {}", current.protocol, self.protocol);
            v = Verdict::Fail;
        }
        if self.ecu_count() != current.ecu_count() {
            error!(
                "{} ECUs responded, {} responded when the protocol was first found",
                current.ecu_count(),
                self.ecu_count()
            );
            v = Verdict::Fail;
        }
        if self.header_size != current.header_size {
            error!("Header size changed from {} to {}", self.header_size, current.header_size);
            v = Verdict::Fail;
        }
        for h in current.headers.difference(&self.headers) {
            error!("ECU with header {} was not present when the protocol was first found", hex(h));
            v = Verdict::Fail;
        }
        for h in self.headers.difference(&current.headers) {
            error!("ECU with header {} no longer responds", hex(h));
            v = Verdict::Fail;
        }
        if v == Verdict::Pass {
            info!("Connect matches the fingerprint ({} on {} ECUs)", self.protocol, self.ecu_count());
        }
        v
    }
}
