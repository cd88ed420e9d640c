//! Service requests, request flags and frame construction

use bitflags::bitflags;

use crate::channel::{TxFlags, WireFrame};
use crate::config::MAX_SUB_IDS;
use crate::protocol::{ProtocolDescriptor, ProtocolTag};

/// Offset between a request SID and its positive response SID
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;
/// Negative response SID
pub const NEGATIVE_RESPONSE_SID: u8 = 0x7F;

/// Tester source address on every protocol
pub const TESTER_ADDRESS: u8 = 0xF1;
/// Functional 11bit request identifier
pub const CAN_FUNCTIONAL_ID: u32 = 0x7DF;
/// Functional 29bit request identifier
pub const CAN_EXT_FUNCTIONAL_ID: u32 = 0x18DB_33F1;

bitflags! {
    /// Options of a single request
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct RequestFlags: u32 {
        /// No response is not a failure. The caller inspects the response store itself
        const ALLOW_NO_RESPONSE = 0x01;
        /// Do not warn about missing responses, still fail on them
        const IGNORE_NO_RESPONSE = 0x02;
        /// Burst mode: keep the keep-alive running and skip the inter request delay
        const NO_PERIODIC_DISABLE = 0x04;
        /// Stop listening once every expected ECU responded once. Only for single frame services
        const RETURN_AFTER_ALL_RESPONSES = 0x08;
    }
}

impl RequestFlags {
    /// Plain request
    pub const NORMAL: RequestFlags = RequestFlags::empty();
}

/// Error building a request
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Too many sub-ids for a single request
    #[error("{0} sub-ids requested, at most {max} fit a request", max = MAX_SUB_IDS)]
    TooManySubIds(usize),
    /// The protocol cannot carry requests
    #[error("no request header is defined for protocol {0}")]
    UnknownProtocol(ProtocolTag),
}

/// One outbound diagnostic query
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceRequest {
    sid: u8,
    sub_ids: Vec<u8>,
}

impl ServiceRequest {
    /// Creates a request
    pub fn new(sid: u8, sub_ids: &[u8]) -> Result<Self, FrameError> {
        if sub_ids.len() > MAX_SUB_IDS {
            return Err(FrameError::TooManySubIds(sub_ids.len()));
        }
        Ok(Self {
            sid,
            sub_ids: sub_ids.to_vec(),
        })
    }

    /// The minimal probe used to find the vehicle's protocol: SID 01 PID 00
    pub fn probe() -> Self {
        Self {
            sid: 0x01,
            sub_ids: vec![0x00],
        }
    }

    /// Service ID
    pub fn sid(&self) -> u8 {
        self.sid
    }

    /// Sub IDs (PIDs, MIDs, TIDs or INFs)
    pub fn sub_ids(&self) -> &[u8] {
        &self.sub_ids
    }

    /// SID expected in a positive response
    pub fn response_sid(&self) -> u8 {
        self.sid.wrapping_add(POSITIVE_RESPONSE_OFFSET)
    }

    /// True for SID 01 PID 00, which every OBD ECU has to answer
    pub fn is_probe(&self) -> bool {
        self.sid == 0x01 && self.sub_ids == [0x00]
    }

    /// True for the "supported sub-ids" queries (sub-id 0x00), which every
    /// OBD ECU supporting the service has to answer
    pub fn is_support_query(&self) -> bool {
        matches!(self.sid, 0x01 | 0x02 | 0x06 | 0x08 | 0x09) && self.sub_ids.first() == Some(&0x00)
    }

    /// Service payload (SID followed by sub IDs)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut r = Vec::with_capacity(self.sub_ids.len() + 1);
        r.push(self.sid);
        r.extend_from_slice(&self.sub_ids);
        r
    }

    /// Builds the functional request frame for a protocol
    pub fn build_frame(&self, protocol: &ProtocolDescriptor) -> Result<WireFrame, FrameError> {
        let body = self.to_bytes();
        let (header, flags): (Vec<u8>, TxFlags) = match protocol.tag {
            ProtocolTag::J1850Pwm => (vec![0x61, 0x6A, TESTER_ADDRESS], TxFlags::empty()),
            ProtocolTag::J1850Vpw | ProtocolTag::Iso9141 => (vec![0x68, 0x6A, TESTER_ADDRESS], TxFlags::empty()),
            ProtocolTag::Iso14230 | ProtocolTag::Iso14230Fast => {
                // Functional addressing, length in the low bits
                (vec![0xC0 | body.len() as u8, 0x33, TESTER_ADDRESS], TxFlags::empty())
            }
            ProtocolTag::Iso15765 | ProtocolTag::Iso15765At250k => {
                (CAN_FUNCTIONAL_ID.to_be_bytes().to_vec(), TxFlags::ISO15765_FRAME_PAD)
            }
            ProtocolTag::Iso15765Ext | ProtocolTag::Iso15765ExtAt250k => (
                CAN_EXT_FUNCTIONAL_ID.to_be_bytes().to_vec(),
                TxFlags::ISO15765_FRAME_PAD | TxFlags::CAN_29BIT_ID,
            ),
        };
        if header.len() != protocol.header_size {
            return Err(FrameError::UnknownProtocol(protocol.tag));
        }
        let mut data = header;
        data.extend_from_slice(&body);
        Ok(WireFrame::new(protocol.kind, flags, &data))
    }
}

impl std::fmt::Display for ServiceRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SID ${:02X}", self.sid)?;
        for id in &self.sub_ids {
            write!(f, " ${:02X}", id)?;
        }
        Ok(())
    }
}
