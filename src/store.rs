//! Storage of ECU responses, indexed by ECU slot and keyed by service
//!
//! ECUs get a slot the first time they are seen, and keep it for the rest
//! of the session.

use std::collections::HashMap;

use crate::config::MAX_ECUS;
use crate::protocol::ProtocolFamily;

/// Error produced by the response store
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// More ECUs responded than the store has room for
    #[error("more than {0} ECUs responded")]
    CapacityExceeded(usize),
}

/// Response of one ECU to one service
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceResponse {
    /// Response payload, following the response SID
    pub data: Vec<u8>,
    /// Set once a response was stored during the current request
    pub received: bool,
}

impl ServiceResponse {
    /// Payload size
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Responses of one ECU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcuResponses {
    header: Vec<u8>,
    services: HashMap<u8, ServiceResponse>,
}

impl EcuResponses {
    /// Raw header bytes of the ECU's first response
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// Response to a service
    pub fn service(&self, sid: u8) -> Option<&ServiceResponse> {
        self.services.get(&sid)
    }
}

/// Derives the numeric identity of an ECU from a response header.
///
/// Segmented transport uses the whole CAN identifier, legacy links the
/// source address in the third header byte.
pub fn derive_ecu_id(family: ProtocolFamily, header: &[u8]) -> Option<u32> {
    match family {
        ProtocolFamily::Segmented => {
            let b = header.get(..4)?;
            Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        }
        ProtocolFamily::Legacy => header.get(2).map(|b| *b as u32),
    }
}

/// Responses of every ECU
#[derive(Debug, Clone)]
pub struct ResponseStore {
    family: ProtocolFamily,
    capacity: usize,
    ecus: Vec<EcuResponses>,
}

impl Default for ResponseStore {
    fn default() -> Self {
        Self::new(ProtocolFamily::Legacy, MAX_ECUS)
    }
}

impl ResponseStore {
    /// Creates an empty store
    pub fn new(family: ProtocolFamily, capacity: usize) -> Self {
        Self {
            family,
            capacity,
            ecus: Vec::new(),
        }
    }

    /// Forgets every ECU and switches the identity derivation to another family
    pub fn reset(&mut self, family: ProtocolFamily) {
        self.family = family;
        self.ecus.clear();
    }

    /// Identity derivation family in use
    pub fn family(&self) -> ProtocolFamily {
        self.family
    }

    /// Number of ECUs seen
    pub fn len(&self) -> usize {
        self.ecus.len()
    }

    /// True if no ECU was seen
    pub fn is_empty(&self) -> bool {
        self.ecus.is_empty()
    }

    /// Slot of the ECU that sent `header`, assigning the next slot to a new ECU
    pub fn slot_for(&mut self, header: &[u8]) -> Result<usize, StoreError> {
        if let Some(slot) = self.find_slot(header) {
            return Ok(slot);
        }
        if self.ecus.len() >= self.capacity {
            return Err(StoreError::CapacityExceeded(self.capacity));
        }
        self.ecus.push(EcuResponses {
            header: header.to_vec(),
            services: HashMap::new(),
        });
        Ok(self.ecus.len() - 1)
    }

    /// Slot of the ECU that sent `header`, if it was seen before
    pub fn find_slot(&self, header: &[u8]) -> Option<usize> {
        let id = derive_ecu_id(self.family, header)?;
        self.ecus
            .iter()
            .position(|e| derive_ecu_id(self.family, &e.header) == Some(id))
    }

    /// Responses of a slot
    pub fn ecu(&self, slot: usize) -> Option<&EcuResponses> {
        self.ecus.get(slot)
    }

    /// Numeric identity of the ECU in a slot
    pub fn ecu_id(&self, slot: usize) -> Option<u32> {
        derive_ecu_id(self.family, &self.ecus.get(slot)?.header)
    }

    /// Header bytes of the ECU in a slot
    pub fn header(&self, slot: usize) -> Option<&[u8]> {
        self.ecus.get(slot).map(|e| e.header.as_slice())
    }

    /// Response of a slot to a service
    pub fn response(&self, slot: usize, sid: u8) -> Option<&ServiceResponse> {
        self.ecus.get(slot)?.services.get(&sid)
    }

    /// Mutable response of a slot to a service, created empty if missing
    pub(crate) fn response_mut(&mut self, slot: usize, sid: u8) -> Option<&mut ServiceResponse> {
        Some(self.ecus.get_mut(slot)?.services.entry(sid).or_default())
    }

    /// Clears the previous responses to `sid`, before that service is requested again
    pub fn begin_request(&mut self, sid: u8) {
        for ecu in self.ecus.iter_mut() {
            ecu.services.remove(&sid);
        }
    }

    /// Iterates slots and their responses
    pub fn iter(&self) -> impl Iterator<Item = (usize, &EcuResponses)> {
        self.ecus.iter().enumerate()
    }
}
