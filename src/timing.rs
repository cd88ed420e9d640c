//! Response timing statistics of each responding ECU

/// Timing record of one ECU, for the request currently being executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EcuTiming {
    /// Sum of all response times
    pub total_response_ms: u64,
    /// Number of responses timed
    pub response_count: u32,
    /// Longest response time seen
    pub longest_response_ms: u32,
    /// Responses that arrived before the minimum response time
    pub too_soon: u32,
    /// Responses that arrived after the maximum response time
    pub too_late: u32,
    /// Window extension of a multi frame response in progress
    pub extension_ms: u32,
    /// Window extension granted by a response pending NRC
    pub pending_delay_ms: u32,
    /// A tolerated negative response of this ECU was already counted
    pub nak_counted: bool,
    /// This ECU already counts as a responder of the current request
    pub responded: bool,
}

impl EcuTiming {
    /// Adds a response time to the aggregates
    pub fn record(&mut self, response_ms: u32) {
        self.total_response_ms += response_ms as u64;
        self.response_count += 1;
        self.longest_response_ms = self.longest_response_ms.max(response_ms);
    }

    /// Average response time, if anything was timed
    pub fn average_ms(&self) -> Option<u32> {
        match self.response_count {
            0 => None,
            n => Some((self.total_response_ms / n as u64) as u32),
        }
    }

    /// Largest response time this ECU is currently allowed
    pub fn allowed_max_ms(&self, base_max_ms: u32) -> u32 {
        base_max_ms + self.extension_ms.max(self.pending_delay_ms)
    }
}

/// Timing records indexed by ECU slot. Slots are handed out by the
/// [crate::store::ResponseStore], this table only grows to match.
#[derive(Debug, Clone, Default)]
pub struct EcuTimingTable {
    records: Vec<EcuTiming>,
}

impl EcuTimingTable {
    /// Record of a slot, created on first use
    pub fn slot_mut(&mut self, slot: usize) -> &mut EcuTiming {
        if slot >= self.records.len() {
            self.records.resize(slot + 1, EcuTiming::default());
        }
        &mut self.records[slot]
    }

    /// Record of a slot, if that ECU was seen
    pub fn get(&self, slot: usize) -> Option<&EcuTiming> {
        self.records.get(slot)
    }

    /// Zeroes every record, keeping the slots
    pub fn reset(&mut self) {
        self.records.iter_mut().for_each(|r| *r = EcuTiming::default());
    }

    /// Drops every slot
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if no ECU was seen
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Largest extension of any ECU
    pub fn largest_extension_ms(&self) -> u32 {
        self.records
            .iter()
            .map(|r| r.extension_ms.max(r.pending_delay_ms))
            .max()
            .unwrap_or(0)
    }

    /// Iterates records by slot
    pub fn iter(&self) -> impl Iterator<Item = (usize, &EcuTiming)> {
        self.records.iter().enumerate()
    }
}
