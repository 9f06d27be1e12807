//! Field remapping from the SNS/Ho01 telemetry payload to the Daren payload.
//!
//! All offsets are positions in hex characters. Destination offsets address
//! the Daren info body including its `08FE` prefix, i.e. the buffer before the
//! prefix is dropped.

use crate::error::{Error, Result};
use std::ops::Range;

/// Minimum slave payload length covering every mapped field.
pub const MIN_SLAVE_PAYLOAD_LENGTH: usize = 152;
/// Address and flag byte analog leading the Daren info body.
pub const MASTER_INFO_PREFIX: &str = "08FE";
/// Length of the translated payload following the reply header.
pub const MASTER_PAYLOAD_LENGTH: usize = 148;
/// Alarm, status and running state bytes. There is no known source for them
/// in the service 0x42 reply, so a fixed healthy state is reported.
pub const UNMAPPED_STATUS_PLACEHOLDER: &str = "00000000001000000000003000000";

const DESTINATION_WIDTH: usize = MASTER_INFO_PREFIX.len() + MASTER_PAYLOAD_LENGTH;
// source region copied verbatim before any remapping
const SHARED_BODY: HexRange = HexRange::new(4, MIN_SLAVE_PAYLOAD_LENGTH);

const CELL_COUNT: usize = 16;
const CELL_WIDTH: usize = 4;
const CELL_SOURCE_BASE: usize = 12;
const CELL_DESTINATION_BASE: usize = 34;

/// Half open range of hex character offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HexRange {
    pub start: usize,
    pub end: usize,
}

impl HexRange {
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub const fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overlaps(&self, other: &HexRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// Copies `source` of the slave payload to `destination` of the master body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMapping {
    pub name: &'static str,
    pub destination: HexRange,
    pub source: HexRange,
}

impl FieldMapping {
    pub const fn new(name: &'static str, destination: HexRange, source: HexRange) -> Self {
        Self {
            name,
            destination,
            source,
        }
    }
}

const fn cell_voltage_mapping() -> [FieldMapping; CELL_COUNT] {
    let mut table = [FieldMapping::new("cell voltage", HexRange::new(0, 0), HexRange::new(0, 0));
        CELL_COUNT];
    let mut cell = 0;
    while cell < CELL_COUNT {
        let destination = CELL_DESTINATION_BASE + cell * CELL_WIDTH;
        let source = CELL_SOURCE_BASE + cell * CELL_WIDTH;
        table[cell] = FieldMapping::new(
            "cell voltage",
            HexRange::new(destination, destination + CELL_WIDTH),
            HexRange::new(source, source + CELL_WIDTH),
        );
        cell += 1;
    }
    table
}

/// The 16 cell voltages, same stride on both sides, different base offset.
pub const CELL_VOLTAGE_MAPPING: [FieldMapping; CELL_COUNT] = cell_voltage_mapping();

/// Fields at irregular offsets. Capacity is available only once on the slave
/// side and fills both installed and full charge capacity.
pub const STATIC_FIELD_MAPPING: [FieldMapping; 6] = [
    FieldMapping::new("SOH", HexRange::new(14, 18), HexRange::new(114, 118)),
    FieldMapping::new("remaining capacity", HexRange::new(18, 22), HexRange::new(124, 128)),
    FieldMapping::new("installed capacity", HexRange::new(22, 26), HexRange::new(120, 124)),
    FieldMapping::new("full charge capacity", HexRange::new(26, 30), HexRange::new(120, 124)),
    FieldMapping::new("MOS temperature", HexRange::new(98, 102), HexRange::new(84, 88)),
    FieldMapping::new("cell temperatures", HexRange::new(102, 118), HexRange::new(90, 106)),
];

/// Checks a mapping table: equal widths, in bounds on both sides, clear of the
/// placeholder tail and pairwise disjoint destinations.
pub fn validate_mappings(mappings: &[FieldMapping]) -> Result<()> {
    let placeholder = HexRange::new(
        DESTINATION_WIDTH - UNMAPPED_STATUS_PLACEHOLDER.len(),
        DESTINATION_WIDTH,
    );
    let prefix = HexRange::new(0, MASTER_INFO_PREFIX.len());
    for (index, mapping) in mappings.iter().enumerate() {
        if mapping.destination.is_empty() || mapping.destination.len() != mapping.source.len() {
            return Err(Error::InvalidMapping(format!(
                "{}: destination {:?} and source {:?} differ in width",
                mapping.name, mapping.destination, mapping.source
            )));
        }
        if mapping.source.end > MIN_SLAVE_PAYLOAD_LENGTH {
            return Err(Error::InvalidMapping(format!(
                "{}: source {:?} exceeds the minimum payload of {MIN_SLAVE_PAYLOAD_LENGTH}",
                mapping.name, mapping.source
            )));
        }
        if mapping.destination.end > DESTINATION_WIDTH
            || mapping.destination.overlaps(&prefix)
            || mapping.destination.overlaps(&placeholder)
        {
            return Err(Error::InvalidMapping(format!(
                "{}: destination {:?} outside the mappable body",
                mapping.name, mapping.destination
            )));
        }
        if let Some(other) = mappings[index + 1..]
            .iter()
            .find(|other| other.destination.overlaps(&mapping.destination))
        {
            return Err(Error::InvalidMapping(format!(
                "{} {:?} overlaps {} {:?}",
                mapping.name, mapping.destination, other.name, other.destination
            )));
        }
    }
    Ok(())
}

/// Translates slave telemetry payloads into master payloads.
#[derive(Debug, Clone)]
pub struct Translator {
    mappings: Vec<FieldMapping>,
}

impl Translator {
    /// Builds the translator from the cell voltage and static field tables.
    pub fn new() -> Result<Self> {
        Self::with_mappings(
            CELL_VOLTAGE_MAPPING
                .iter()
                .chain(STATIC_FIELD_MAPPING.iter())
                .copied()
                .collect(),
        )
    }

    pub fn with_mappings(mappings: Vec<FieldMapping>) -> Result<Self> {
        validate_mappings(&mappings)?;
        Ok(Self { mappings })
    }

    pub fn mappings(&self) -> &[FieldMapping] {
        &self.mappings
    }

    /// Returns the 148 character master payload for a slave payload.
    pub fn translate(&self, payload: &str) -> Result<String> {
        if payload.len() < MIN_SLAVE_PAYLOAD_LENGTH {
            return Err(Error::TranslationUnderflow(
                payload.len(),
                MIN_SLAVE_PAYLOAD_LENGTH,
            ));
        }
        let source = payload.as_bytes();
        if let Some(offset) = source.iter().position(|b| !b.is_ascii_hexdigit()) {
            return Err(Error::InvalidHex(offset));
        }

        let mut buffer = Vec::with_capacity(DESTINATION_WIDTH);
        buffer.extend_from_slice(MASTER_INFO_PREFIX.as_bytes());
        buffer.extend_from_slice(&source[SHARED_BODY.range()]);

        for mapping in &self.mappings {
            log::trace!(
                "{} {} -> {:?}",
                mapping.name,
                &payload[mapping.source.range()],
                mapping.destination
            );
            buffer[mapping.destination.range()].copy_from_slice(&source[mapping.source.range()]);
        }

        buffer.drain(..MASTER_INFO_PREFIX.len());
        let tail = buffer.len() - UNMAPPED_STATUS_PLACEHOLDER.len();
        buffer[tail..].copy_from_slice(UNMAPPED_STATUS_PLACEHOLDER.as_bytes());

        String::from_utf8(buffer).map_err(|err| Error::InvalidHex(err.utf8_error().valid_up_to()))
    }
}
