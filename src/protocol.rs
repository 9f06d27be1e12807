use crate::error::{Error, Result};

/// Frame terminator for both protocols.
pub const TERMINATOR: u8 = b'\r';
/// Start marker of responses and of master polls.
pub const RESPONSE_MARKER: u8 = b'~';
/// Start marker of commands sent to the slave.
pub const COMMAND_MARKER: u8 = b'>';

pub const PROTOCOL_VERSION: u8 = 0x22;
pub const MAX_ADDRESS: u8 = 31;

/// Prefix of a version 2 master poll.
pub const MASTER_REQUEST_PREFIX: &[u8] = b"~22";

/// Service 0x42 telemetry query. The slave answers for the address of the
/// physical link, the address field of this command is not evaluated.
pub const TELEMETRY_QUERY: &[u8] = b">220842420000FDA8\r";

/// Header of every reply sent to the master: version, address 0x08,
/// CID1 0x4A, CID2 0x85, length field for 152 hex characters and the
/// `08FE` info prefix.
pub const MASTER_REPLY_HEADER: &[u8] = b"22084A85F09808FE";

// start marker, version, address, cid1, cid2, length field
const HEADER_LENGTH: usize = 13;
// checksum, terminator
const TRAILER_LENGTH: usize = 5;

/// Two's complement negation of the byte sum, modulo 65536.
pub fn checksum(bytes: &[u8]) -> u16 {
    let sum = bytes
        .iter()
        .fold(0u16, |acc, b| acc.wrapping_add(u16::from(*b)));
    (!sum).wrapping_add(1)
}

/// Packs a 12 bit length with its 4 bit check nibble.
///
/// The check nibble is `((n0 + n1 + n2) & 0xF) ^ 0xF` plus one, truncated to
/// four bits so a zero length encodes as `0000`.
pub fn length_field(byte_length: usize) -> u16 {
    let value = (byte_length & 0x0FFF) as u16;
    let sum = (value & 0xF) + ((value >> 4) & 0xF) + ((value >> 8) & 0xF);
    let check = (((sum & 0xF) ^ 0xF) + 1) & 0xF;
    value | (check << 12)
}

fn parse_hex_u8(field: &[u8]) -> Option<u8> {
    if field.len() != 2 || !field.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    u8::from_str_radix(std::str::from_utf8(field).ok()?, 16).ok()
}

fn parse_hex_u16(field: &[u8]) -> Option<u16> {
    if field.is_empty() || field.len() > 4 || !field.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    u16::from_str_radix(std::str::from_utf8(field).ok()?, 16).ok()
}

/// Verifies the trailing checksum of a terminated frame.
pub fn validate_checksum(frame: &[u8]) -> Result<()> {
    if frame.len() < HEADER_LENGTH + TRAILER_LENGTH {
        return Err(Error::TranslationUnderflow(
            frame.len(),
            HEADER_LENGTH + TRAILER_LENGTH,
        ));
    }
    let end = frame.len() - TRAILER_LENGTH;
    let received = parse_hex_u16(&frame[end..end + 4]).ok_or(Error::InvalidHex(end))?;
    let calculated = checksum(&frame[1..end]);
    if received != calculated {
        log::warn!(
            "Invalid checksum - calculated={calculated:04X} received={received:04X} frame={}",
            frame.escape_ascii()
        );
        return Err(Error::ChecksumMismatch {
            calculated,
            received,
        });
    }
    Ok(())
}

/// An outgoing command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command<'a> {
    pub version: u8,
    pub address: u8,
    pub cid1: u8,
    pub cid2: u8,
    /// Hex encoded info body.
    pub info: &'a str,
}

impl Command<'_> {
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = format!(
            "{}{:02X}{:02X}{:02X}{:02X}{:04X}{}",
            COMMAND_MARKER as char,
            self.version,
            self.address,
            self.cid1,
            self.cid2,
            length_field(self.info.len()),
            self.info
        )
        .into_bytes();
        let checksum = checksum(&frame[1..]);
        frame.extend_from_slice(format!("{checksum:04X}").as_bytes());
        frame.push(TERMINATOR);
        frame
    }
}

/// A poll received from the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterRequest {
    address: u8,
}

impl MasterRequest {
    /// Classifies a complete frame read from the master link.
    ///
    /// Returns `Ok(None)` for frames that are not master polls (for example
    /// replies of other devices on the bus) and `Err(MalformedRequest)` for
    /// polls whose address field is unparsable or out of range.
    pub fn classify(frame: &[u8]) -> Result<Option<Self>> {
        if !frame.starts_with(MASTER_REQUEST_PREFIX) {
            log::debug!("Ignoring non-master message: {}", frame.escape_ascii());
            return Ok(None);
        }
        let field = frame.get(3..5).ok_or_else(|| {
            Error::MalformedRequest(format!("frame too short: {}", frame.escape_ascii()))
        })?;
        let address = parse_hex_u8(field).ok_or_else(|| {
            Error::MalformedRequest(format!("address field '{}' is not hex", field.escape_ascii()))
        })?;
        if address > MAX_ADDRESS {
            return Err(Error::MalformedRequest(format!(
                "address {address} outside 0..={MAX_ADDRESS}"
            )));
        }
        log::debug!("Valid master request for address {address}");
        Ok(Some(Self { address }))
    }

    pub fn address(&self) -> u8 {
        self.address
    }
}

/// A slave frame that passed the validation pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveResponse {
    frame: Vec<u8>,
}

impl SlaveResponse {
    /// Checks that the frame is printable ASCII, starts with a reply marker
    /// and, if requested, carries a matching checksum.
    pub fn validate(frame: Vec<u8>, verify_checksum: bool) -> Result<Self> {
        if !frame
            .iter()
            .all(|b| b.is_ascii_graphic() || *b == b' ' || *b == TERMINATOR)
        {
            return Err(Error::SlaveDecode);
        }
        match frame.first() {
            Some(&COMMAND_MARKER) | Some(&RESPONSE_MARKER) => {}
            Some(other) => return Err(Error::SlaveFormat(*other as char)),
            None => return Err(Error::SlaveNoResponse(1)),
        }
        if verify_checksum {
            validate_checksum(&frame)?;
        }
        Ok(Self { frame })
    }

    /// Hex body between the fixed header and the checksum.
    pub fn payload(&self) -> &str {
        let end = self.frame.len().saturating_sub(TRAILER_LENGTH);
        self.frame
            .get(HEADER_LENGTH..end)
            .and_then(|body| std::str::from_utf8(body).ok())
            .unwrap_or_default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.frame
    }
}

/// Wraps a translated payload into a complete master frame.
pub fn build_master_frame(payload: &str) -> Vec<u8> {
    let mut frame =
        Vec::with_capacity(1 + MASTER_REPLY_HEADER.len() + payload.len() + TRAILER_LENGTH);
    frame.push(RESPONSE_MARKER);
    frame.extend_from_slice(MASTER_REPLY_HEADER);
    frame.extend_from_slice(payload.as_bytes());
    let checksum = checksum(&frame[1..]);
    frame.extend_from_slice(format!("{checksum:04X}").as_bytes());
    frame.push(TERMINATOR);
    frame
}

/// Raw telemetry values carried by a master frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterTelemetry {
    pub pack_voltage: u16,
    pub soh: u16,
    pub soc: u16,
    pub installed_capacity: u16,
    pub full_charge_capacity: u16,
    pub cell_voltages: Vec<u16>,
    pub mos_temperature: u16,
    pub cell_temperatures: Vec<u16>,
}

impl MasterTelemetry {
    const CELLS: usize = 16;
    const TEMPERATURES: usize = 4;

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let end = frame.len().saturating_sub(TRAILER_LENGTH);
        let body = frame.get(HEADER_LENGTH..end).unwrap_or_default();
        if body.len() < 118 {
            return Err(Error::TranslationUnderflow(body.len(), 118));
        }
        let field = |start: usize| -> Result<u16> {
            parse_hex_u16(&body[start..start + 4]).ok_or(Error::InvalidHex(HEADER_LENGTH + start))
        };
        Ok(Self {
            pack_voltage: field(6)?,
            soh: field(14)?,
            soc: field(18)?,
            installed_capacity: field(22)?,
            full_charge_capacity: field(26)?,
            cell_voltages: (0..Self::CELLS)
                .map(|i| field(34 + i * 4))
                .collect::<Result<_>>()?,
            mos_temperature: field(98)?,
            cell_temperatures: (0..Self::TEMPERATURES)
                .map(|i| field(102 + i * 4))
                .collect::<Result<_>>()?,
        })
    }
}
