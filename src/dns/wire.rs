//! Minimal DNS wire handling
//!
//! The proxy forwards messages verbatim; it only needs the header, the
//! first question, and the IPv4 addresses carried by the answer section.

use std::net::Ipv4Addr;
use thiserror::Error;

pub const HEADER_LEN: usize = 12;

pub const TYPE_A: u16 = 1;
pub const TYPE_SVCB: u16 = 64;
pub const TYPE_HTTPS: u16 = 65;
pub const CLASS_IN: u16 = 1;

/// SvcParamKey carrying IPv4 address hints
pub const SVC_PARAM_IPV4HINT: u16 = 4;

pub const RCODE_SERVFAIL: u8 = 2;

const FLAG_QR: u8 = 0x80;
const MASK_OPCODE: u8 = 0x78;
const FLAG_RD: u8 = 0x01;
const FLAG_CD: u8 = 0x10;

/// Pointer hops tolerated while reading one name
const MAX_POINTER_HOPS: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Message truncated at offset {0}")]
    Truncated(usize),
    #[error("Malformed message: {0}")]
    Malformed(&'static str),
}

/// First question of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Name without the trailing dot; empty for the root
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
    /// Offset just past the question in the message
    pub end: usize,
}

struct Reader<'a> {
    msg: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(msg: &'a [u8], pos: usize) -> Self {
        Self { msg, pos }
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos.checked_add(len).ok_or(WireError::Truncated(self.pos))?;
        let bytes = self.msg.get(self.pos..end).ok_or(WireError::Truncated(self.pos))?;
        self.pos = end;
        Ok(bytes)
    }

    /// Read a possibly compressed name, leaving the cursor after it
    fn name(&mut self) -> Result<String, WireError> {
        let mut labels: Vec<String> = Vec::new();
        let mut cursor = self.pos;
        let mut resume = None;
        let mut hops = 0;

        loop {
            let len = *self.msg.get(cursor).ok_or(WireError::Truncated(cursor))?;
            match len & 0xC0 {
                0x00 => {
                    cursor += 1;
                    if len == 0 {
                        break;
                    }
                    let end = cursor + len as usize;
                    let label = self.msg.get(cursor..end).ok_or(WireError::Truncated(cursor))?;
                    labels.push(String::from_utf8_lossy(label).into_owned());
                    cursor = end;
                }
                0xC0 => {
                    let low = *self.msg.get(cursor + 1).ok_or(WireError::Truncated(cursor))?;
                    hops += 1;
                    if hops > MAX_POINTER_HOPS {
                        return Err(WireError::Malformed("compression loop"));
                    }
                    resume.get_or_insert(cursor + 2);
                    cursor = (usize::from(len & 0x3F) << 8) | usize::from(low);
                }
                _ => return Err(WireError::Malformed("reserved label type")),
            }
        }

        self.pos = resume.unwrap_or(cursor);
        Ok(labels.join("."))
    }
}

fn header_count(msg: &[u8], offset: usize) -> Result<u16, WireError> {
    Reader::new(msg, offset).u16()
}

/// Build a standard recursive query for one name
pub fn build_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN + name.len() + 6);
    packet.extend_from_slice(&id.to_be_bytes());
    // Standard query, recursion desired
    packet.extend_from_slice(&[FLAG_RD, 0x00]);
    // QDCOUNT = 1, no other records
    packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

    for label in name.trim_end_matches('.').split('.').filter(|l| !l.is_empty()) {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0x00);

    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());
    packet
}

pub fn message_id(msg: &[u8]) -> Result<u16, WireError> {
    if msg.len() < HEADER_LEN {
        return Err(WireError::Truncated(msg.len()));
    }
    Ok(u16::from_be_bytes([msg[0], msg[1]]))
}

pub fn rcode(msg: &[u8]) -> Result<u8, WireError> {
    if msg.len() < HEADER_LEN {
        return Err(WireError::Truncated(msg.len()));
    }
    Ok(msg[3] & 0x0F)
}

/// The first question, if the message has one
pub fn first_question(msg: &[u8]) -> Result<Option<Question>, WireError> {
    message_id(msg)?;
    if header_count(msg, 4)? == 0 {
        return Ok(None);
    }

    let mut reader = Reader::new(msg, HEADER_LEN);
    let name = reader.name()?;
    let qtype = reader.u16()?;
    let qclass = reader.u16()?;
    Ok(Some(Question {
        name,
        qtype,
        qclass,
        end: reader.pos,
    }))
}

/// Name of the first question, without the trailing dot
pub fn question_name(msg: &[u8]) -> Result<String, WireError> {
    first_question(msg)?
        .map(|q| q.name)
        .ok_or(WireError::Malformed("no question"))
}

/// IPv4 addresses carried by the answer section: A records and the
/// `ipv4hint` parameter of HTTPS/SVCB records
pub fn answer_ipv4s(msg: &[u8]) -> Result<Vec<Ipv4Addr>, WireError> {
    message_id(msg)?;
    let qdcount = header_count(msg, 4)?;
    let ancount = header_count(msg, 6)?;

    let mut reader = Reader::new(msg, HEADER_LEN);
    for _ in 0..qdcount {
        reader.name()?;
        reader.take(4)?;
    }

    let mut ips = Vec::new();
    for _ in 0..ancount {
        reader.name()?;
        let rtype = reader.u16()?;
        let class = reader.u16()?;
        reader.take(4)?; // TTL
        let rdlen = reader.u16()? as usize;
        let rdata_start = reader.pos;
        let rdata = reader.take(rdlen)?;

        if class != CLASS_IN {
            continue;
        }
        match rtype {
            TYPE_A if rdata.len() == 4 => {
                ips.push(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]));
            }
            TYPE_HTTPS | TYPE_SVCB => {
                ips.extend(svcb_ipv4_hints(msg, rdata_start, rdata_start + rdlen)?);
            }
            _ => {}
        }
    }

    Ok(ips)
}

fn svcb_ipv4_hints(msg: &[u8], start: usize, end: usize) -> Result<Vec<Ipv4Addr>, WireError> {
    // Bound the reader to this record's RDATA
    let rdata = msg.get(..end).ok_or(WireError::Truncated(end))?;
    let mut reader = Reader::new(rdata, start);
    reader.u16()?; // SvcPriority
    reader.name()?; // TargetName

    let mut hints = Vec::new();
    while reader.pos < end {
        let key = reader.u16()?;
        let len = reader.u16()? as usize;
        let value = reader.take(len)?;
        if key != SVC_PARAM_IPV4HINT {
            continue;
        }
        if len % 4 != 0 {
            return Err(WireError::Malformed("ipv4hint length"));
        }
        hints.extend(
            value
                .chunks_exact(4)
                .map(|a| Ipv4Addr::new(a[0], a[1], a[2], a[3])),
        );
    }
    Ok(hints)
}

/// Server-failure response for `query`: same id, opcode, RD and CD bits,
/// echoing the first question when it can be parsed
pub fn server_failure(query: &[u8]) -> Result<Vec<u8>, WireError> {
    let id = message_id(query)?;
    let question = first_question(query).ok().flatten();

    let mut response = Vec::with_capacity(HEADER_LEN + question.as_ref().map_or(0, |q| q.end));
    response.extend_from_slice(&id.to_be_bytes());
    response.push(FLAG_QR | (query[2] & (MASK_OPCODE | FLAG_RD)));
    response.push((query[3] & FLAG_CD) | RCODE_SERVFAIL);

    match question {
        Some(q) => {
            response.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
            response.extend_from_slice(&query[HEADER_LEN..q.end]);
        }
        None => response.extend_from_slice(&[0u8; 8]),
    }
    Ok(response)
}
