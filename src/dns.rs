//! DNS message parsing and construction.
//!
//! Implements the RFC 1035 wire format: a 12-byte header followed by the
//! question, answer, authority and additional sections. Record data is
//! carried as raw bytes; only owner names are decoded.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use rustc_hash::FxHashMap;
use thiserror::Error;

pub const HEADER_LEN: usize = 12;

/// Record type for an IPv4 host address.
pub const TYPE_A: u16 = 1;
/// The Internet class.
pub const CLASS_IN: u16 = 1;

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_HOPS: usize = 64;
const MAX_POINTER_OFFSET: usize = 0x3FFF;
const POINTER_TAG: u8 = 0xC0;

/// Errors produced while decoding or encoding wire-format messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("message truncated at offset {0}")]
    Truncated(usize),

    #[error("label longer than 63 bytes at offset {0}")]
    LabelTooLong(usize),

    #[error("name longer than 255 bytes")]
    NameTooLong,

    #[error("empty label in {0:?}")]
    EmptyLabel(String),

    #[error("invalid compression pointer at offset {0}")]
    BadPointer(usize),

    #[error("reserved label type {0:#04x}")]
    ReservedLabelType(u8),

    #[error("{0} section holds more than 65535 entries")]
    TooManyEntries(&'static str),

    #[error("record data longer than 65535 bytes")]
    RdataTooLong,
}

/// A domain name as a sequence of raw labels. The root name has no labels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Name {
    labels: Vec<Vec<u8>>,
}

impl Name {
    /// The root name.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn labels(&self) -> &[Vec<u8>] {
        &self.labels
    }

    pub fn is_root(&self) -> bool {
        self.labels.is_empty()
    }

    /// Read a possibly compressed name starting at `pos`.
    ///
    /// Returns the name and the offset just past it in the original stream
    /// (after the first pointer, if the name was compressed).
    fn read(buf: &[u8], mut pos: usize) -> Result<(Self, usize), CodecError> {
        let mut labels = Vec::new();
        let mut wire_len = 0usize;
        let mut resume = None;
        let mut hops = 0;

        loop {
            let len = *buf.get(pos).ok_or(CodecError::Truncated(pos))?;
            match len & POINTER_TAG {
                0x00 if len == 0 => {
                    wire_len += 1;
                    if wire_len > MAX_NAME_LEN {
                        return Err(CodecError::NameTooLong);
                    }
                    return Ok((Self { labels }, resume.unwrap_or(pos + 1)));
                }
                0x00 => {
                    let start = pos + 1;
                    let end = start + usize::from(len);
                    let label = buf.get(start..end).ok_or(CodecError::Truncated(start))?;
                    wire_len += 1 + label.len();
                    if wire_len > MAX_NAME_LEN {
                        return Err(CodecError::NameTooLong);
                    }
                    labels.push(label.to_vec());
                    pos = end;
                }
                POINTER_TAG => {
                    let low = *buf.get(pos + 1).ok_or(CodecError::Truncated(pos + 1))?;
                    let target = (usize::from(len & !POINTER_TAG) << 8) | usize::from(low);
                    hops += 1;
                    if target >= pos || hops > MAX_POINTER_HOPS {
                        return Err(CodecError::BadPointer(pos));
                    }
                    if resume.is_none() {
                        resume = Some(pos + 2);
                    }
                    pos = target;
                }
                _ => return Err(CodecError::ReservedLabelType(len)),
            }
        }
    }
}

impl FromStr for Name {
    type Err = CodecError;

    /// Parse a dotted name such as `foo.example` or `foo.example.`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.strip_suffix('.').unwrap_or(s);
        if trimmed.is_empty() {
            return Ok(Self::root());
        }

        let mut labels = Vec::new();
        let mut wire_len = 1;
        for label in trimmed.split('.') {
            if label.is_empty() {
                return Err(CodecError::EmptyLabel(s.to_string()));
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(CodecError::LabelTooLong(wire_len - 1));
            }
            wire_len += 1 + label.len();
            labels.push(label.as_bytes().to_vec());
        }
        if wire_len > MAX_NAME_LEN {
            return Err(CodecError::NameTooLong);
        }

        Ok(Self { labels })
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str(".");
        }
        for (i, label) in self.labels.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            for &b in label {
                match b {
                    b'.' | b'\\' => write!(f, "\\{}", b as char)?,
                    0x21..=0x7E => write!(f, "{}", b as char)?,
                    _ => write!(f, "\\{:03}", b)?,
                }
            }
        }
        Ok(())
    }
}

/// The fixed 12-byte message header, with the flag word split into fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub id: u16,
    pub response: bool,
    pub opcode: u8,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    /// Reserved bits, carried through untouched.
    pub z: u8,
    pub rcode: u8,
}

impl Header {
    fn from_flags(id: u16, flags: u16) -> Self {
        Self {
            id,
            response: flags & 0x8000 != 0,
            opcode: ((flags >> 11) & 0x0F) as u8,
            authoritative: flags & 0x0400 != 0,
            truncated: flags & 0x0200 != 0,
            recursion_desired: flags & 0x0100 != 0,
            recursion_available: flags & 0x0080 != 0,
            z: ((flags >> 4) & 0x07) as u8,
            rcode: (flags & 0x0F) as u8,
        }
    }

    pub fn flags(&self) -> u16 {
        let mut flags = u16::from(self.opcode & 0x0F) << 11
            | u16::from(self.z & 0x07) << 4
            | u16::from(self.rcode & 0x0F);
        if self.response {
            flags |= 0x8000;
        }
        if self.authoritative {
            flags |= 0x0400;
        }
        if self.truncated {
            flags |= 0x0200;
        }
        if self.recursion_desired {
            flags |= 0x0100;
        }
        if self.recursion_available {
            flags |= 0x0080;
        }
        flags
    }
}

/// A DNS question section entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: Name,
    pub qtype: u16,
    pub qclass: u16,
}

/// A DNS resource record. The record data is opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: Name,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl Record {
    /// An Internet-class A record.
    pub fn a(name: Name, addr: Ipv4Addr, ttl: u32) -> Self {
        Self {
            name,
            rtype: TYPE_A,
            class: CLASS_IN,
            ttl,
            rdata: addr.octets().to_vec(),
        }
    }

    /// The address held by an A record, if this is one.
    pub fn as_a(&self) -> Option<Ipv4Addr> {
        if self.rtype != TYPE_A {
            return None;
        }
        let octets: [u8; 4] = self.rdata.as_slice().try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }
}

/// A parsed DNS message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
}

impl Message {
    /// Build a recursive query for a single name.
    pub fn query(id: u16, name: Name, qtype: u16) -> Self {
        Self {
            header: Header {
                id,
                recursion_desired: true,
                ..Header::default()
            },
            questions: vec![Question {
                name,
                qtype,
                qclass: CLASS_IN,
            }],
            ..Self::default()
        }
    }

    /// Parse a message from raw bytes. Bytes past the last section are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::Truncated(buf.len()));
        }

        let word = |at: usize| u16::from_be_bytes([buf[at], buf[at + 1]]);
        let header = Header::from_flags(word(0), word(2));
        let (qdcount, ancount, nscount, arcount) = (word(4), word(6), word(8), word(10));

        let mut pos = HEADER_LEN;

        let mut questions = Vec::new();
        for _ in 0..qdcount {
            let (name, next) = Name::read(buf, pos)?;
            let fixed = buf.get(next..next + 4).ok_or(CodecError::Truncated(next))?;
            questions.push(Question {
                name,
                qtype: u16::from_be_bytes([fixed[0], fixed[1]]),
                qclass: u16::from_be_bytes([fixed[2], fixed[3]]),
            });
            pos = next + 4;
        }

        let answers = read_records(buf, &mut pos, ancount)?;
        let authorities = read_records(buf, &mut pos, nscount)?;
        let additionals = read_records(buf, &mut pos, arcount)?;

        Ok(Self {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    /// Encode the message to wire format, compressing repeated names.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let qdcount = section_len(&self.questions, "question")?;
        let ancount = section_len(&self.answers, "answer")?;
        let nscount = section_len(&self.authorities, "authority")?;
        let arcount = section_len(&self.additionals, "additional")?;

        let mut enc = Encoder::with_capacity(512);
        enc.buf.extend_from_slice(&self.header.id.to_be_bytes());
        enc.buf.extend_from_slice(&self.header.flags().to_be_bytes());
        enc.buf.extend_from_slice(&qdcount.to_be_bytes());
        enc.buf.extend_from_slice(&ancount.to_be_bytes());
        enc.buf.extend_from_slice(&nscount.to_be_bytes());
        enc.buf.extend_from_slice(&arcount.to_be_bytes());

        for q in &self.questions {
            enc.write_name(&q.name);
            enc.buf.extend_from_slice(&q.qtype.to_be_bytes());
            enc.buf.extend_from_slice(&q.qclass.to_be_bytes());
        }

        for record in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            enc.write_record(record)?;
        }

        Ok(enc.buf)
    }
}

fn section_len<T>(section: &[T], label: &'static str) -> Result<u16, CodecError> {
    u16::try_from(section.len()).map_err(|_| CodecError::TooManyEntries(label))
}

fn read_records(buf: &[u8], pos: &mut usize, count: u16) -> Result<Vec<Record>, CodecError> {
    let mut records = Vec::new();

    for _ in 0..count {
        let (name, next) = Name::read(buf, *pos)?;
        let fixed = buf.get(next..next + 10).ok_or(CodecError::Truncated(next))?;
        let rdlength = usize::from(u16::from_be_bytes([fixed[8], fixed[9]]));
        let start = next + 10;
        let rdata = buf
            .get(start..start + rdlength)
            .ok_or(CodecError::Truncated(start))?;

        records.push(Record {
            name,
            rtype: u16::from_be_bytes([fixed[0], fixed[1]]),
            class: u16::from_be_bytes([fixed[2], fixed[3]]),
            ttl: u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]),
            rdata: rdata.to_vec(),
        });
        *pos = start + rdlength;
    }

    Ok(records)
}

/// Output buffer plus the offsets of every name suffix written so far.
struct Encoder<'a> {
    buf: Vec<u8>,
    names: FxHashMap<&'a [Vec<u8>], u16>,
}

impl<'a> Encoder<'a> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            names: FxHashMap::default(),
        }
    }

    fn write_name(&mut self, name: &'a Name) {
        let labels = name.labels();

        for i in 0..labels.len() {
            let suffix = &labels[i..];
            if let Some(&offset) = self.names.get(suffix) {
                self.buf
                    .extend_from_slice(&(0xC000 | offset).to_be_bytes());
                return;
            }

            let here = self.buf.len();
            if here <= MAX_POINTER_OFFSET {
                self.names.insert(suffix, here as u16);
            }
            self.buf.push(labels[i].len() as u8);
            self.buf.extend_from_slice(&labels[i]);
        }

        self.buf.push(0);
    }

    fn write_record(&mut self, record: &'a Record) -> Result<(), CodecError> {
        let rdlength = u16::try_from(record.rdata.len()).map_err(|_| CodecError::RdataTooLong)?;

        self.write_name(&record.name);
        self.buf.extend_from_slice(&record.rtype.to_be_bytes());
        self.buf.extend_from_slice(&record.class.to_be_bytes());
        self.buf.extend_from_slice(&record.ttl.to_be_bytes());
        self.buf.extend_from_slice(&rdlength.to_be_bytes());
        self.buf.extend_from_slice(&record.rdata);

        Ok(())
    }
}
