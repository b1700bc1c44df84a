//! DNS wire format
//!
//! Hand-rolled subset of RFC 1035/3596: enough to parse an inbound query
//! (with its EDNS0 OPT, if any) and serialize an authoritative response
//! carrying A/AAAA/NS/SOA records. Answer owner names are written as a
//! compression pointer to the question name; rdata names are written
//! uncompressed.

use std::net::{Ipv4Addr, Ipv6Addr};

/// DNS record types this server understands.
pub const TYPE_A: u16 = 1;
pub const TYPE_NS: u16 = 2;
pub const TYPE_SOA: u16 = 6;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_OPT: u16 = 41;
pub const TYPE_ANY: u16 = 255;

pub const CLASS_IN: u16 = 1;

/// Response codes.
pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_FORMERR: u8 = 1;
pub const RCODE_NOTIMP: u8 = 4;
pub const RCODE_REFUSED: u8 = 5;

/// Header flag bits.
const FLAG_QR: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;

const HEADER_SIZE: usize = 12;

/// Classic UDP payload limit, used when the query carries no OPT.
pub const MIN_UDP_PAYLOAD: usize = 512;

/// Largest EDNS payload we honor.
pub const MAX_UDP_PAYLOAD: usize = 4096;

/// Payload size advertised in our own OPT records.
pub const EDNS_OUR_PAYLOAD: u16 = 1232;

/// Effective limit for TCP responses (length prefix is u16).
pub const TCP_MAX_PAYLOAD: usize = 65_535;

/// One entry of the question section.
#[derive(Debug, Clone, PartialEq)]
pub struct Question {
    /// Lowercased, dot-joined, no trailing dot.
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// A parsed inbound query.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: u16,
    pub opcode: u8,
    pub rd: bool,
    pub questions: Vec<Question>,
    /// Payload size from the OPT record, when the client speaks EDNS0.
    pub edns_payload: Option<u16>,
}

/// Decode a name starting at `offset`, following compression pointers.
/// Returns the name and the offset just past its first encoding.
pub(crate) fn read_name(data: &[u8], offset: usize) -> anyhow::Result<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = offset;
    let mut end_after_pointer: Option<usize> = None;
    let mut jumps = 0;

    loop {
        let len = *data
            .get(pos)
            .ok_or_else(|| anyhow::anyhow!("truncated name"))? as usize;

        if len == 0 {
            pos += 1;
            break;
        }

        // Compression pointer: two bytes, top bits 11.
        if len & 0xc0 == 0xc0 {
            let low = *data
                .get(pos + 1)
                .ok_or_else(|| anyhow::anyhow!("truncated pointer"))? as usize;
            if end_after_pointer.is_none() {
                end_after_pointer = Some(pos + 2);
            }
            pos = ((len & 0x3f) << 8) | low;
            jumps += 1;
            if jumps > 8 {
                anyhow::bail!("compression pointer loop");
            }
            continue;
        }

        if len > 63 {
            anyhow::bail!("invalid label length {len}");
        }
        let start = pos + 1;
        let end = start + len;
        let label = data
            .get(start..end)
            .ok_or_else(|| anyhow::anyhow!("truncated label"))?;
        let label = std::str::from_utf8(label).map_err(|_| anyhow::anyhow!("non-utf8 label"))?;
        labels.push(label.to_lowercase());
        pos = end;

        if labels.len() > 128 {
            anyhow::bail!("name has too many labels");
        }
    }

    Ok((labels.join("."), end_after_pointer.unwrap_or(pos)))
}

/// Append `name` in uncompressed label form.
fn write_name(buf: &mut Vec<u8>, name: &str) {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        let len = label.len().min(63);
        buf.push(len as u8);
        buf.extend_from_slice(&label.as_bytes()[..len]);
    }
    buf.push(0);
}

/// Parse an inbound packet into a [`Request`].
pub fn parse_request(data: &[u8]) -> anyhow::Result<Request> {
    if data.len() < HEADER_SIZE {
        anyhow::bail!("packet shorter than header");
    }

    let id = u16::from_be_bytes([data[0], data[1]]);
    let flags = u16::from_be_bytes([data[2], data[3]]);
    if flags & FLAG_QR != 0 {
        anyhow::bail!("packet is a response");
    }
    let opcode = ((flags >> 11) & 0x0f) as u8;
    let rd = flags & FLAG_RD != 0;

    let qdcount = u16::from_be_bytes([data[4], data[5]]) as usize;
    let ancount = u16::from_be_bytes([data[6], data[7]]) as usize;
    let nscount = u16::from_be_bytes([data[8], data[9]]) as usize;
    let arcount = u16::from_be_bytes([data[10], data[11]]) as usize;

    if qdcount > 32 {
        anyhow::bail!("absurd question count {qdcount}");
    }

    let mut pos = HEADER_SIZE;
    let mut questions = Vec::with_capacity(qdcount);
    for _ in 0..qdcount {
        let (name, next) = read_name(data, pos)?;
        pos = next;
        let qtype = read_u16(data, pos)?;
        let qclass = read_u16(data, pos + 2)?;
        pos += 4;
        questions.push(Question {
            name,
            qtype,
            qclass,
        });
    }

    // Walk the remaining records only to find an OPT in the additional
    // section.
    let mut edns_payload = None;
    for i in 0..(ancount + nscount + arcount) {
        let Ok((_, next)) = read_name(data, pos) else {
            break;
        };
        pos = next;
        let Ok(rtype) = read_u16(data, pos) else {
            break;
        };
        let Ok(rclass) = read_u16(data, pos + 2) else {
            break;
        };
        let Ok(rdlen) = read_u16(data, pos + 8) else {
            break;
        };
        pos += 10 + rdlen as usize;

        let in_additional = i >= ancount + nscount;
        if in_additional && rtype == TYPE_OPT {
            edns_payload = Some(rclass);
        }
        if pos > data.len() {
            break;
        }
    }

    Ok(Request {
        id,
        opcode,
        rd,
        questions,
        edns_payload,
    })
}

fn read_u16(data: &[u8], pos: usize) -> anyhow::Result<u16> {
    let bytes = data
        .get(pos..pos + 2)
        .ok_or_else(|| anyhow::anyhow!("truncated record"))?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// SOA rdata fields.
#[derive(Debug, Clone, PartialEq)]
pub struct SoaData {
    pub mname: String,
    pub rname: String,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
}

/// Rdata of the record types this server emits.
#[derive(Debug, Clone, PartialEq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ns(String),
    Soa(SoaData),
}

impl RData {
    pub fn rtype(&self) -> u16 {
        match self {
            RData::A(_) => TYPE_A,
            RData::Aaaa(_) => TYPE_AAAA,
            RData::Ns(_) => TYPE_NS,
            RData::Soa(_) => TYPE_SOA,
        }
    }
}

/// One response record; the owner name is always the question name.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub ttl: u32,
    pub data: RData,
}

/// An outbound authoritative response.
#[derive(Debug, Clone)]
pub struct Response {
    pub id: u16,
    pub rcode: u8,
    pub rd: bool,
    pub question: Option<Question>,
    pub answers: Vec<Record>,
    pub authority: Vec<Record>,
    /// Echo an OPT record when the query carried one.
    pub edns: bool,
    /// Size cap negotiated for a UDP reply to this query.
    pub udp_payload: usize,
}

impl Response {
    pub fn empty(id: u16, rd: bool, rcode: u8) -> Self {
        Self {
            id,
            rcode,
            rd,
            question: None,
            answers: Vec::new(),
            authority: Vec::new(),
            edns: false,
            udp_payload: MIN_UDP_PAYLOAD,
        }
    }

    /// Serialize, truncating the record sections and setting TC when the
    /// encoding does not fit in `max_size`.
    pub fn encode(&self, max_size: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MIN_UDP_PAYLOAD);

        buf.extend_from_slice(&self.id.to_be_bytes());
        let mut flags = FLAG_QR | FLAG_AA | (self.rcode as u16 & 0x0f);
        if self.rd {
            flags |= FLAG_RD;
        }
        buf.extend_from_slice(&flags.to_be_bytes());
        let qdcount: u16 = self.question.is_some() as u16;
        buf.extend_from_slice(&qdcount.to_be_bytes());
        // Section counts are patched once we know what fits.
        buf.extend_from_slice(&[0u8; 6]);
        let arcount: u16 = self.edns as u16;
        buf.extend_from_slice(&arcount.to_be_bytes());

        let name_ptr: u16 = 0xc000 | HEADER_SIZE as u16;
        if let Some(q) = &self.question {
            write_name(&mut buf, &q.name);
            buf.extend_from_slice(&q.qtype.to_be_bytes());
            buf.extend_from_slice(&q.qclass.to_be_bytes());
        }

        // Reserve room for the trailing OPT so truncation accounting
        // stays exact.
        let budget = max_size - if self.edns { 11 } else { 0 };

        let mut truncated = false;
        let mut ancount = 0u16;
        for record in &self.answers {
            let mark = buf.len();
            write_record(&mut buf, name_ptr, record);
            if buf.len() > budget {
                buf.truncate(mark);
                truncated = true;
                break;
            }
            ancount += 1;
        }

        let mut nscount = 0u16;
        if !truncated {
            for record in &self.authority {
                let mark = buf.len();
                write_record(&mut buf, name_ptr, record);
                if buf.len() > budget {
                    buf.truncate(mark);
                    truncated = true;
                    break;
                }
                nscount += 1;
            }
        }

        if self.edns {
            // Root name, OPT, our payload size, zeroed extended flags.
            buf.push(0);
            buf.extend_from_slice(&TYPE_OPT.to_be_bytes());
            buf.extend_from_slice(&EDNS_OUR_PAYLOAD.to_be_bytes());
            buf.extend_from_slice(&0u32.to_be_bytes());
            buf.extend_from_slice(&0u16.to_be_bytes());
        }

        buf[6..8].copy_from_slice(&ancount.to_be_bytes());
        buf[8..10].copy_from_slice(&nscount.to_be_bytes());
        if truncated {
            let flags = u16::from_be_bytes([buf[2], buf[3]]) | FLAG_TC;
            buf[2..4].copy_from_slice(&flags.to_be_bytes());
        }

        buf
    }
}

fn write_record(buf: &mut Vec<u8>, name_ptr: u16, record: &Record) {
    buf.extend_from_slice(&name_ptr.to_be_bytes());
    buf.extend_from_slice(&record.data.rtype().to_be_bytes());
    buf.extend_from_slice(&CLASS_IN.to_be_bytes());
    buf.extend_from_slice(&record.ttl.to_be_bytes());

    let rdlen_pos = buf.len();
    buf.extend_from_slice(&[0u8; 2]);

    match &record.data {
        RData::A(ip) => buf.extend_from_slice(&ip.octets()),
        RData::Aaaa(ip) => buf.extend_from_slice(&ip.octets()),
        RData::Ns(name) => write_name(buf, name),
        RData::Soa(soa) => {
            write_name(buf, &soa.mname);
            write_name(buf, &soa.rname);
            buf.extend_from_slice(&soa.serial.to_be_bytes());
            buf.extend_from_slice(&soa.refresh.to_be_bytes());
            buf.extend_from_slice(&soa.retry.to_be_bytes());
            buf.extend_from_slice(&soa.expire.to_be_bytes());
            buf.extend_from_slice(&soa.minimum.to_be_bytes());
        }
    }

    let rdlen = (buf.len() - rdlen_pos - 2) as u16;
    buf[rdlen_pos..rdlen_pos + 2].copy_from_slice(&rdlen.to_be_bytes());
}
