//! DNS parsing utility.
//!
//! [DnsIncoming] is the logic representation of an incoming DNS packet.
//! [DnsOutgoing] is the logic representation of an outgoing DNS message of one or more packets.
//! [DnsOutPacket] is the encoded one packet for [DnsOutgoing].

#[cfg(feature = "logging")]
use crate::log::{debug, trace};
use crate::{
    domain::Domain,
    error::{e_fmt, Error, Result},
    service::decode_txt,
};
use std::{
    cmp,
    collections::HashMap,
    convert::TryInto,
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

/// DNS resource record types, stored as `u16`. Can do `as u16` when needed.
///
/// See [RFC 1035 section 3.2.2](https://datatracker.ietf.org/doc/html/rfc1035#section-3.2.2)
#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
#[non_exhaustive]
#[repr(u16)]
pub enum RRType {
    /// DNS record type for IPv4 address
    A = 1,

    /// DNS record type for Pointer
    PTR = 12,

    /// DNS record type for Text (properties)
    TXT = 16,

    /// DNS record type for IPv6 address
    AAAA = 28,

    /// DNS record type for Service
    SRV = 33,

    /// DNS record type for Negative Responses
    NSEC = 47,

    /// DNS record type for any records (wildcard)
    ANY = 255,
}

impl RRType {
    /// Converts `u16` into `RRType` if possible.
    pub const fn from_u16(value: u16) -> Option<RRType> {
        match value {
            1 => Some(RRType::A),
            12 => Some(RRType::PTR),
            16 => Some(RRType::TXT),
            28 => Some(RRType::AAAA),
            33 => Some(RRType::SRV),
            47 => Some(RRType::NSEC),
            255 => Some(RRType::ANY),
            _ => None,
        }
    }
}

impl fmt::Display for RRType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RRType::A => write!(f, "TYPE_A"),
            RRType::PTR => write!(f, "TYPE_PTR"),
            RRType::TXT => write!(f, "TYPE_TXT"),
            RRType::AAAA => write!(f, "TYPE_AAAA"),
            RRType::SRV => write!(f, "TYPE_SRV"),
            RRType::NSEC => write!(f, "TYPE_NSEC"),
            RRType::ANY => write!(f, "TYPE_ANY"),
        }
    }
}

/// The class value for the Internet.
pub const CLASS_IN: u16 = 1;
pub const CLASS_MASK: u16 = 0x7FFF;

/// Cache-flush bit: the most significant bit of the rrclass field of the resource record.
/// In a question the same bit asks for a unicast response (QU).
pub const CLASS_CACHE_FLUSH: u16 = 0x8000;

/// Max size of UDP datagram payload.
///
/// It is calculated as: 9000 bytes - IP header 20 bytes - UDP header 8 bytes.
/// Reference: [RFC6762 section 17](https://datatracker.ietf.org/doc/html/rfc6762#section-17)
pub const MAX_MSG_ABSOLUTE: usize = 8972;

const MSG_HEADER_LEN: usize = 12;

/// How many compression pointers a single name may follow.
pub const MAX_NAME_REDIRECTIONS: usize = 6;

// Definitions for DNS message header "flags" field
//
// The "flags" field is 16-bit long, in this format:
// (RFC 1035 section 4.1.1)
//
//   0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
// |QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
//
pub const FLAGS_QR_MASK: u16 = 0x8000; // mask for query/response bit

/// Flag bit to indicate a query
pub const FLAGS_QR_QUERY: u16 = 0x0000;

/// Flag bit to indicate a response
pub const FLAGS_QR_RESPONSE: u16 = 0x8000;

/// Flag bit for Authoritative Answer
pub const FLAGS_AA: u16 = 0x0400;

/// mask for TC(Truncated) bit
pub const FLAGS_TC: u16 = 0x0200;

const U16_SIZE: usize = 2;

/// Name, type and class shared by questions and resource records.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct DnsEntry {
    pub(crate) name: Domain,
    pub(crate) ty: u16,
    class: u16,
    cache_flush: bool,
}

impl DnsEntry {
    fn new(name: Domain, ty: u16, class: u16) -> Self {
        Self {
            name,
            ty,
            class: class & CLASS_MASK,
            cache_flush: (class & CLASS_CACHE_FLUSH) != 0,
        }
    }

    fn wire_class(&self) -> u16 {
        if self.cache_flush {
            self.class | CLASS_CACHE_FLUSH
        } else {
            self.class
        }
    }
}

/// A DNS question entry
#[derive(Debug, Clone)]
pub struct DnsQuestion {
    pub(crate) entry: DnsEntry,
}

impl DnsQuestion {
    pub fn name(&self) -> &Domain {
        &self.entry.name
    }

    /// The raw qtype.
    pub fn qtype(&self) -> u16 {
        self.entry.ty
    }

    /// Returns true if the question matches records of type `ty`.
    pub fn wants(&self, ty: RRType) -> bool {
        self.entry.ty == ty as u16 || self.entry.ty == RRType::ANY as u16
    }

    /// The QU bit: the asker prefers a unicast response.
    pub fn unicast_response(&self) -> bool {
        self.entry.cache_flush
    }
}

/// Type specific data of a resource record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    AAAA(Ipv6Addr),
    Ptr(Domain),
    /// Raw TXT data: a sequence of length-prefixed strings.
    Txt(Vec<u8>),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: Domain,
    },
    /// See [RFC 6762 section 6.1](https://datatracker.ietf.org/doc/html/rfc6762#section-6.1)
    NSec {
        next_domain: Domain,
        type_bitmap: Vec<u8>,
    },
    /// Any type this crate does not interpret.
    Generic { ty: u16, data: Vec<u8> },
}

impl RData {
    pub fn rr_type(&self) -> u16 {
        match self {
            RData::A(_) => RRType::A as u16,
            RData::AAAA(_) => RRType::AAAA as u16,
            RData::Ptr(_) => RRType::PTR as u16,
            RData::Txt(_) => RRType::TXT as u16,
            RData::Srv { .. } => RRType::SRV as u16,
            RData::NSec { .. } => RRType::NSEC as u16,
            RData::Generic { ty, .. } => *ty,
        }
    }

    /// Uncompressed rdata with names lower-cased, used for ordering records.
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            RData::A(addr) => out.extend_from_slice(&addr.octets()),
            RData::AAAA(addr) => out.extend_from_slice(&addr.octets()),
            RData::Ptr(alias) => alias.write_canonical(&mut out),
            RData::Txt(text) => out.extend_from_slice(text),
            RData::Srv {
                priority,
                weight,
                port,
                target,
            } => {
                out.extend_from_slice(&priority.to_be_bytes());
                out.extend_from_slice(&weight.to_be_bytes());
                out.extend_from_slice(&port.to_be_bytes());
                target.write_canonical(&mut out);
            }
            RData::NSec {
                next_domain,
                type_bitmap,
            } => {
                next_domain.write_canonical(&mut out);
                out.extend_from_slice(type_bitmap);
            }
            RData::Generic { data, .. } => out.extend_from_slice(data),
        }
        out
    }

    fn write(&self, packet: &mut DnsOutPacket) {
        match self {
            RData::A(addr) => packet.write_bytes(&addr.octets()),
            RData::AAAA(addr) => packet.write_bytes(&addr.octets()),
            RData::Ptr(alias) => packet.write_name(alias),
            RData::Txt(text) => packet.write_bytes(text),
            RData::Srv {
                priority,
                weight,
                port,
                target,
            } => {
                packet.write_short(*priority);
                packet.write_short(*weight);
                packet.write_short(*port);
                packet.write_name(target);
            }
            RData::NSec {
                next_domain,
                type_bitmap,
            } => {
                // RFC 6762 section 18.14: no name compression in NSEC rdata.
                packet.write_name_uncompressed(next_domain);
                packet.write_byte(0); // window block 0
                packet.write_byte(type_bitmap.len() as u8);
                packet.write_bytes(type_bitmap);
            }
            RData::Generic { data, .. } => packet.write_bytes(data),
        }
    }

    /// Returns a human-readable string of rdata.
    pub fn rdata_print(&self) -> String {
        match self {
            RData::A(addr) => addr.to_string(),
            RData::AAAA(addr) => addr.to_string(),
            RData::Ptr(alias) => alias.to_string(),
            RData::Txt(text) => format!("{:?}", decode_txt(text)),
            RData::Srv {
                priority,
                weight,
                port,
                target,
            } => format!(
                "priority: {}, weight: {}, port: {}, host: {}",
                priority, weight, port, target
            ),
            RData::NSec {
                next_domain,
                type_bitmap,
            } => format!(
                "next_domain: {}, types: {:?}",
                next_domain,
                nsec_types(type_bitmap)
            ),
            RData::Generic { ty, data } => format!("type {} ({} bytes)", ty, data.len()),
        }
    }
}

/// A DNS Resource Record - like a DNS entry, but has a TTL.
/// RFC: https://www.rfc-editor.org/rfc/rfc1035#section-3.2.1
///      https://www.rfc-editor.org/rfc/rfc1035#section-4.1.3
#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub(crate) entry: DnsEntry,
    ttl: u32, // in seconds, 0 means goodbye
    rdata: RData,
}

impl DnsRecord {
    pub fn new(name: Domain, class: u16, ttl: u32, rdata: RData) -> Self {
        Self {
            entry: DnsEntry::new(name, rdata.rr_type(), class),
            ttl,
            rdata,
        }
    }

    pub fn new_address(name: Domain, class: u16, ttl: u32, address: IpAddr) -> Self {
        let rdata = match address {
            IpAddr::V4(addr) => RData::A(addr),
            IpAddr::V6(addr) => RData::AAAA(addr),
        };
        Self::new(name, class, ttl, rdata)
    }

    pub fn new_ptr(name: Domain, class: u16, ttl: u32, alias: Domain) -> Self {
        Self::new(name, class, ttl, RData::Ptr(alias))
    }

    pub fn new_srv(name: Domain, class: u16, ttl: u32, port: u16, target: Domain) -> Self {
        let rdata = RData::Srv {
            priority: 0,
            weight: 0,
            port,
            target,
        };
        Self::new(name, class, ttl, rdata)
    }

    pub fn new_txt(name: Domain, class: u16, ttl: u32, text: Vec<u8>) -> Self {
        Self::new(name, class, ttl, RData::Txt(text))
    }

    /// NSEC record naming itself as next domain, listing `types`.
    pub fn new_nsec(name: Domain, class: u16, ttl: u32, types: &[RRType]) -> Self {
        let rdata = RData::NSec {
            next_domain: name.clone(),
            type_bitmap: nsec_bitmap(types),
        };
        Self::new(name, class, ttl, rdata)
    }

    pub fn name(&self) -> &Domain {
        &self.entry.name
    }

    /// The raw record type.
    pub fn ty(&self) -> u16 {
        self.entry.ty
    }

    pub fn rr_type(&self) -> Option<RRType> {
        RRType::from_u16(self.entry.ty)
    }

    /// Returns the class only, excluding class_flush / unique bit.
    pub fn class(&self) -> u16 {
        self.entry.class
    }

    pub fn cache_flush(&self) -> bool {
        self.entry.cache_flush
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    pub fn set_ttl(&mut self, ttl: u32) {
        self.ttl = ttl;
    }

    pub fn rdata(&self) -> &RData {
        &self.rdata
    }

    /// Returns whether `other` record is considered the same except TTL.
    pub fn matches(&self, other: &DnsRecord) -> bool {
        self.entry.name == other.entry.name
            && self.entry.ty == other.entry.ty
            && self.entry.class == other.entry.class
            && self.rrdata_match(other)
    }

    /// Returns whether `other` record has the same rdata.
    pub fn rrdata_match(&self, other: &DnsRecord) -> bool {
        self.rdata == other.rdata
    }

    /// Returns the result based on "lexicographically later" defined below.
    pub fn compare(&self, other: &DnsRecord) -> cmp::Ordering {
        /*
        RFC 6762: https://datatracker.ietf.org/doc/html/rfc6762#section-8.2

        ... The determination of "lexicographically later" is performed by first
        comparing the record class (excluding the cache-flush bit described
        in Section 10.2), then the record type, then raw comparison of the
        binary content of the rdata without regard for meaning or structure.
        If the record classes differ, then the numerically greater class is
        considered "lexicographically later".  Otherwise, if the record types
        differ, then the numerically greater type is considered
        "lexicographically later".  If the rrtype and rrclass both match,
        then the rdata is compared. ...
        */
        match self.class().cmp(&other.class()) {
            cmp::Ordering::Equal => match self.ty().cmp(&other.ty()) {
                cmp::Ordering::Equal => self
                    .rdata
                    .canonical_bytes()
                    .cmp(&other.rdata.canonical_bytes()),
                not_equal => not_equal,
            },
            not_equal => not_equal,
        }
    }

    /// Returns true if another record has matched content,
    /// and if its TTL is at least half of this record's.
    pub fn suppressed_by_answer(&self, other: &DnsRecord) -> bool {
        self.matches(other) && (other.ttl >= self.ttl / 2)
    }

    /// Required by RFC 6762 Section 7.1: Known-Answer Suppression.
    pub fn suppressed_by(&self, msg: &DnsIncoming) -> bool {
        msg.answers
            .iter()
            .any(|answer| self.suppressed_by_answer(answer))
    }

    fn write(&self, packet: &mut DnsOutPacket) {
        packet.write_name(&self.entry.name);
        packet.write_short(self.entry.ty);
        packet.write_short(self.entry.wire_class());
        packet.write_u32(self.ttl);

        let len_pos = packet.data.len();
        packet.write_short(0); // placeholder for RDLENGTH
        self.rdata.write(packet);
        let rdata_len = packet.data.len() - len_pos - U16_SIZE;
        packet.data[len_pos..len_pos + U16_SIZE].copy_from_slice(&(rdata_len as u16).to_be_bytes());
    }
}

impl PartialEq for DnsRecord {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other)
    }
}

/// Builds a window-0 NSEC type bitmap.
///
/// See [RFC 4034 section 4.1.2](https://datatracker.ietf.org/doc/html/rfc4034#section-4.1.2)
pub fn nsec_bitmap(types: &[RRType]) -> Vec<u8> {
    let max = types
        .iter()
        .map(|t| *t as u16)
        .filter(|t| *t < 256)
        .max()
        .unwrap_or(0);
    let mut bitmap = vec![0u8; max as usize / 8 + 1];
    for ty in types.iter().map(|t| *t as u16).filter(|t| *t < 256) {
        bitmap[ty as usize / 8] |= 0x80 >> (ty % 8);
    }
    bitmap
}

/// Returns the types marked by a window-0 `type_bitmap`.
pub fn nsec_types(type_bitmap: &[u8]) -> Vec<u16> {
    // From RFC 4034: 4.1.2 The Type Bit Maps Field
    // https://datatracker.ietf.org/doc/html/rfc4034#section-4.1.2
    //
    // Each bitmap encodes the low-order 8 bits of RR types within the
    // window block, in network bit order.  The first bit is bit 0.  For
    // window block 0, bit 1 corresponds to RR type 1 (A), bit 2 corresponds
    // to RR type 2 (NS), and so forth.
    let mut bit_num = 0;
    let mut results = Vec::new();

    for byte in type_bitmap.iter() {
        let mut bit_mask: u8 = 0x80; // for bit 0 in network bit order

        // check every bit in this byte, one by one.
        for _ in 0..8 {
            if (byte & bit_mask) != 0 {
                results.push(bit_num);
            }
            bit_num += 1;
            bit_mask >>= 1; // mask for the next bit
        }
    }
    results
}

/// A single packet for outgoing DNS message.
pub struct DnsOutPacket {
    /// The bytes on the wire, header included.
    data: Vec<u8>,

    /// k: lower-cased encoded name suffix, v: offset
    names: HashMap<Vec<u8>, u16>,
}

impl DnsOutPacket {
    fn new() -> Self {
        Self {
            data: vec![0; MSG_HEADER_LEN], // Header is mandatory.
            names: HashMap::new(),
        }
    }

    fn write_question(&mut self, question: &DnsQuestion) {
        self.write_name(&question.entry.name);
        self.write_short(question.entry.ty);
        self.write_short(question.entry.wire_class());
    }

    /// Writes a record (answer, authoritative answer, additional)
    /// Returns false if the packet exceeds the max size with this record,
    /// in which case nothing is written to the packet. Otherwise returns true.
    fn write_record(&mut self, record: &DnsRecord) -> bool {
        let start_size = self.data.len();
        let names_before = self.names.len();

        record.write(self);

        if self.data.len() > MAX_MSG_ABSOLUTE {
            self.data.truncate(start_size);
            if self.names.len() != names_before {
                // Forget compression targets that were truncated away.
                self.names.retain(|_, offset| (*offset as usize) < start_size);
            }
            return false;
        }

        true
    }

    // Write name to packet
    //
    // [RFC1035]
    // 4.1.4. Message compression
    //
    // In order to reduce the size of messages, the domain system utilizes a
    // compression scheme which eliminates the repetition of domain names in a
    // message.  In this scheme, an entire domain name or a list of labels at
    // the end of a domain name is replaced with a pointer to a prior occurrence
    // of the same name.
    // The pointer takes the form of a two octet sequence:
    //     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //     | 1  1|                OFFSET                   |
    //     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    fn write_name(&mut self, name: &Domain) {
        const POINTER_MASK: u16 = 0xC000;
        let encoded = name.encoded();

        for offset in name.suffix_offsets() {
            let remaining: Vec<u8> = encoded[offset..]
                .iter()
                .map(u8::to_ascii_lowercase)
                .collect();

            // Check if 'remaining' already appeared in this message
            if let Some(pointer) = self.names.get(&remaining) {
                let pointer = *pointer | POINTER_MASK;
                self.write_short(pointer);
                return;
            }

            // Remember the remaining parts so we can point to it.
            // Offsets need to fit in 14 bits.
            if self.data.len() < POINTER_MASK as usize {
                self.names.insert(remaining, self.data.len() as u16);
            }

            let label_len = encoded[offset] as usize;
            self.write_bytes(&encoded[offset..offset + 1 + label_len]);
        }

        self.write_byte(0); // name ends with 0 if not using a pointer
    }

    fn write_name_uncompressed(&mut self, name: &Domain) {
        self.write_bytes(name.encoded());
        self.write_byte(0);
    }

    fn write_bytes(&mut self, s: &[u8]) {
        self.data.extend_from_slice(s);
    }

    fn write_u32(&mut self, int: u32) {
        self.data.extend_from_slice(&int.to_be_bytes());
    }

    fn write_short(&mut self, short: u16) {
        self.data.extend_from_slice(&short.to_be_bytes());
    }

    fn write_byte(&mut self, byte: u8) {
        self.data.push(byte);
    }

    /// Writes the header fields and finish the packet.
    ///
    /// The header format is based on RFC 1035 section 4.1.1:
    /// https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.1
    //
    //                                  1  1  1  1  1  1
    //    0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
    //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //    |                      ID                       |
    //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //    |QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
    //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //    |                    QDCOUNT                    |
    //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //    |                    ANCOUNT                    |
    //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //    |                    NSCOUNT                    |
    //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //    |                    ARCOUNT                    |
    //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //
    fn write_header(&mut self, id: u16, flags: u16, counts: [u16; 4]) {
        self.data[0..2].copy_from_slice(&id.to_be_bytes());
        self.data[2..4].copy_from_slice(&flags.to_be_bytes());
        for (i, count) in counts.iter().enumerate() {
            let pos = 4 + i * 2;
            self.data[pos..pos + 2].copy_from_slice(&count.to_be_bytes());
        }
    }
}

/// Representation of one outgoing DNS message that could be sent in one or more packet(s).
#[derive(Debug)]
pub struct DnsOutgoing {
    flags: u16,
    id: u16,
    questions: Vec<DnsQuestion>,
    answers: Vec<DnsRecord>,
    authorities: Vec<DnsRecord>,
    additionals: Vec<DnsRecord>,
    known_answer_count: usize, // for internal maintenance only
}

impl DnsOutgoing {
    pub fn new(flags: u16) -> Self {
        Self {
            flags,
            id: 0,
            questions: Vec::new(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
            known_answer_count: 0,
        }
    }

    pub fn questions(&self) -> &[DnsQuestion] {
        &self.questions
    }

    pub fn answers(&self) -> &[DnsRecord] {
        &self.answers
    }

    pub fn authorities(&self) -> &[DnsRecord] {
        &self.authorities
    }

    pub fn additionals(&self) -> &[DnsRecord] {
        &self.additionals
    }

    pub fn known_answer_count(&self) -> usize {
        self.known_answer_count
    }

    pub fn set_id(&mut self, id: u16) {
        self.id = id;
    }

    pub const fn is_query(&self) -> bool {
        (self.flags & FLAGS_QR_MASK) == FLAGS_QR_QUERY
    }

    const fn is_response(&self) -> bool {
        (self.flags & FLAGS_QR_MASK) == FLAGS_QR_RESPONSE
    }

    /// Returns true if nothing would be sent.
    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
            && self.answers.is_empty()
            && self.authorities.is_empty()
            && self.additionals.is_empty()
    }

    // From: RFC 6763, DNS-Based Service Discovery, February 2013
    //
    // 12.  DNS Additional Record Generation
    //
    //    DNS has an efficiency feature whereby a DNS server may place
    //    additional records in the additional section of the DNS message.
    //    These additional records are records that the client did not
    //    explicitly request, but the server has reasonable grounds to expect
    //    that the client might request them shortly, so including them can
    //    save the client from having to issue additional queries.
    /// Adds an additional answer unless the same record is already in the message.
    pub fn add_additional_answer(&mut self, answer: DnsRecord) {
        if self.answers.contains(&answer) || self.additionals.contains(&answer) {
            return;
        }
        trace!("add_additional_answer: {:?}", &answer);
        self.additionals.push(answer);
    }

    pub fn add_authority(&mut self, record: DnsRecord) {
        self.authorities.push(record);
    }

    /// Returns true if `answer` is added to the outgoing msg.
    /// Returns false if `answer` was suppressed by the incoming `msg` or is already present.
    pub fn add_answer(&mut self, msg: &DnsIncoming, answer: DnsRecord) -> bool {
        if answer.suppressed_by(msg) {
            trace!("my answer is suppressed by incoming msg");
            self.known_answer_count += 1;
            return false;
        }

        self.add_answer_record(answer)
    }

    /// Adds `answer` without known-answer checks. Returns false for a duplicate.
    pub fn add_answer_record(&mut self, answer: DnsRecord) -> bool {
        if self.answers.contains(&answer) {
            return false;
        }
        // An answer supersedes the same record in the additional section.
        self.additionals.retain(|r| !r.matches(&answer));
        trace!("add_answer push: {:?}", &answer);
        self.answers.push(answer);
        true
    }

    pub fn add_question(&mut self, name: &Domain, qtype: RRType) {
        self.add_question_raw(name, qtype as u16, false);
    }

    /// Adds a question with the QU (unicast response) bit set or cleared.
    pub fn add_question_raw(&mut self, name: &Domain, qtype: u16, unicast: bool) {
        let class = if unicast {
            CLASS_IN | CLASS_CACHE_FLUSH
        } else {
            CLASS_IN
        };
        let q = DnsQuestion {
            entry: DnsEntry::new(name.clone(), qtype, class),
        };
        self.questions.push(q);
    }

    pub(crate) fn add_question_entry(&mut self, question: DnsQuestion) {
        self.questions.push(question);
    }

    /// Returns a list of actual DNS packet data to be sent on the wire.
    pub fn to_data_on_wire(&self) -> Vec<Vec<u8>> {
        let packet_list = self.to_packets();
        packet_list.into_iter().map(|p| p.data).collect()
    }

    /// Encode self into one or more packets.
    pub fn to_packets(&self) -> Vec<DnsOutPacket> {
        let mut packet_list = Vec::new();
        let mut packet = DnsOutPacket::new();

        let mut question_count = self.questions.len() as u16;
        let mut answer_count = 0;
        let mut auth_count = 0;
        let mut addi_count = 0;

        for question in self.questions.iter() {
            packet.write_question(question);
        }

        for answer in self.answers.iter() {
            if packet.write_record(answer) {
                answer_count += 1;
                continue;
            }

            // No more processing for response packets.
            if self.is_response() {
                debug!("response truncated at {} answers", answer_count);
                break;
            }

            // For query, the current packet exceeds its max size due to known answers,
            // need to continue in a new packet with the TC bit set on this one.
            packet.write_header(
                self.id,
                self.flags | FLAGS_TC,
                [question_count, answer_count, auth_count, addi_count],
            );
            packet_list.push(packet);

            packet = DnsOutPacket::new();
            question_count = 0;
            answer_count = u16::from(packet.write_record(answer));
        }

        for auth in self.authorities.iter() {
            auth_count += u16::from(packet.write_record(auth));
        }

        for addi in self.additionals.iter() {
            if !packet.write_record(addi) {
                break;
            }
            addi_count += 1;
        }

        packet.write_header(
            self.id,
            self.flags,
            [question_count, answer_count, auth_count, addi_count],
        );

        packet_list.push(packet);
        packet_list
    }
}

/// An incoming DNS message. It could be a query or a response.
#[derive(Debug)]
pub struct DnsIncoming {
    offset: usize,
    data: Vec<u8>,
    questions: Vec<DnsQuestion>,
    answers: Vec<DnsRecord>,
    authorities: Vec<DnsRecord>,
    additional: Vec<DnsRecord>,
    id: u16,
    flags: u16,
    num_questions: u16,
    num_answers: u16,
    num_authorities: u16,
    num_additionals: u16,
}

impl DnsIncoming {
    /// Decodes `data`.
    ///
    /// Fails only if the header cannot be read. A malformed record is
    /// skipped; if the framing itself breaks, the records read so far are kept.
    pub fn new(data: Vec<u8>) -> Result<Self> {
        let mut incoming = Self {
            offset: 0,
            data,
            questions: Vec::new(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additional: Vec::new(),
            id: 0,
            flags: 0,
            num_questions: 0,
            num_answers: 0,
            num_authorities: 0,
            num_additionals: 0,
        };

        /*
        RFC 1035 section 4.1: https://datatracker.ietf.org/doc/html/rfc1035#section-4.1
        ...
        All communications inside of the domain protocol are carried in a single
        format called a message.  The top level format of message is divided
        into 5 sections (some of which are empty in certain cases) shown below:

            +---------------------+
            |        Header       |
            +---------------------+
            |       Question      | the question for the name server
            +---------------------+
            |        Answer       | RRs answering the question
            +---------------------+
            |      Authority      | RRs pointing toward an authority
            +---------------------+
            |      Additional     | RRs holding additional information
            +---------------------+
         */
        incoming.read_header()?;
        if let Err(e) = incoming.read_sections() {
            debug!("DnsIncoming: stop parsing id {}: {}", incoming.id, e);
        }

        Ok(incoming)
    }

    fn read_sections(&mut self) -> Result<()> {
        self.read_questions()?;
        self.answers = self.read_rr_records(self.num_answers)?;
        self.authorities = self.read_rr_records(self.num_authorities)?;
        self.additional = self.read_rr_records(self.num_additionals)?;
        Ok(())
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn questions(&self) -> &[DnsQuestion] {
        &self.questions
    }

    pub fn answers(&self) -> &[DnsRecord] {
        &self.answers
    }

    pub fn authorities(&self) -> &[DnsRecord] {
        &self.authorities
    }

    pub fn additionals(&self) -> &[DnsRecord] {
        &self.additional
    }

    /// Answers, authorities and additionals, in that order.
    pub fn all_records(&self) -> impl Iterator<Item = &DnsRecord> {
        self.answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.additional.iter())
    }

    pub fn num_authorities(&self) -> u16 {
        self.num_authorities
    }

    pub fn num_questions(&self) -> u16 {
        self.num_questions
    }

    pub const fn is_query(&self) -> bool {
        (self.flags & FLAGS_QR_MASK) == FLAGS_QR_QUERY
    }

    pub const fn is_response(&self) -> bool {
        (self.flags & FLAGS_QR_MASK) == FLAGS_QR_RESPONSE
    }

    fn read_header(&mut self) -> Result<()> {
        if self.data.len() < MSG_HEADER_LEN {
            return Err(e_fmt!(
                "DNS incoming: header is too short: {} bytes",
                self.data.len()
            ));
        }

        let data = &self.data[0..];
        self.id = u16_from_be_slice(&data[..2]);
        self.flags = u16_from_be_slice(&data[2..4]);
        self.num_questions = u16_from_be_slice(&data[4..6]);
        self.num_answers = u16_from_be_slice(&data[6..8]);
        self.num_authorities = u16_from_be_slice(&data[8..10]);
        self.num_additionals = u16_from_be_slice(&data[10..12]);

        self.offset = MSG_HEADER_LEN;

        trace!(
            "read_header: id {}, {} questions {} answers {} authorities {} additionals",
            self.id,
            self.num_questions,
            self.num_answers,
            self.num_authorities,
            self.num_additionals
        );
        Ok(())
    }

    fn read_questions(&mut self) -> Result<()> {
        trace!("read_questions: {}", &self.num_questions);
        for i in 0..self.num_questions {
            let name_start = self.skip_name()?;

            let data = &self.data[self.offset..];
            if data.len() < 4 {
                return Err(e_fmt!(
                    "DNS incoming: question idx {} too short: {}",
                    i,
                    data.len()
                ));
            }
            let ty = u16_from_be_slice(&data[..2]);
            let class = u16_from_be_slice(&data[2..4]);
            self.offset += 4;

            match decode_name(&self.data, name_start) {
                Ok(name) => self.questions.push(DnsQuestion {
                    entry: DnsEntry::new(name, ty, class),
                }),
                Err(e) => debug!("skip question idx {}: {}", i, e),
            }
        }
        Ok(())
    }

    /// Decodes a sequence of RR records (in answers, authorities and additionals).
    ///
    /// A record with bad content is skipped. An error is returned only when
    /// the end of a record cannot be determined.
    fn read_rr_records(&mut self, count: u16) -> Result<Vec<DnsRecord>> {
        trace!("read_rr_records: {}", count);
        let mut rr_records = Vec::new();

        // RFC 1035: https://datatracker.ietf.org/doc/html/rfc1035#section-3.2.1
        //
        // All RRs have the same top level format shown below:
        //                               1  1  1  1  1  1
        // 0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
        // +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
        // |                                               |
        // /                                               /
        // /                      NAME                     /
        // |                                               |
        // +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
        // |                      TYPE                     |
        // +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
        // |                     CLASS                     |
        // +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
        // |                      TTL                      |
        // |                                               |
        // +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
        // |                   RDLENGTH                    |
        // +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--|
        // /                     RDATA                     /
        // /                                               /
        // +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+

        // Must have at least TYPE, CLASS, TTL, RDLENGTH fields: 10 bytes.
        const RR_HEADER_REMAIN: usize = 10;

        for _ in 0..count {
            let name_start = self.skip_name()?;
            let slice = &self.data[self.offset..];

            if slice.len() < RR_HEADER_REMAIN {
                return Err(e_fmt!(
                    "read_rr_records: RR is too short after name: {} bytes",
                    slice.len()
                ));
            }

            let ty = u16_from_be_slice(&slice[..2]);
            let class = u16_from_be_slice(&slice[2..4]);
            let ttl = u32_from_be_slice(&slice[4..8]);
            let rdata_len = u16_from_be_slice(&slice[8..10]) as usize;
            let rdata_start = self.offset + RR_HEADER_REMAIN;
            let next_offset = rdata_start + rdata_len;

            // Sanity check for RDATA length.
            if next_offset > self.data.len() {
                return Err(e_fmt!(
                    "RR RDATA length {} is invalid: remain data len: {}",
                    rdata_len,
                    self.data.len() - rdata_start
                ));
            }

            let record = decode_name(&self.data, name_start).and_then(|name| {
                let rdata = self.read_rdata(ty, rdata_start, next_offset)?;
                Ok(DnsRecord::new(name, class, ttl, rdata))
            });

            // The record boundary is known, so move on regardless.
            self.offset = next_offset;

            match record {
                Ok(record) => {
                    trace!("read_rr_records: {:?}", &record);
                    rr_records.push(record);
                }
                Err(e) => debug!("skip malformed record of type {}: {}", ty, e),
            }
        }

        Ok(rr_records)
    }

    /// Decodes RDATA in `data[start..end]`.
    fn read_rdata(&self, ty: u16, start: usize, end: usize) -> Result<RData> {
        let rdata = &self.data[start..end];

        let parsed = match RRType::from_u16(ty) {
            Some(RRType::A) => {
                let bytes: [u8; 4] = rdata
                    .try_into()
                    .map_err(|_| e_fmt!("A record rdata length {}", rdata.len()))?;
                RData::A(Ipv4Addr::from(bytes))
            }
            Some(RRType::AAAA) => {
                let bytes: [u8; 16] = rdata
                    .try_into()
                    .map_err(|_| e_fmt!("AAAA record rdata length {}", rdata.len()))?;
                RData::AAAA(Ipv6Addr::from(bytes))
            }
            Some(RRType::PTR) => {
                let alias = self.read_name_within(start, end)?;
                RData::Ptr(alias)
            }
            Some(RRType::TXT) => RData::Txt(rdata.to_vec()),
            Some(RRType::SRV) => {
                if rdata.len() < 3 * U16_SIZE + 1 {
                    return Err(e_fmt!("SRV rdata too short: {}", rdata.len()));
                }
                RData::Srv {
                    priority: u16_from_be_slice(&rdata[0..2]),
                    weight: u16_from_be_slice(&rdata[2..4]),
                    port: u16_from_be_slice(&rdata[4..6]),
                    target: self.read_name_within(start + 6, end)?,
                }
            }
            Some(RRType::NSEC) => {
                let domain_end = name_end(&self.data, start)?;
                if domain_end > end {
                    return Err(e_fmt!("NSEC next domain overflows rdata"));
                }
                let next_domain = decode_name(&self.data, start)?;
                let type_bitmap = read_type_bitmap(&self.data[domain_end..end])?;
                RData::NSec {
                    next_domain,
                    type_bitmap,
                }
            }
            _ => RData::Generic {
                ty,
                data: rdata.to_vec(),
            },
        };

        Ok(parsed)
    }

    /// Reads a name that must occupy exactly `data[start..end]` on the wire.
    fn read_name_within(&self, start: usize, end: usize) -> Result<Domain> {
        let domain_end = name_end(&self.data, start)?;
        if domain_end != end {
            return Err(e_fmt!(
                "name in rdata ends at {} but rdata ends at {}",
                domain_end,
                end
            ));
        }
        decode_name(&self.data, start)
    }

    /// Moves past the name at the current offset, returning where it started.
    fn skip_name(&mut self) -> Result<usize> {
        let start = self.offset;
        self.offset = name_end(&self.data, start)?;
        Ok(start)
    }
}

/// Returns the offset right after the in-place part of the name at `start`.
///
/// Only the framing is checked: label lengths and the terminating
/// zero or pointer. Pointers are not followed.
fn name_end(data: &[u8], start: usize) -> Result<usize> {
    let mut offset = start;
    loop {
        let length = *data
            .get(offset)
            .ok_or_else(|| e_fmt!("name at {} runs past data len {}", start, data.len()))?;

        match length & 0xC0 {
            0x00 => {
                offset += 1;
                if length == 0 {
                    return Ok(offset);
                }
                offset += length as usize;
            }
            0xC0 => {
                offset += U16_SIZE;
                if offset > data.len() {
                    return Err(e_fmt!("name pointer at {} is truncated", offset));
                }
                return Ok(offset);
            }
            _ => {
                return Err(e_fmt!(
                    "bad name with invalid length: 0x{:x} offset {}",
                    length,
                    offset
                ))
            }
        }
    }
}

/// Reads a domain name at `start`, following compression pointers.
///
/// See https://datatracker.ietf.org/doc/html/rfc1035#section-3.1 for
/// domain name encoding.
fn decode_name(data: &[u8], start: usize) -> Result<Domain> {
    let mut domain = Domain::new();
    let mut offset = start;
    let mut redirections = 0;

    // From RFC1035:
    // "...The compression scheme allows a domain name in a message to be
    // represented as either:
    // - a sequence of labels ending in a zero octet
    // - a pointer
    // - a sequence of labels ending with a pointer"
    loop {
        let length = *data
            .get(offset)
            .ok_or_else(|| e_fmt!("read_name: offset {} data len {}", offset, data.len()))?;

        match length & 0xC0 {
            0x00 => {
                if length == 0 {
                    return Ok(domain);
                }
                offset += 1;
                let ending = offset + length as usize;
                let label = data.get(offset..ending).ok_or_else(|| {
                    e_fmt!(
                        "read_name: ending {} exceeds data length {}",
                        ending,
                        data.len()
                    )
                })?;
                domain.push_raw_label(label)?;
                offset = ending;
            }
            0xC0 => {
                // Message compression.
                // See https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.4
                redirections += 1;
                if redirections > MAX_NAME_REDIRECTIONS {
                    return Err(Error::InvalidName(format!(
                        "more than {} compression pointers",
                        MAX_NAME_REDIRECTIONS
                    )));
                }
                let slice = data
                    .get(offset..offset + U16_SIZE)
                    .ok_or_else(|| e_fmt!("read_name: truncated pointer at {}", offset))?;
                offset = (u16_from_be_slice(slice) & 0x3FFF) as usize;
            }
            _ => {
                return Err(e_fmt!(
                    "bad name with invalid length: 0x{:x} offset {}",
                    length,
                    offset
                ))
            }
        }
    }
}

/// Reads the "Type Bit Map" block for a DNS NSEC record.
fn read_type_bitmap(data: &[u8]) -> Result<Vec<u8>> {
    // From RFC 6762: 6.1.  Negative Responses
    // https://datatracker.ietf.org/doc/html/rfc6762#section-6.1
    //   o The Type Bit Map block number is 0.
    //   o The Type Bit Map block length byte is a value in the range 1-32.
    //   o The Type Bit Map data is 1-32 bytes, as indicated by length
    //     byte.
    if data.len() < 2 {
        return Err(e_fmt!("NSEC type bitmap too short: {}", data.len()));
    }

    let block_num = data[0];
    if block_num != 0 {
        return Err(e_fmt!("NSEC block number is not 0: {}", block_num));
    }

    let block_len = data[1] as usize;
    if !(1..=32).contains(&block_len) {
        return Err(e_fmt!(
            "NSEC block length must be in the range 1-32: {}",
            block_len
        ));
    }

    data.get(2..2 + block_len)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| e_fmt!("NSEC block overflow: {} over {}", block_len, data.len() - 2))
}

const fn u16_from_be_slice(bytes: &[u8]) -> u16 {
    let u8_array: [u8; 2] = [bytes[0], bytes[1]];
    u16::from_be_bytes(u8_array)
}

const fn u32_from_be_slice(s: &[u8]) -> u32 {
    let u8_array: [u8; 4] = [s[0], s[1], s[2], s[3]];
    u32::from_be_bytes(u8_array)
}
