//! Domain names kept in their DNS wire encoding.
//!
//! A [Domain] stores length-prefixed labels exactly as they go on the wire
//! (without the terminating root label and without compression). The dotted
//! form is computed on demand and cached until the labels change.

use crate::error::{Error, Result};
use std::{
    cell::OnceCell,
    cmp, fmt,
    hash::{Hash, Hasher},
    net::{Ipv4Addr, Ipv6Addr},
};

/// Max encoded length of a domain name, including the root label.
///
/// See [RFC 1035 section 3.1](https://datatracker.ietf.org/doc/html/rfc1035#section-3.1)
pub const MAX_DOMAIN_LENGTH: usize = 255;

/// Max length of a single label.
pub const MAX_LABEL_LENGTH: usize = 63;

/// Max length of the service name without the leading underscore, per
/// [RFC 6763 section 7.2](https://www.rfc-editor.org/rfc/rfc6763#section-7.2).
pub const SERVICE_NAME_LEN_MAX: usize = 15;

/// Max length of the protocol label without the leading underscore ("tcp" or "udp").
pub const PROTOCOL_LEN_MAX: usize = 3;

const LOCAL_LABEL: &str = "local";

/// A DNS domain name.
///
/// Equality, hashing and ordering ignore ASCII case, as DNS labels do.
#[derive(Clone, Default)]
pub struct Domain {
    /// Length-prefixed labels, no root label.
    encoded: Vec<u8>,

    /// Dotted form, computed lazily.
    decoded: OnceCell<String>,
}

impl Domain {
    /// Creates an empty (root) domain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a dotted name such as `"MyDevice._http._tcp.local"`.
    ///
    /// A single trailing dot is accepted and ignored. Empty labels are rejected.
    pub fn parse(name: &str) -> Result<Self> {
        let name = name.strip_suffix('.').unwrap_or(name);
        let mut domain = Self::new();
        if name.is_empty() {
            return Ok(domain);
        }
        for label in name.split('.') {
            domain.add_label(label)?;
        }
        Ok(domain)
    }

    /// Appends one label.
    ///
    /// The label is taken verbatim, so an instance name such as `"Living room.2"`
    /// stays one label.
    pub fn add_label(&mut self, label: &str) -> Result<()> {
        self.push_raw_label(label.as_bytes())
    }

    /// Appends one label from raw wire bytes.
    pub(crate) fn push_raw_label(&mut self, label: &[u8]) -> Result<()> {
        if label.is_empty() {
            return Err(Error::InvalidName("empty label".to_string()));
        }
        if label.len() > MAX_LABEL_LENGTH {
            return Err(Error::InvalidName(format!(
                "label length {} exceeds {}",
                label.len(),
                MAX_LABEL_LENGTH
            )));
        }
        // +1 for the length byte of this label, +1 for the root label.
        let new_len = self.encoded.len() + 1 + label.len() + 1;
        if new_len > MAX_DOMAIN_LENGTH {
            return Err(Error::InvalidName(format!(
                "domain length {} exceeds {}",
                new_len, MAX_DOMAIN_LENGTH
            )));
        }

        self.encoded.push(label.len() as u8);
        self.encoded.extend_from_slice(label);
        self.decoded.take();
        Ok(())
    }

    /// Appends all labels of `other`.
    pub fn append(&mut self, other: &Domain) -> Result<()> {
        for label in other.labels() {
            self.push_raw_label(label)?;
        }
        Ok(())
    }

    /// Returns the dotted form, without a trailing dot.
    pub fn as_str(&self) -> &str {
        self.decoded.get_or_init(|| {
            let labels: Vec<_> = self
                .labels()
                .map(|l| String::from_utf8_lossy(l).into_owned())
                .collect();
            labels.join(".")
        })
    }

    pub fn is_empty(&self) -> bool {
        self.encoded.is_empty()
    }

    /// Length on the wire when written without compression, root label included.
    pub fn encoded_len(&self) -> usize {
        self.encoded.len() + 1
    }

    /// Iterates over the raw labels, left to right.
    pub fn labels(&self) -> Labels<'_> {
        Labels {
            encoded: &self.encoded,
            offset: 0,
        }
    }

    /// The wire encoding without the root label.
    pub(crate) fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    /// Offsets (into [Self::encoded]) where each label suffix starts.
    pub(crate) fn suffix_offsets(&self) -> Vec<usize> {
        let mut offsets = Vec::new();
        let mut offset = 0;
        while offset < self.encoded.len() {
            offsets.push(offset);
            offset += 1 + self.encoded[offset] as usize;
        }
        offsets
    }

    /// Appends the uncompressed, lower-cased wire form to `out`.
    pub(crate) fn write_canonical(&self, out: &mut Vec<u8>) {
        out.extend(self.encoded.iter().map(u8::to_ascii_lowercase));
        out.push(0);
    }

    /// Builds `<hostname>.local`. A hostname already ending in `.local` is kept as is.
    pub fn for_host(hostname: &str) -> Result<Self> {
        check_hostname(hostname)?;
        let mut domain = Self::parse(hostname)?;
        let has_local = domain
            .labels()
            .last()
            .map_or(false, |l| l.eq_ignore_ascii_case(LOCAL_LABEL.as_bytes()));
        if !has_local {
            domain.add_label(LOCAL_LABEL)?;
        }
        Ok(domain)
    }

    /// Builds `_<service>._<proto>.local`.
    ///
    /// `service` and `proto` may be given with or without the leading underscore.
    pub fn for_service_type(service: &str, proto: &str) -> Result<Self> {
        let service = service.strip_prefix('_').unwrap_or(service);
        let proto = proto.strip_prefix('_').unwrap_or(proto);
        check_service_name(service)?;
        check_protocol(proto)?;

        let mut domain = Self::new();
        domain.add_label(&format!("_{}", service))?;
        domain.add_label(&format!("_{}", proto))?;
        domain.add_label(LOCAL_LABEL)?;
        Ok(domain)
    }

    /// Builds `<instance>._<service>._<proto>.local`.
    pub fn for_service_instance(instance: &str, service: &str, proto: &str) -> Result<Self> {
        let mut domain = Self::new();
        domain.add_label(instance)?;
        domain.append(&Self::for_service_type(service, proto)?)?;
        Ok(domain)
    }

    /// The DNS-SD meta-query name `_services._dns-sd._udp.local`.
    ///
    /// See [RFC 6763 section 9](https://datatracker.ietf.org/doc/html/rfc6763#section-9)
    pub fn meta_service() -> Self {
        let mut domain = Self::new();
        for label in ["_services", "_dns-sd", "_udp", LOCAL_LABEL].iter() {
            // Constant labels, all well within limits.
            let _ = domain.add_label(label);
        }
        domain
    }

    /// Builds the reverse-mapping name, e.g. `10.1.168.192.in-addr.arpa`.
    pub fn reverse_ipv4(addr: Ipv4Addr) -> Self {
        let mut domain = Self::new();
        for octet in addr.octets().iter().rev() {
            let _ = domain.add_label(&octet.to_string());
        }
        let _ = domain.add_label("in-addr");
        let _ = domain.add_label("arpa");
        domain
    }

    /// Builds the nibble-reversed name under `ip6.arpa`.
    ///
    /// See [RFC 3596 section 2.5](https://datatracker.ietf.org/doc/html/rfc3596#section-2.5)
    pub fn reverse_ipv6(addr: Ipv6Addr) -> Self {
        let mut domain = Self::new();
        for octet in addr.octets().iter().rev() {
            let _ = domain.add_label(&format!("{:x}", octet & 0x0F));
            let _ = domain.add_label(&format!("{:x}", octet >> 4));
        }
        let _ = domain.add_label("ip6");
        let _ = domain.add_label("arpa");
        domain
    }

    fn folded(&self) -> impl Iterator<Item = u8> + '_ {
        self.encoded.iter().map(u8::to_ascii_lowercase)
    }
}

/// Iterator over the raw labels of a [Domain].
pub struct Labels<'a> {
    encoded: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for Labels<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.encoded.len() {
            return None;
        }
        let len = self.encoded[self.offset] as usize;
        let start = self.offset + 1;
        self.offset = start + len;
        self.encoded.get(start..start + len)
    }
}

impl PartialEq for Domain {
    fn eq(&self, other: &Self) -> bool {
        // Length bytes are at most 63, so folding them is harmless.
        self.encoded.eq_ignore_ascii_case(&other.encoded)
    }
}

impl Eq for Domain {}

impl Hash for Domain {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.folded() {
            state.write_u8(b);
        }
    }
}

impl PartialOrd for Domain {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Domain {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.folded().cmp(other.folded())
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Domain({:?})", self.as_str())
    }
}

/// Validate a hostname (the part before `.local`).
pub(crate) fn check_hostname(hostname: &str) -> Result<()> {
    let name = hostname.strip_suffix('.').unwrap_or(hostname);
    let name = name.strip_suffix(".local").unwrap_or(name);
    if name.is_empty() || name == "local" {
        return Err(Error::InvalidName(
            "the part of the hostname before '.local' cannot be empty".to_string(),
        ));
    }
    if name.len() > MAX_DOMAIN_LENGTH {
        return Err(Error::InvalidName(format!(
            "hostname length must be <= {} bytes",
            MAX_DOMAIN_LENGTH
        )));
    }
    Ok(())
}

/// Validate the service name, given without the leading underscore.
///
/// Rules from [RFC 6335 section 5.1](https://datatracker.ietf.org/doc/html/rfc6335#section-5.1).
pub(crate) fn check_service_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidName("service name cannot be empty".to_string()));
    }

    if name.len() > SERVICE_NAME_LEN_MAX {
        return Err(Error::InvalidName(format!(
            "service name length must be <= {} bytes: {}",
            SERVICE_NAME_LEN_MAX, name
        )));
    }

    if name.contains("--") {
        return Err(Error::InvalidName(format!(
            "service name must not contain '--': {}",
            name
        )));
    }

    if name.starts_with('-') || name.ends_with('-') {
        return Err(Error::InvalidName(format!(
            "service name may not start or end with '-': {}",
            name
        )));
    }

    let ascii_count = name.chars().filter(|c| c.is_ascii_alphabetic()).count();
    if ascii_count < 1 {
        return Err(Error::InvalidName(format!(
            "service name must contain at least one letter: {}",
            name
        )));
    }

    Ok(())
}

/// Validate the protocol label, given without the leading underscore.
pub(crate) fn check_protocol(proto: &str) -> Result<()> {
    if proto.is_empty() || proto.len() > PROTOCOL_LEN_MAX {
        return Err(Error::InvalidName(format!(
            "protocol must be 1 to {} bytes: '{}'",
            PROTOCOL_LEN_MAX, proto
        )));
    }
    Ok(())
}
