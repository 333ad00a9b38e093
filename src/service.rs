//! Locally advertised services and their TXT properties.

#[cfg(feature = "logging")]
use crate::log::debug;
use crate::{
    dns_parser::{DnsRecord, CLASS_CACHE_FLUSH, CLASS_IN},
    domain::{Domain, MAX_DOMAIN_LENGTH},
    error::{Error, Result},
    probe::{Probe, ProbeListener},
};
use std::fmt;

/// Max length of one TXT entry, `key=value`, as it is prefixed with a single length byte.
pub const TXT_ENTRY_LEN_MAX: usize = 255;

/// Stable reference to a service registered with a [`Host`](crate::Host).
///
/// Handles are never reused, so a stale handle simply finds nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceHandle(pub(crate) u32);

/// Represents a property in a TXT record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtProperty {
    /// The name of the property. The original cases are kept.
    key: String,

    /// `None` for a boolean attribute (a key without `=`).
    /// RFC 6763 says values are bytes, not necessarily UTF-8.
    val: Option<Vec<u8>>,

    /// Filled by a [TxtProvider] just before sending, dropped right after.
    temporary: bool,
}

impl TxtProperty {
    pub fn new(key: &str, val: Option<&[u8]>) -> Self {
        Self {
            key: key.to_string(),
            val: val.map(<[u8]>::to_vec),
            temporary: false,
        }
    }

    /// Returns the key of a property.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the raw value of a property.
    pub fn val(&self) -> Option<&[u8]> {
        self.val.as_deref()
    }

    /// Returns the value as a string if it is valid UTF-8.
    pub fn val_str(&self) -> Option<&str> {
        self.val().and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// Length of this entry on the wire, without its length byte.
    fn encoded_len(&self) -> usize {
        match &self.val {
            Some(val) => self.key.len() + 1 + val.len(),
            None => self.key.len(),
        }
    }
}

impl fmt::Display for TxtProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.val {
            Some(val) => write!(f, "{}={}", self.key, String::from_utf8_lossy(val)),
            None => write!(f, "{}", self.key),
        }
    }
}

/// Represents properties in a TXT record.
///
/// The key string of a property is case insensitive, and only
/// one [`TxtProperty`] is stored for the same key.
///
/// [RFC 6763](https://www.rfc-editor.org/rfc/rfc6763#section-6.4):
/// "A given key SHOULD NOT appear more than once in a TXT record."
#[derive(Debug, Clone, Default)]
pub struct TxtProperties {
    // Use `Vec` instead of `HashMap` to keep the order of insertions.
    properties: Vec<TxtProperty>,
}

impl TxtProperties {
    /// Returns an iterator for all properties.
    pub fn iter(&self) -> impl Iterator<Item = &TxtProperty> {
        self.properties.iter()
    }

    /// Returns the number of properties.
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// Returns if the properties are empty.
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Returns a property for a given `key`, where `key` is
    /// case insensitive.
    pub fn get(&self, key: &str) -> Option<&TxtProperty> {
        self.properties
            .iter()
            .find(|prop| prop.key.eq_ignore_ascii_case(key))
    }

    /// Returns a property value string for a given `key`, where `key` is
    /// case insensitive.
    pub fn get_property_val_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(TxtProperty::val_str)
    }

    /// Adds a property, or updates the value if the key exists already.
    ///
    /// `max_total` bounds the encoded size of all properties together.
    pub(crate) fn set(
        &mut self,
        key: &str,
        val: Option<&[u8]>,
        temporary: bool,
        max_total: usize,
    ) -> Result<()> {
        if key.is_empty() || key.contains('=') {
            return Err(Error::InvalidName(format!("invalid TXT key: '{}'", key)));
        }

        let mut prop = TxtProperty::new(key, val);
        prop.temporary = temporary;
        if prop.encoded_len() > TXT_ENTRY_LEN_MAX {
            return Err(Error::LimitExceeded(format!(
                "TXT entry '{}' is longer than {} bytes",
                key, TXT_ENTRY_LEN_MAX
            )));
        }

        let existing = self
            .properties
            .iter()
            .position(|p| p.key.eq_ignore_ascii_case(key));
        let replaced_len = existing.map_or(0, |i| 1 + self.properties[i].encoded_len());
        let total = self.encoded_len() - replaced_len + 1 + prop.encoded_len();
        if total > max_total {
            return Err(Error::LimitExceeded(format!(
                "TXT data would be {} bytes, max {}",
                total, max_total
            )));
        }

        match existing {
            Some(i) => self.properties[i] = prop,
            None => self.properties.push(prop),
        }
        Ok(())
    }

    /// Removes the property of `key`. Returns true if it existed.
    pub(crate) fn remove(&mut self, key: &str) -> bool {
        let before = self.properties.len();
        self.properties.retain(|p| !p.key.eq_ignore_ascii_case(key));
        self.properties.len() != before
    }

    /// Drops all temporary properties.
    pub(crate) fn purge_temporary(&mut self) {
        self.properties.retain(|p| !p.temporary);
    }

    /// Encoded size of all properties, length bytes included.
    fn encoded_len(&self) -> usize {
        self.properties.iter().map(|p| 1 + p.encoded_len()).sum()
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        encode_txt(self.properties.iter())
    }
}

/// Lets a [TxtProvider] add entries that live for a single send.
pub struct DynamicTxt<'a> {
    properties: &'a mut TxtProperties,
    max_total: usize,
}

impl<'a> DynamicTxt<'a> {
    pub(crate) fn new(properties: &'a mut TxtProperties, max_total: usize) -> Self {
        Self {
            properties,
            max_total,
        }
    }

    /// Adds a `key=value` entry for the pending send.
    ///
    /// Keys of static entries cannot be overridden.
    pub fn add(&mut self, key: &str, val: &str) -> Result<()> {
        self.check_static(key)?;
        self.properties
            .set(key, Some(val.as_bytes()), true, self.max_total)
    }

    /// Adds a boolean attribute (key only) for the pending send.
    pub fn add_flag(&mut self, key: &str) -> Result<()> {
        self.check_static(key)?;
        self.properties.set(key, None, true, self.max_total)
    }

    fn check_static(&self, key: &str) -> Result<()> {
        match self.properties.get(key) {
            Some(prop) if !prop.temporary => Err(Error::InvalidName(format!(
                "TXT key '{}' is already set statically",
                key
            ))),
            _ => Ok(()),
        }
    }
}

/// Generates TXT entries just before a service's TXT record is sent.
pub trait TxtProvider {
    fn provide_txt(&mut self, instance: &Domain, txt: &mut DynamicTxt<'_>);
}

impl<F> TxtProvider for F
where
    F: FnMut(&Domain, &mut DynamicTxt<'_>),
{
    fn provide_txt(&mut self, instance: &Domain, txt: &mut DynamicTxt<'_>) {
        self(instance, txt)
    }
}

// Convert from properties key/value pairs to DNS TXT record content
pub(crate) fn encode_txt<'a>(properties: impl Iterator<Item = &'a TxtProperty>) -> Vec<u8> {
    let mut bytes = Vec::new();
    for prop in properties {
        // Entry length was checked when the property was set.
        bytes.push(prop.encoded_len() as u8);
        bytes.extend_from_slice(prop.key.as_bytes());
        if let Some(val) = &prop.val {
            bytes.push(b'=');
            bytes.extend_from_slice(val);
        }
    }
    if bytes.is_empty() {
        bytes.push(0);
    }
    bytes
}

/// Convert from DNS TXT record content to key/value pairs.
///
/// Entries that are empty, not UTF-8 keys, or cut short are skipped.
pub fn decode_txt(txt: &[u8]) -> Vec<TxtProperty> {
    let mut properties: Vec<TxtProperty> = Vec::new();
    let mut offset = 0;
    while offset < txt.len() {
        let length = txt[offset] as usize;
        offset += 1; // move over the length byte
        if length == 0 {
            continue;
        }
        let entry = match txt.get(offset..offset + length) {
            Some(entry) => entry,
            None => {
                debug!("TXT entry of {} bytes cut short at {}", length, offset);
                break;
            }
        };
        offset += length;

        let (key, val) = match entry.iter().position(|b| *b == b'=') {
            Some(idx) => (&entry[..idx], Some(&entry[idx + 1..])),
            None => (entry, None),
        };
        let key = match std::str::from_utf8(key) {
            Ok(key) if !key.is_empty() => key,
            _ => continue,
        };

        // RFC 6763 section 6.4: "If a client receives a TXT record containing
        // the same key more than once, then the client MUST silently ignore all
        // but the first occurrence of that attribute."
        if properties.iter().any(|p| p.key.eq_ignore_ascii_case(key)) {
            continue;
        }
        properties.push(TxtProperty::new(key, val));
    }

    properties
}

/// One service advertised by the host.
pub(crate) struct Service {
    pub(crate) handle: ServiceHandle,

    /// The instance label, e.g. "MyDevice".
    instance: String,

    /// True while the instance name follows the host's default name.
    pub(crate) auto_named: bool,

    /// Service label without underscore, e.g. "http".
    service: String,

    /// "tcp" or "udp".
    proto: String,

    /// `_<service>._<proto>.local`
    ty_domain: Domain,

    /// `<instance>._<service>._<proto>.local`
    fullname: Domain,

    pub(crate) port: u16,
    pub(crate) txts: TxtProperties,
    pub(crate) probe: Probe,
    pub(crate) probe_listener: Option<Box<dyn ProbeListener>>,
    pub(crate) txt_provider: Option<Box<dyn TxtProvider>>,
}

impl Service {
    pub(crate) fn new(
        handle: ServiceHandle,
        instance: &str,
        auto_named: bool,
        service: &str,
        proto: &str,
        port: u16,
    ) -> Result<Self> {
        let service = service.strip_prefix('_').unwrap_or(service);
        let proto = proto.strip_prefix('_').unwrap_or(proto);
        let ty_domain = Domain::for_service_type(service, proto)?;
        let fullname = if instance.is_empty() {
            Domain::new()
        } else {
            instance_domain(instance, &ty_domain)?
        };

        Ok(Self {
            handle,
            instance: instance.to_string(),
            auto_named,
            service: service.to_string(),
            proto: proto.to_string(),
            ty_domain,
            fullname,
            port,
            txts: TxtProperties::default(),
            probe: Probe::new(),
            probe_listener: None,
            txt_provider: None,
        })
    }

    pub(crate) fn instance(&self) -> &str {
        &self.instance
    }

    pub(crate) fn ty_domain(&self) -> &Domain {
        &self.ty_domain
    }

    pub(crate) fn fullname(&self) -> &Domain {
        &self.fullname
    }

    /// Returns true if this service is the one keyed by the given names.
    pub(crate) fn is(&self, instance: &str, service: &str, proto: &str) -> bool {
        let service = service.strip_prefix('_').unwrap_or(service);
        let proto = proto.strip_prefix('_').unwrap_or(proto);
        self.instance.eq_ignore_ascii_case(instance)
            && self.service.eq_ignore_ascii_case(service)
            && self.proto.eq_ignore_ascii_case(proto)
    }

    /// Changes the instance name. An empty name is kept but blocks probing.
    pub(crate) fn rename(&mut self, instance: &str) -> Result<()> {
        let fullname = if instance.is_empty() {
            Domain::new()
        } else {
            instance_domain(instance, &self.ty_domain)?
        };
        debug!("service {} renamed to {}", self.fullname, fullname);
        self.instance = instance.to_string();
        self.fullname = fullname;
        self.probe.restart();
        Ok(())
    }

    /// Runs the TXT provider, if any, to add the temporary entries.
    pub(crate) fn fill_dynamic_txt(&mut self, max_total: usize) {
        if let Some(provider) = self.txt_provider.as_mut() {
            self.txts.purge_temporary();
            let mut dynamic = DynamicTxt::new(&mut self.txts, max_total);
            provider.provide_txt(&self.fullname, &mut dynamic);
        }
    }

    pub(crate) fn ptr_record(&self, ttl: u32) -> DnsRecord {
        DnsRecord::new_ptr(self.ty_domain.clone(), CLASS_IN, ttl, self.fullname.clone())
    }

    pub(crate) fn meta_ptr_record(&self, ttl: u32) -> DnsRecord {
        DnsRecord::new_ptr(Domain::meta_service(), CLASS_IN, ttl, self.ty_domain.clone())
    }

    pub(crate) fn srv_record(&self, host: &Domain, ttl: u32) -> DnsRecord {
        DnsRecord::new_srv(
            self.fullname.clone(),
            CLASS_IN | CLASS_CACHE_FLUSH,
            ttl,
            self.port,
            host.clone(),
        )
    }

    /// TXT record from the current properties, temporary ones included.
    pub(crate) fn txt_record(&self, ttl: u32) -> DnsRecord {
        DnsRecord::new_txt(
            self.fullname.clone(),
            CLASS_IN | CLASS_CACHE_FLUSH,
            ttl,
            self.txts.encode(),
        )
    }

    /// TXT record for one send: dynamic entries are generated, encoded and dropped.
    pub(crate) fn txt_record_once(&mut self, ttl: u32, max_total: usize) -> DnsRecord {
        self.fill_dynamic_txt(max_total);
        let record = self.txt_record(ttl);
        self.txts.purge_temporary();
        record
    }
}

fn instance_domain(instance: &str, ty_domain: &Domain) -> Result<Domain> {
    let mut fullname = Domain::new();
    fullname.add_label(instance)?;
    fullname.append(ty_domain)?;
    if fullname.encoded_len() > MAX_DOMAIN_LENGTH {
        return Err(Error::InvalidName(format!("{} is too long", instance)));
    }
    Ok(fullname)
}
