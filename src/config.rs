//! Tunables of a [`Host`](crate::Host).

use std::time::Duration;

/// TTL for host records (A, AAAA, SRV and reverse PTR), in seconds.
///
/// RFC 6762 section 10: "... host name resource records ... SHOULD use TTL of 120 seconds."
pub const DNS_HOST_TTL: u32 = 120;

/// TTL for other records (PTR, TXT), in seconds.
pub const DNS_OTHER_TTL: u32 = 4500;

/// TTL cap for answers to legacy unicast queries, in seconds.
///
/// See [RFC 6762 section 6.7](https://datatracker.ietf.org/doc/html/rfc6762#section-6.7)
pub const DNS_LEGACY_TTL: u32 = 10;

/// Configuration of a [`Host`](crate::Host), with defaults from RFC 6762.
///
/// ```
/// use mdns_responder::HostConfig;
/// use std::time::Duration;
///
/// let config = HostConfig::default()
///     .with_max_services(8)
///     .with_probe_interval(Duration::from_millis(250))
///     .with_seed(42);
/// assert_eq!(config.max_services(), 8);
/// ```
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub(crate) host_ttl: u32,
    pub(crate) other_ttl: u32,
    pub(crate) legacy_ttl: u32,
    pub(crate) probe_wait: Duration,
    pub(crate) probe_interval: Duration,
    pub(crate) probe_count: u32,
    pub(crate) probe_defer: Duration,
    pub(crate) announce_interval: Duration,
    pub(crate) announce_count: u32,
    pub(crate) query_resend: Duration,
    pub(crate) query_backoff_max_exp: u32,
    pub(crate) max_services: usize,
    pub(crate) max_queries: usize,
    pub(crate) max_txt_len: usize,
    pub(crate) seed: Option<u64>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host_ttl: DNS_HOST_TTL,
            other_ttl: DNS_OTHER_TTL,
            legacy_ttl: DNS_LEGACY_TTL,
            probe_wait: Duration::from_millis(250),
            probe_interval: Duration::from_millis(250),
            probe_count: 3,
            probe_defer: Duration::from_secs(1),
            announce_interval: Duration::from_millis(1000),
            announce_count: 3,
            query_resend: Duration::from_millis(1000),
            query_backoff_max_exp: 12,
            max_services: 32,
            max_queries: 32,
            max_txt_len: 1300,
            seed: None,
        }
    }
}

impl HostConfig {
    /// TTLs for host records and for other records, in seconds.
    pub fn with_ttls(mut self, host_ttl: u32, other_ttl: u32) -> Self {
        self.host_ttl = host_ttl;
        self.other_ttl = other_ttl;
        self
    }

    /// Upper bound of the random delay before the first probe.
    pub fn with_probe_wait(mut self, wait: Duration) -> Self {
        self.probe_wait = wait;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// The first announce interval. Later intervals double.
    pub fn with_announce_interval(mut self, interval: Duration) -> Self {
        self.announce_interval = interval;
        self
    }

    /// The first resend delay of a query. Later delays double.
    pub fn with_query_resend(mut self, delay: Duration) -> Self {
        self.query_resend = delay;
        self
    }

    pub fn with_max_services(mut self, max: usize) -> Self {
        self.max_services = max;
        self
    }

    pub fn with_max_queries(mut self, max: usize) -> Self {
        self.max_queries = max;
        self
    }

    /// Max encoded size of one service's TXT data.
    pub fn with_max_txt_len(mut self, max: usize) -> Self {
        self.max_txt_len = max;
        self
    }

    /// Seeds the random probe delay, for reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn host_ttl(&self) -> u32 {
        self.host_ttl
    }

    pub fn other_ttl(&self) -> u32 {
        self.other_ttl
    }

    pub fn max_services(&self) -> usize {
        self.max_services
    }

    pub fn max_queries(&self) -> usize {
        self.max_queries
    }

    pub fn max_txt_len(&self) -> usize {
        self.max_txt_len
    }
}
