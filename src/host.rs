//! The poll-driven mDNS responder and resolver of one network interface.

// How DNS-based Service Discovery works in a nutshell:
//
// (excerpt from RFC 6763)
// .... that a particular service instance can be
//    described using a DNS SRV [RFC2782] and DNS TXT [RFC1035] record.
//    The SRV record has a name of the form "<Instance>.<Service>.<Domain>"
//    and gives the target host and port where the service instance can be
//    reached.  The DNS TXT record of the same name gives additional
//    information about this instance, in a structured form using key/value
//    pairs, described in Section 6.  A client discovers the list of
//    available instances of a given service type using a query for a DNS
//    PTR [RFC1035] record with a name of the form "<Service>.<Domain>",
//    which returns a set of zero or more names, which are the names of the
//    aforementioned DNS SRV/TXT record pairs.
//
// Some naming conventions in this source code:
//
// `ty_domain` refers to service type together with domain name, i.e. <service>.<domain>.
//     for example: `_http._tcp.local`
//
// `fullname` refers to a full Service Instance Name, i.e. <instance>.<service>.<domain>
//     for example: `MyDevice._http._tcp.local`

#[cfg(feature = "logging")]
use crate::log::{debug, trace};
use crate::{
    config::HostConfig,
    dns_parser::{
        DnsIncoming, DnsOutgoing, DnsQuestion, DnsRecord, RRType, CLASS_CACHE_FLUSH, CLASS_IN,
        FLAGS_AA, FLAGS_QR_QUERY, FLAGS_QR_RESPONSE, MAX_MSG_ABSOLUTE,
    },
    domain::Domain,
    error::{e_fmt, Error, Result},
    probe::{hostname_change, name_change, tiebreak, Probe, ProbeListener, ProbeStatus, ProbeStep},
    query::{Answer, Query, QueryHandle, QueryKind, QueryListener, QueryTarget},
    service::{Service, ServiceHandle, TxtProperties, TxtProvider},
    transport::{NetIf, NetIfState, Transport, MDNS_PORT},
};
use flume::{bounded, Receiver, Sender, TrySendError};
use std::{
    cmp,
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

/// Capacity of a [Host::monitor] channel.
const MONITOR_CHANNEL_SIZE: usize = 100;

/// Notable events of a host, see [Host::monitor].
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum HostEvent {
    /// All announcements of a host or service name were sent.
    Announced(Domain),

    /// Probing a name failed because someone else uses it.
    ProbeFailed(Domain),

    /// A name was changed to resolve a conflict.
    NameChanged { old: Domain, new: Domain },
}

/// An mDNS responder and resolver attached to one network interface.
///
/// Nothing happens in the background: call [Host::update] (or
/// [Host::update_at]) whenever a datagram may be pending or a deadline
/// from [Host::next_deadline] has passed.
pub struct Host<T: Transport, N: NetIf> {
    transport: T,
    netif: N,
    config: HostConfig,
    rng: fastrand::Rng,

    /// Host name without `.local`, may be empty.
    hostname: String,

    /// `<hostname>.local`, empty while `hostname` is empty.
    host_domain: Domain,
    default_instance: Option<String>,

    probe: Probe,
    probe_listener: Option<Box<dyn ProbeListener>>,

    services: Vec<Service>,
    queries: Vec<Query>,
    next_handle: u32,

    netif_state: NetIfState,
    monitors: Vec<Sender<HostEvent>>,

    /// Time of the latest poll.
    now: Instant,
    closed: bool,
}

impl<T: Transport, N: NetIf> Host<T, N> {
    /// Creates a host with the default configuration.
    ///
    /// `hostname` may be given with or without `.local`, or empty to set it later.
    pub fn new(transport: T, netif: N, hostname: &str) -> Result<Self> {
        Self::with_config(transport, netif, hostname, HostConfig::default())
    }

    pub fn with_config(transport: T, netif: N, hostname: &str, config: HostConfig) -> Result<Self> {
        let rng = match config.seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        let mut host = Self {
            transport,
            netif,
            config,
            rng,
            hostname: String::new(),
            host_domain: Domain::new(),
            default_instance: None,
            probe: Probe::new(),
            probe_listener: None,
            services: Vec::new(),
            queries: Vec::new(),
            next_handle: 1,
            netif_state: NetIfState::default(),
            monitors: Vec::new(),
            now: Instant::now(),
            closed: false,
        };
        host.set_hostname(hostname)?;
        Ok(host)
    }

    /// Sends goodbye records for everything announced, and stops all activity.
    ///
    /// Dropping the host closes it as well.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut out = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
        for i in 0..self.services.len() {
            if self.services[i].probe.announced() {
                self.add_service_goodbyes(i, true, &mut out);
            }
        }
        if self.probe.announced() {
            for record in self.host_records(0).into_iter().chain(self.reverse_records(0)) {
                out.add_answer_record(record);
            }
        }
        if !out.is_empty() {
            debug!("close: sending {} goodbye records", out.answers().len());
            send_outgoing(&mut self.transport, &out, None);
        }

        self.services.clear();
        self.queries.clear();
    }

    /// Returns a channel receiver for [HostEvent]s.
    ///
    /// The caller can call `.recv_async().await` on it with the `async` feature.
    pub fn monitor(&mut self) -> Receiver<HostEvent> {
        let (sender, receiver) = bounded(MONITOR_CHANNEL_SIZE);
        self.monitors.push(sender);
        receiver
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Access to the transport, e.g. to wait on its sockets.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// The host name without `.local`.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn host_domain(&self) -> &Domain {
        &self.host_domain
    }

    pub fn status(&self) -> ProbeStatus {
        self.probe.status()
    }

    /// Changes the host name. Everything is probed again.
    pub fn set_hostname(&mut self, hostname: &str) -> Result<()> {
        let hostname = hostname.strip_suffix('.').unwrap_or(hostname);
        let hostname = hostname.strip_suffix(".local").unwrap_or(hostname);
        let host_domain = if hostname.is_empty() {
            Domain::new()
        } else {
            Domain::for_host(hostname)?
        };

        debug!("hostname set to '{}'", hostname);
        self.hostname = hostname.to_string();
        self.host_domain = host_domain;
        self.probe.restart();
        self.follow_default_name();
        Ok(())
    }

    /// Renames `foo` to `foo-2`, `foo-2` to `foo-3` and so on.
    pub fn index_hostname(&mut self) -> Result<()> {
        let new_name = hostname_change(&self.hostname);
        self.set_hostname(&new_name)
    }

    /// Instance name for services added without one. Defaults to the host name.
    pub fn set_default_instance_name(&mut self, name: Option<&str>) {
        self.default_instance = name.map(str::to_string);
        self.follow_default_name();
    }

    pub fn set_probe_listener(&mut self, listener: impl ProbeListener + 'static) {
        self.probe_listener = Some(Box::new(listener));
    }

    fn default_name(&self) -> String {
        match &self.default_instance {
            Some(name) => name.clone(),
            None => self.hostname.clone(),
        }
    }

    /// Renames services that follow the default instance name.
    fn follow_default_name(&mut self) {
        let name = self.default_name();
        for service in self.services.iter_mut().filter(|s| s.auto_named) {
            if service.instance() != name {
                if let Err(e) = service.rename(&name) {
                    debug!("cannot rename {}: {}", service.fullname(), e);
                }
            }
        }
    }

    fn new_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    /// Adds a service. `instance` defaults to the default instance name.
    ///
    /// `service` and `proto` are labels like "http" and "tcp", with or without
    /// the leading underscore.
    pub fn add_service(
        &mut self,
        instance: Option<&str>,
        service: &str,
        proto: &str,
        port: u16,
    ) -> Result<ServiceHandle> {
        if self.services.len() >= self.config.max_services {
            return Err(Error::LimitExceeded(format!(
                "max {} services",
                self.config.max_services
            )));
        }

        let (name, auto_named) = match instance {
            Some(name) => (name.to_string(), false),
            None => (self.default_name(), true),
        };
        if self.find_service(&name, service, proto).is_some() {
            return Err(e_fmt!(
                "service {}._{}._{} already exists",
                name,
                service.trim_start_matches('_'),
                proto.trim_start_matches('_')
            ));
        }

        let handle = ServiceHandle(self.new_handle());
        let service = Service::new(handle, &name, auto_named, service, proto, port)?;
        debug!("add service {}", service.fullname());
        self.services.push(service);
        Ok(handle)
    }

    /// Removes a service. Goodbye records are sent if it was announced.
    ///
    /// Returns false if the handle is unknown.
    pub fn remove_service(&mut self, handle: ServiceHandle) -> bool {
        let index = match self.services.iter().position(|s| s.handle == handle) {
            Some(index) => index,
            None => return false,
        };

        if self.services[index].probe.announced() {
            let ty_domain = self.services[index].ty_domain();
            let type_still_announced = self
                .services
                .iter()
                .any(|s| s.handle != handle && s.probe.announced() && s.ty_domain() == ty_domain);

            let mut out = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
            self.add_service_goodbyes(index, !type_still_announced, &mut out);
            send_outgoing(&mut self.transport, &out, None);
        }

        let service = self.services.remove(index);
        debug!("removed service {}", service.fullname());
        true
    }

    /// Adds TTL 0 records of service `index` to `out`. The meta PTR is
    /// included if `meta` is set.
    fn add_service_goodbyes(&mut self, index: usize, meta: bool, out: &mut DnsOutgoing) {
        let max_txt = self.config.max_txt_len;
        let service = &mut self.services[index];
        out.add_answer_record(service.ptr_record(0));
        out.add_answer_record(service.srv_record(&self.host_domain, 0));
        out.add_answer_record(service.txt_record_once(0, max_txt));
        if meta {
            out.add_answer_record(service.meta_ptr_record(0));
        }
    }

    /// Finds a service by its names. Case is ignored.
    pub fn find_service(
        &self,
        instance: &str,
        service: &str,
        proto: &str,
    ) -> Option<ServiceHandle> {
        self.services
            .iter()
            .find(|s| s.is(instance, service, proto))
            .map(|s| s.handle)
    }

    fn service_mut(&mut self, handle: ServiceHandle) -> Result<&mut Service> {
        self.services
            .iter_mut()
            .find(|s| s.handle == handle)
            .ok_or_else(|| e_fmt!("unknown service {:?}", handle))
    }

    fn service_ref(&self, handle: ServiceHandle) -> Option<&Service> {
        self.services.iter().find(|s| s.handle == handle)
    }

    /// The full instance name, e.g. `MyDevice._http._tcp.local`.
    pub fn service_fullname(&self, handle: ServiceHandle) -> Option<&Domain> {
        self.service_ref(handle).map(Service::fullname)
    }

    pub fn service_status(&self, handle: ServiceHandle) -> Option<ProbeStatus> {
        self.service_ref(handle).map(|s| s.probe.status())
    }

    pub fn service_txt(&self, handle: ServiceHandle) -> Option<&TxtProperties> {
        self.service_ref(handle).map(|s| &s.txts)
    }

    /// Sets an explicit instance name. The service no longer follows the default name.
    pub fn set_service_name(&mut self, handle: ServiceHandle, instance: &str) -> Result<()> {
        let service = self.service_mut(handle)?;
        service.rename(instance)?;
        service.auto_named = false;
        Ok(())
    }

    pub fn set_service_port(&mut self, handle: ServiceHandle, port: u16) -> Result<()> {
        let service = self.service_mut(handle)?;
        if service.port != port {
            service.port = port;
            service.probe.restart();
        }
        Ok(())
    }

    /// Adds or updates a static TXT entry. `val` of `None` adds a boolean attribute.
    pub fn add_service_txt(
        &mut self,
        handle: ServiceHandle,
        key: &str,
        val: Option<&str>,
    ) -> Result<()> {
        let max_txt = self.config.max_txt_len;
        let service = self.service_mut(handle)?;
        service
            .txts
            .set(key, val.map(str::as_bytes), false, max_txt)?;
        service.probe.restart();
        Ok(())
    }

    /// Removes a static TXT entry. Returns whether it existed.
    pub fn remove_service_txt(&mut self, handle: ServiceHandle, key: &str) -> Result<bool> {
        let service = self.service_mut(handle)?;
        let removed = service.txts.remove(key);
        if removed {
            service.probe.restart();
        }
        Ok(removed)
    }

    /// Sets the callback that adds temporary TXT entries before each send.
    pub fn set_service_txt_provider(
        &mut self,
        handle: ServiceHandle,
        provider: impl TxtProvider + 'static,
    ) -> Result<()> {
        self.service_mut(handle)?.txt_provider = Some(Box::new(provider));
        Ok(())
    }

    pub fn set_service_probe_listener(
        &mut self,
        handle: ServiceHandle,
        listener: impl ProbeListener + 'static,
    ) -> Result<()> {
        self.service_mut(handle)?.probe_listener = Some(Box::new(listener));
        Ok(())
    }

    fn add_query(&mut self, target: QueryTarget, kind: QueryKind) -> Result<QueryHandle> {
        if self.queries.len() >= self.config.max_queries {
            return Err(Error::LimitExceeded(format!(
                "max {} queries",
                self.config.max_queries
            )));
        }
        let handle = QueryHandle(self.new_handle());
        debug!("add query {:?} for {:?}", handle, target);
        self.queries.push(Query::new(handle, target, kind, self.now));
        Ok(handle)
    }

    /// Looks for instances of a service type for `timeout`.
    ///
    /// Read the result with [Host::query_answers] once [Host::query_complete]
    /// says so, then remove the query.
    pub fn query_service(
        &mut self,
        service: &str,
        proto: &str,
        timeout: Duration,
    ) -> Result<QueryHandle> {
        let target = QueryTarget::Service(Domain::for_service_type(service, proto)?);
        let kind = QueryKind::Static {
            timeout,
            deadline: None,
        };
        self.add_query(target, kind)
    }

    /// Looks for the addresses of `hostname` for `timeout`.
    pub fn query_host(&mut self, hostname: &str, timeout: Duration) -> Result<QueryHandle> {
        let target = QueryTarget::Host(Domain::for_host(hostname)?);
        let kind = QueryKind::Static {
            timeout,
            deadline: None,
        };
        self.add_query(target, kind)
    }

    /// Watches instances of a service type until the query is removed.
    pub fn install_service_query(
        &mut self,
        service: &str,
        proto: &str,
        listener: impl QueryListener + 'static,
    ) -> Result<QueryHandle> {
        let target = QueryTarget::Service(Domain::for_service_type(service, proto)?);
        let listener = Box::new(listener);
        self.add_query(target, QueryKind::Dynamic { listener })
    }

    /// Watches the addresses of `hostname` until the query is removed.
    pub fn install_host_query(
        &mut self,
        hostname: &str,
        listener: impl QueryListener + 'static,
    ) -> Result<QueryHandle> {
        let target = QueryTarget::Host(Domain::for_host(hostname)?);
        let listener = Box::new(listener);
        self.add_query(target, QueryKind::Dynamic { listener })
    }

    /// Removes a query. Its listener is not called anymore.
    pub fn remove_query(&mut self, handle: QueryHandle) -> bool {
        let before = self.queries.len();
        self.queries.retain(|q| q.handle != handle);
        self.queries.len() != before
    }

    pub fn query_answers(&self, handle: QueryHandle) -> Option<&[Answer]> {
        self.queries
            .iter()
            .find(|q| q.handle == handle)
            .map(Query::answers)
    }

    /// Whether a static query reached its deadline at the latest poll.
    pub fn query_complete(&self, handle: QueryHandle) -> Option<bool> {
        self.queries
            .iter()
            .find(|q| q.handle == handle)
            .map(|q| q.is_static() && q.is_complete(self.now))
    }

    /// Re-sends the announcements of all names that are done, without
    /// changing any state.
    pub fn announce(&mut self) {
        if self.closed {
            return;
        }
        if self.probe.is_done() {
            self.send_host_announce();
        }
        for i in 0..self.services.len() {
            if self.services[i].probe.is_done() {
                self.send_service_announce(i);
            }
        }
    }

    /// Probes and announces everything again.
    pub fn restart(&mut self) {
        debug!("restart probing");
        self.probe.restart();
        for service in self.services.iter_mut() {
            service.probe.restart();
        }
    }

    /// The earliest time [Host::update_at] has timed work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.closed {
            return None;
        }
        let probes = std::iter::once(&self.probe).chain(self.services.iter().map(|s| &s.probe));
        let mut deadline: Option<Instant> = None;
        for probe in probes {
            let next = match probe.status() {
                ProbeStatus::ReadyToStart => Some(self.now),
                _ => probe.next_deadline(),
            };
            deadline = min_deadline(deadline, next);
        }
        for query in self.queries.iter() {
            deadline = min_deadline(deadline, query.next_deadline());
        }
        deadline
    }

    /// Polls with the current time.
    pub fn update(&mut self) {
        self.update_at(Instant::now());
    }

    /// Processes pending datagrams and runs all timers against `now`.
    pub fn update_at(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        self.now = now;

        let state = self.netif.state();
        if state != self.netif_state {
            debug!("interface state {:?} -> {:?}", self.netif_state, state);
            let addr_changed =
                state.ipv4 != self.netif_state.ipv4 || state.ipv6 != self.netif_state.ipv6;
            self.netif_state = state;
            if addr_changed {
                self.restart();
            }
        }
        if !state.up {
            return;
        }

        self.receive_all(now);
        self.update_probes(now);
        self.update_queries(now);
    }

    fn receive_all(&mut self, now: Instant) {
        let mut buf = vec![0u8; MAX_MSG_ABSOLUTE];
        loop {
            let (len, src) = match self.transport.recv(&mut buf) {
                Ok(Some(received)) => received,
                Ok(None) => break,
                Err(e) => {
                    debug!("receive failed: {}", e);
                    break;
                }
            };

            let msg = match DnsIncoming::new(buf[..len].to_vec()) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("Invalid incoming DNS message from {}: {}", src, e);
                    continue;
                }
            };

            trace!(
                "received {} bytes from {}: {} questions {} answers",
                len,
                src,
                msg.questions().len(),
                msg.answers().len()
            );

            if msg.is_query() {
                self.handle_query(&msg, src);
            } else {
                self.handle_response(&msg, now);
            }
        }
    }

    /// Our A and AAAA records, cache-flush set.
    fn host_records(&self, ttl: u32) -> Vec<DnsRecord> {
        let mut records = Vec::new();
        if self.host_domain.is_empty() {
            return records;
        }
        let class = CLASS_IN | CLASS_CACHE_FLUSH;
        if let Some(ipv4) = self.netif_state.ipv4 {
            records.push(DnsRecord::new_address(
                self.host_domain.clone(),
                class,
                ttl,
                IpAddr::V4(ipv4),
            ));
        }
        if let Some(ipv6) = self.netif_state.ipv6 {
            records.push(DnsRecord::new_address(
                self.host_domain.clone(),
                class,
                ttl,
                IpAddr::V6(ipv6),
            ));
        }
        records
    }

    /// PTR records from the reverse names of our addresses to the host name.
    fn reverse_records(&self, ttl: u32) -> Vec<DnsRecord> {
        let class = CLASS_IN | CLASS_CACHE_FLUSH;
        let v4 = self.netif_state.ipv4.map(Domain::reverse_ipv4);
        let v6 = self.netif_state.ipv6.map(Domain::reverse_ipv6);
        v4.into_iter()
            .chain(v6)
            .map(|name| DnsRecord::new_ptr(name, class, ttl, self.host_domain.clone()))
            .collect()
    }

    /// NSEC record telling which address types the host has.
    ///
    /// See [RFC 6762 section 6.1](https://datatracker.ietf.org/doc/html/rfc6762#section-6.1)
    fn host_nsec(&self, ttl: u32) -> DnsRecord {
        let mut types = Vec::new();
        if self.netif_state.ipv4.is_some() {
            types.push(RRType::A);
        }
        if self.netif_state.ipv6.is_some() {
            types.push(RRType::AAAA);
        }
        DnsRecord::new_nsec(
            self.host_domain.clone(),
            CLASS_IN | CLASS_CACHE_FLUSH,
            ttl,
            &types,
        )
    }

    fn host_ready(&self) -> bool {
        !self.host_domain.is_empty()
            && (self.netif_state.ipv4.is_some() || self.netif_state.ipv6.is_some())
    }

    fn update_probes(&mut self, now: Instant) {
        let ready = self.host_ready();
        self.probe.set_ready(ready);
        loop {
            match self.probe.step(now, &self.config, &mut self.rng) {
                ProbeStep::Idle => break,
                ProbeStep::SendProbe => {
                    let mut out = DnsOutgoing::new(FLAGS_QR_QUERY);
                    out.add_question_raw(&self.host_domain, RRType::ANY as u16, true);
                    for record in self.host_records(self.config.host_ttl) {
                        out.add_authority(record);
                    }
                    debug!("probing host {}", self.host_domain);
                    send_outgoing(&mut self.transport, &out, None);
                }
                ProbeStep::Succeeded => {
                    debug!("host {} probed", self.host_domain);
                    if let Some(listener) = self.probe_listener.as_mut() {
                        listener.probe_result(&self.host_domain, true);
                    }
                }
                ProbeStep::Failed => self.host_probe_failed(now),
                ProbeStep::SendAnnounce => {
                    self.send_host_announce();
                    if self.probe.is_done() {
                        let event = HostEvent::Announced(self.host_domain.clone());
                        notify_monitors(&mut self.monitors, event);
                    }
                }
            }
        }

        let host_probed = self.probe.is_probed();
        for i in 0..self.services.len() {
            let ready = host_probed && !self.services[i].fullname().is_empty();
            self.services[i].probe.set_ready(ready);
            loop {
                match self.services[i].probe.step(now, &self.config, &mut self.rng) {
                    ProbeStep::Idle => break,
                    ProbeStep::SendProbe => self.send_service_probe(i),
                    ProbeStep::Succeeded => {
                        let service = &mut self.services[i];
                        let fullname = service.fullname().clone();
                        debug!("service {} probed", fullname);
                        if let Some(listener) = service.probe_listener.as_mut() {
                            listener.probe_result(&fullname, true);
                        }
                    }
                    ProbeStep::Failed => self.service_probe_failed(i, now),
                    ProbeStep::SendAnnounce => {
                        self.send_service_announce(i);
                        if self.services[i].probe.is_done() {
                            let event = HostEvent::Announced(self.services[i].fullname().clone());
                            notify_monitors(&mut self.monitors, event);
                        }
                    }
                }
            }
        }
    }

    fn host_probe_failed(&mut self, now: Instant) {
        let old = self.host_domain.clone();
        debug!("probing host {} failed", old);
        notify_monitors(&mut self.monitors, HostEvent::ProbeFailed(old.clone()));

        let proposed = match self.probe_listener.as_mut() {
            Some(listener) => listener.probe_result(&old, false),
            None => None,
        };
        let fallback = hostname_change(&self.hostname);
        let applied = match proposed {
            Some(name) => self.set_hostname(&name).or_else(|e| {
                debug!("hostname '{}' rejected: {}", name, e);
                self.set_hostname(&fallback)
            }),
            None => self.set_hostname(&fallback),
        };
        if let Err(e) = applied {
            debug!("cannot rename host {}: {}", old, e);
        }

        self.probe.defer(now, self.config.probe_defer);
        let new = self.host_domain.clone();
        notify_monitors(&mut self.monitors, HostEvent::NameChanged { old, new });
    }

    fn service_probe_failed(&mut self, index: usize, now: Instant) {
        let service = &mut self.services[index];
        let old = service.fullname().clone();
        debug!("probing service {} failed", old);
        notify_monitors(&mut self.monitors, HostEvent::ProbeFailed(old.clone()));

        let proposed = match service.probe_listener.as_mut() {
            Some(listener) => listener.probe_result(&old, false),
            None => None,
        };
        let fallback = name_change(service.instance());
        let renamed = match proposed {
            Some(name) => service.rename(&name).or_else(|e| {
                debug!("instance name '{}' rejected: {}", name, e);
                service.rename(&fallback)
            }),
            None => service.rename(&fallback),
        };
        if let Err(e) = renamed {
            debug!("cannot rename service {}: {}", old, e);
        }
        service.auto_named = false;

        service.probe.defer(now, self.config.probe_defer);
        let new = service.fullname().clone();
        notify_monitors(&mut self.monitors, HostEvent::NameChanged { old, new });
    }

    fn send_host_announce(&mut self) {
        let ttl = self.config.host_ttl;
        let mut out = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
        for record in self.host_records(ttl) {
            out.add_answer_record(record);
        }
        for record in self.reverse_records(ttl) {
            out.add_answer_record(record);
        }
        debug!("announce host {}", self.host_domain);
        send_outgoing(&mut self.transport, &out, None);
    }

    fn send_service_probe(&mut self, index: usize) {
        let host_ttl = self.config.host_ttl;
        let max_txt = self.config.max_txt_len;
        let service = &mut self.services[index];

        let records = vec![
            service.srv_record(&self.host_domain, host_ttl),
            service.txt_record_once(host_ttl, max_txt),
        ];
        let mut out = DnsOutgoing::new(FLAGS_QR_QUERY);
        out.add_question_raw(service.fullname(), RRType::ANY as u16, true);
        for record in records.iter() {
            out.add_authority(record.clone());
        }
        service.probe.set_records(records);

        debug!("probing service {}", service.fullname());
        send_outgoing(&mut self.transport, &out, None);
    }

    fn send_service_announce(&mut self, index: usize) {
        let host_ttl = self.config.host_ttl;
        let other_ttl = self.config.other_ttl;
        let max_txt = self.config.max_txt_len;
        let addresses = self.host_records(host_ttl);
        let service = &mut self.services[index];

        let mut out = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
        out.add_answer_record(service.ptr_record(other_ttl));
        out.add_answer_record(service.srv_record(&self.host_domain, host_ttl));
        out.add_answer_record(service.txt_record_once(other_ttl, max_txt));
        out.add_answer_record(service.meta_ptr_record(other_ttl));
        for record in addresses {
            out.add_additional_answer(record);
        }

        debug!("announce service {}", service.fullname());
        send_outgoing(&mut self.transport, &out, None);
    }

    /// Checks an incoming probe against the names we are probing.
    ///
    /// RFC 6762 section 8.2: a probe from a peer for the same name, with
    /// proposed records in the authority section, is a simultaneous probe.
    fn check_simultaneous_probe(&mut self, msg: &DnsIncoming) {
        if msg.num_authorities() == 0 {
            return;
        }

        if self.probe.is_probing() {
            let theirs: Vec<DnsRecord> = msg
                .authorities()
                .iter()
                .filter(|r| r.name() == &self.host_domain)
                .cloned()
                .collect();
            if !theirs.is_empty() {
                let ours = self.host_records(self.config.host_ttl);
                if tiebreak(&ours, &theirs) == cmp::Ordering::Less {
                    debug!("host {} lost the probe tiebreak", self.host_domain);
                    self.probe.tiebreak_needed = true;
                }
            }
        }

        // Until our first probe is out there is nothing to compare.
        for service in self.services.iter_mut().filter(|s| s.probe.is_probing()) {
            let ours = service.probe.records();
            if ours.is_empty() {
                continue;
            }
            let theirs: Vec<DnsRecord> = msg
                .authorities()
                .iter()
                .filter(|r| r.name() == service.fullname())
                .cloned()
                .collect();
            if theirs.is_empty() {
                continue;
            }
            if tiebreak(ours, &theirs) == cmp::Ordering::Less {
                debug!("service {} lost the probe tiebreak", service.fullname());
                service.probe.tiebreak_needed = true;
            }
        }
    }

    fn handle_query(&mut self, msg: &DnsIncoming, src: SocketAddr) {
        self.check_simultaneous_probe(msg);

        let mut out = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
        for question in msg.questions() {
            self.answer_question(question, msg, &mut out);
        }
        if out.answers().is_empty() {
            if out.known_answer_count() > 0 {
                trace!("all answers suppressed by known answers");
            }
            return;
        }

        // RFC 6762 section 6.7: a query from a port other than 5353 is a
        // legacy unicast query and gets a conventional unicast response.
        if src.port() != MDNS_PORT {
            let legacy = legacy_response(&out, msg, self.config.legacy_ttl);
            send_outgoing(&mut self.transport, &legacy, Some(src));
            return;
        }

        // RFC 6762 section 5.4: the QU bit asks for a unicast response.
        let unicast = msg.questions().iter().all(DnsQuestion::unicast_response);
        let dest = if unicast { Some(src) } else { None };
        send_outgoing(&mut self.transport, &out, dest);
    }

    /// Adds our answers for `question`, with additional records per RFC 6763 section 12.
    fn answer_question(
        &mut self,
        question: &DnsQuestion,
        msg: &DnsIncoming,
        out: &mut DnsOutgoing,
    ) {
        let host_ttl = self.config.host_ttl;
        let other_ttl = self.config.other_ttl;
        let max_txt = self.config.max_txt_len;
        let name = question.name();

        // Nothing is answered for names still being probed.
        if !self.probe.is_probed() {
            return;
        }

        if name == &self.host_domain {
            self.answer_host_question(question, msg, out);
        }
        if question.wants(RRType::PTR) {
            for record in self.reverse_records(host_ttl) {
                if record.name() == name {
                    out.add_answer(msg, record);
                }
            }
        }

        let addresses = self.host_records(host_ttl);
        let meta = Domain::meta_service();
        for service in self.services.iter_mut().filter(|s| s.probe.is_probed()) {
            if name == &meta && question.wants(RRType::PTR) {
                out.add_answer(msg, service.meta_ptr_record(other_ttl));
            }

            if name == service.ty_domain() && question.wants(RRType::PTR) {
                if out.add_answer(msg, service.ptr_record(other_ttl)) {
                    out.add_additional_answer(service.srv_record(&self.host_domain, host_ttl));
                    out.add_additional_answer(service.txt_record_once(other_ttl, max_txt));
                    for record in addresses.iter() {
                        out.add_additional_answer(record.clone());
                    }
                }
            }

            if name == service.fullname() {
                if question.wants(RRType::SRV)
                    && out.add_answer(msg, service.srv_record(&self.host_domain, host_ttl))
                {
                    for record in addresses.iter() {
                        out.add_additional_answer(record.clone());
                    }
                }
                if question.wants(RRType::TXT) {
                    out.add_answer(msg, service.txt_record_once(other_ttl, max_txt));
                }
            }
        }
    }

    fn answer_host_question(
        &self,
        question: &DnsQuestion,
        msg: &DnsIncoming,
        out: &mut DnsOutgoing,
    ) {
        let host_ttl = self.config.host_ttl;
        let mut answered = false;
        for record in self.host_records(host_ttl) {
            let ty = match record.rr_type() {
                Some(ty) => ty,
                None => continue,
            };
            if question.wants(ty) {
                answered |= out.add_answer(msg, record);
            } else if question.qtype() == RRType::A as u16
                || question.qtype() == RRType::AAAA as u16
            {
                // RFC 6762 section 6.2: answering A, add AAAA and vice versa.
                out.add_additional_answer(record);
            }
        }

        let has_all = self.netif_state.ipv4.is_some() && self.netif_state.ipv6.is_some();
        let asks_address = question.wants(RRType::A) || question.wants(RRType::AAAA);
        if asks_address && !has_all {
            if answered {
                out.add_additional_answer(self.host_nsec(host_ttl));
            } else {
                out.add_answer(msg, self.host_nsec(host_ttl));
            }
        }
    }

    fn handle_response(&mut self, msg: &DnsIncoming, now: Instant) {
        self.check_conflicts(msg);
        for query in self.queries.iter_mut() {
            if !query.is_complete(now) {
                query.process_response(msg, now);
            }
        }
    }

    /// A response with a record for a name we probe, but different data, is a conflict.
    fn check_conflicts(&mut self, msg: &DnsIncoming) {
        if self.probe.is_probing() {
            let ours = self.host_records(self.config.host_ttl);
            if has_conflict(msg, &self.host_domain, &ours) {
                debug!("conflicting response for host {}", self.host_domain);
                self.probe.conflict = true;
            }
        }

        let host_ttl = self.config.host_ttl;
        for service in self.services.iter_mut().filter(|s| s.probe.is_probing()) {
            // Before the first probe only the SRV record is settled.
            let ours = match service.probe.records() {
                [] => vec![service.srv_record(&self.host_domain, host_ttl)],
                sent => sent.to_vec(),
            };
            if has_conflict(msg, service.fullname(), &ours) {
                debug!("conflicting response for service {}", service.fullname());
                service.probe.conflict = true;
            }
        }
    }

    fn update_queries(&mut self, now: Instant) {
        let resend = self.config.query_resend;
        let max_exp = self.config.query_backoff_max_exp;

        let mut refresh = DnsOutgoing::new(FLAGS_QR_QUERY);
        let mut outgoing = Vec::new();
        for query in self.queries.iter_mut() {
            query.start(now);
            if query.send_due(now, resend, max_exp) {
                let mut out = DnsOutgoing::new(FLAGS_QR_QUERY);
                for (name, ty) in query.questions() {
                    out.add_question(&name, ty);
                }
                for known in query.known_answers(now) {
                    out.add_answer_record(known);
                }
                outgoing.push(out);
            }

            if query.is_complete(now) {
                continue;
            }
            for (name, ty) in query.check_cache(now) {
                let duplicate = refresh
                    .questions()
                    .iter()
                    .any(|q| q.name() == &name && q.qtype() == ty as u16);
                if !duplicate {
                    refresh.add_question(&name, ty);
                }
            }
        }
        if !refresh.is_empty() {
            outgoing.push(refresh);
        }

        for out in outgoing.iter() {
            send_outgoing(&mut self.transport, out, None);
        }
    }
}

impl<T: Transport, N: NetIf> Drop for Host<T, N> {
    fn drop(&mut self) {
        self.close();
    }
}

fn min_deadline(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// True if `msg` carries a record for `name` whose type we own with different data.
fn has_conflict(msg: &DnsIncoming, name: &Domain, ours: &[DnsRecord]) -> bool {
    msg.all_records()
        .filter(|r| r.name() == name)
        .any(|theirs| {
            let same_type: Vec<&DnsRecord> =
                ours.iter().filter(|r| r.ty() == theirs.ty()).collect();
            !same_type.is_empty() && !same_type.iter().any(|r| r.rrdata_match(theirs))
        })
}

/// Copies `out` for a legacy unicast query: ID and questions echoed,
/// TTLs capped and no cache-flush bits.
fn legacy_response(out: &DnsOutgoing, msg: &DnsIncoming, ttl_cap: u32) -> DnsOutgoing {
    let mut legacy = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
    legacy.set_id(msg.id());
    for question in msg.questions() {
        legacy.add_question_entry(question.clone());
    }
    let copy = |r: &DnsRecord| {
        DnsRecord::new(
            r.name().clone(),
            r.class(),
            cmp::min(r.ttl(), ttl_cap),
            r.rdata().clone(),
        )
    };
    for record in out.answers() {
        legacy.add_answer_record(copy(record));
    }
    for record in out.additionals() {
        legacy.add_additional_answer(copy(record));
    }
    legacy
}

/// Send an outgoing mDNS query or response, and returns the packet bytes.
fn send_outgoing<T: Transport>(
    transport: &mut T,
    out: &DnsOutgoing,
    dest: Option<SocketAddr>,
) -> Vec<Vec<u8>> {
    let qtype = if out.is_query() { "query" } else { "response" };
    trace!(
        "send outgoing {}: {} questions {} answers {} authorities {} additional",
        qtype,
        out.questions().len(),
        out.answers().len(),
        out.authorities().len(),
        out.additionals().len()
    );
    let packet_list = out.to_data_on_wire();
    for packet in packet_list.iter() {
        let result = match dest {
            Some(addr) => transport.send_unicast(packet, addr),
            None => transport.send_multicast(packet),
        };
        if let Err(e) = result {
            debug!("failed to send {}: {}", qtype, e);
        }
    }
    packet_list
}

fn notify_monitors(monitors: &mut Vec<Sender<HostEvent>>, event: HostEvent) {
    monitors.retain(|sender| {
        if let Err(e) = sender.try_send(event.clone()) {
            debug!("notify_monitors: try_send: {}", &e);
            if matches!(e, TrySendError::Disconnected(_)) {
                return false; // This monitor is dropped.
            }
        }
        true
    });
}
