//! Service and host queries, and the answers they collect.
//!
//! Every part of an [Answer] (service instance, host and port, TXT, each
//! address) carries its own [TtlTracker], so parts expire independently.

#[cfg(feature = "logging")]
use crate::log::{debug, trace};
use crate::{
    dns_parser::{DnsIncoming, DnsRecord, RData, RRType, CLASS_IN},
    domain::Domain,
    service::{decode_txt, TxtProperty},
};
use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
    ops::{BitOr, BitOrAssign},
    time::{Duration, Instant},
};

const LEVEL_BASE: u32 = 80;
const LEVEL_STEP: u32 = 5;
const LEVEL_FINAL: u32 = 100;

/// Grace period for a record that said goodbye with TTL 0.
///
/// RFC 6762 section 10.1: "... they instead record the TTL of the record
/// as one second, and then remove it one second later."
const GOODBYE_DELAY: Duration = Duration::from_secs(1);

/// Stable reference to a query installed on a [`Host`](crate::Host).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryHandle(pub(crate) u32);

/// Tracks when a cached record needs a refresh query, and when it expires.
#[derive(Debug, Clone)]
pub struct TtlTracker {
    /// Advertised TTL in seconds.
    ttl: u32,
    received: Instant,

    /// Percent of TTL the deadline is at; `None` once nothing is pending.
    level: Option<u32>,
    deadline: Instant,
}

impl TtlTracker {
    pub(crate) fn new(ttl: u32, now: Instant) -> Self {
        let mut tracker = Self {
            ttl,
            received: now,
            level: None,
            deadline: now,
        };
        tracker.set(ttl, now);
        tracker
    }

    /// Starts over with a freshly received TTL.
    pub(crate) fn set(&mut self, ttl: u32, now: Instant) {
        if ttl == 0 {
            self.prepare_deletion(now);
            return;
        }
        self.ttl = ttl;
        self.received = now;
        self.level = Some(LEVEL_BASE);
        self.deadline = expiration_time(now, ttl, LEVEL_BASE);
    }

    /// Moves to the next level after a refresh query went out.
    ///
    /// From RFC 6762 section 5.2:
    /// "... The querier should plan to issue a query at 80% of the record
    /// lifetime, and then if no answer is received, at 85%, 90%, and 95%."
    pub(crate) fn restart(&mut self) {
        self.level = match self.level {
            Some(level) if (LEVEL_BASE..LEVEL_FINAL).contains(&level) => {
                let level = level + LEVEL_STEP;
                self.deadline = expiration_time(self.received, self.ttl, level);
                Some(level)
            }
            _ => None,
        };
    }

    /// Moves past every level whose deadline `now` has reached, so a late
    /// poll sends one refresh instead of one per missed level.
    pub(crate) fn catch_up(&mut self, now: Instant) {
        while self.flagged(now) && !self.final_level() {
            self.restart();
        }
    }

    /// True once the whole lifetime has passed.
    pub(crate) fn expired(&self, now: Instant) -> bool {
        self.level.is_some() && now >= self.expires_at()
    }

    fn expires_at(&self) -> Instant {
        if self.final_level() {
            self.deadline
        } else {
            expiration_time(self.received, self.ttl, LEVEL_FINAL)
        }
    }

    /// Schedules the deletion one second from `now`.
    pub(crate) fn prepare_deletion(&mut self, now: Instant) {
        self.level = Some(LEVEL_FINAL);
        self.deadline = now + GOODBYE_DELAY;
    }

    /// True if the deadline of the current level has passed.
    pub(crate) fn flagged(&self, now: Instant) -> bool {
        self.level.is_some() && now >= self.deadline
    }

    /// True if the current deadline is the expiry itself.
    pub(crate) fn final_level(&self) -> bool {
        self.level == Some(LEVEL_FINAL)
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    /// Remaining lifetime in whole seconds.
    pub fn remaining_ttl(&self, now: Instant) -> u32 {
        self.expires_at().saturating_duration_since(now).as_secs() as u32
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.level.map(|_| self.deadline)
    }
}

/// Returns the time at which a record received at `received` will have
/// expired by a certain percentage.
fn expiration_time(received: Instant, ttl: u32, percent: u32) -> Instant {
    // 'ttl' is in seconds, hence:
    // ttl * 1000 * (percent / 100) => ttl * percent * 10
    received + Duration::from_millis(ttl as u64 * percent as u64 * 10)
}

/// Which parts of an [Answer] changed.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct AnswerFlags(u8);

impl AnswerFlags {
    pub const SERVICE_DOMAIN: Self = Self(0x01);
    pub const HOST_DOMAIN: Self = Self(0x02);
    pub const PORT: Self = Self(0x04);
    pub const TXTS: Self = Self(0x08);
    pub const IPV4: Self = Self(0x10);
    pub const IPV6: Self = Self(0x20);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AnswerFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for AnswerFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for AnswerFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::SERVICE_DOMAIN, "SERVICE_DOMAIN"),
            (Self::HOST_DOMAIN, "HOST_DOMAIN"),
            (Self::PORT, "PORT"),
            (Self::TXTS, "TXTS"),
            (Self::IPV4, "IPV4"),
            (Self::IPV6, "IPV6"),
        ];
        let set: Vec<_> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "AnswerFlags({})", set.join(" | "))
    }
}

/// A cached value with its own TTL tracker.
#[derive(Debug, Clone)]
struct Component<T> {
    value: T,
    ttl: TtlTracker,
}

impl<T> Component<T> {
    fn new(value: T, ttl: u32, now: Instant) -> Self {
        Self {
            value,
            ttl: TtlTracker::new(ttl, now),
        }
    }
}

/// What a query has learned about one service instance or host.
#[derive(Debug, Clone, Default)]
pub struct Answer {
    service: Option<Component<Domain>>,
    host: Option<Component<(Domain, u16)>>,
    txt: Option<Component<Vec<u8>>>,
    ipv4: Vec<Component<Ipv4Addr>>,
    ipv6: Vec<Component<Ipv6Addr>>,
}

impl Answer {
    /// The service instance name, e.g. `MyDevice._http._tcp.local`.
    pub fn service_domain(&self) -> Option<&Domain> {
        self.service.as_ref().map(|c| &c.value)
    }

    /// The host that runs the service, or the queried host.
    pub fn host_domain(&self) -> Option<&Domain> {
        self.host.as_ref().map(|c| &c.value.0)
    }

    /// The service port; 0 for host queries.
    pub fn port(&self) -> u16 {
        self.host.as_ref().map_or(0, |c| c.value.1)
    }

    /// Raw TXT data.
    pub fn txt(&self) -> Option<&[u8]> {
        self.txt.as_ref().map(|c| c.value.as_slice())
    }

    pub fn txt_properties(&self) -> Vec<TxtProperty> {
        self.txt().map(decode_txt).unwrap_or_default()
    }

    pub fn ipv4(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.ipv4.iter().map(|c| c.value)
    }

    pub fn ipv6(&self) -> impl Iterator<Item = Ipv6Addr> + '_ {
        self.ipv6.iter().map(|c| c.value)
    }

    /// Earliest pending TTL deadline of any part.
    fn next_deadline(&self) -> Option<Instant> {
        let service = self.service.as_ref().map(|c| &c.ttl);
        let host = self.host.as_ref().map(|c| &c.ttl);
        let txt = self.txt.as_ref().map(|c| &c.ttl);
        service
            .into_iter()
            .chain(host)
            .chain(txt)
            .chain(self.ipv4.iter().map(|c| &c.ttl))
            .chain(self.ipv6.iter().map(|c| &c.ttl))
            .filter_map(TtlTracker::deadline)
            .min()
    }

    fn add_ipv4(&mut self, addr: Ipv4Addr, ttl: u32, now: Instant) -> AnswerFlags {
        match self.ipv4.iter_mut().find(|c| c.value == addr) {
            Some(c) => {
                c.ttl.set(ttl, now);
                AnswerFlags::default()
            }
            None if ttl > 0 => {
                self.ipv4.push(Component::new(addr, ttl, now));
                AnswerFlags::IPV4
            }
            None => AnswerFlags::default(),
        }
    }

    fn add_ipv6(&mut self, addr: Ipv6Addr, ttl: u32, now: Instant) -> AnswerFlags {
        match self.ipv6.iter_mut().find(|c| c.value == addr) {
            Some(c) => {
                c.ttl.set(ttl, now);
                AnswerFlags::default()
            }
            None if ttl > 0 => {
                self.ipv6.push(Component::new(addr, ttl, now));
                AnswerFlags::IPV6
            }
            None => AnswerFlags::default(),
        }
    }
}

/// What a query looks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryTarget {
    /// Instances of a service type, e.g. `_http._tcp.local`.
    Service(Domain),

    /// Addresses of a host, e.g. `peer.local`.
    Host(Domain),
}

impl QueryTarget {
    pub fn domain(&self) -> &Domain {
        match self {
            QueryTarget::Service(domain) | QueryTarget::Host(domain) => domain,
        }
    }
}

/// Receives answer changes of a dynamic query.
///
/// `set` is true when the parts in `flags` were added or changed, and false
/// when they expired or said goodbye.
pub trait QueryListener {
    fn query_answer(&mut self, query: QueryHandle, answer: &Answer, flags: AnswerFlags, set: bool);
}

impl<F> QueryListener for F
where
    F: FnMut(QueryHandle, &Answer, AnswerFlags, bool),
{
    fn query_answer(&mut self, query: QueryHandle, answer: &Answer, flags: AnswerFlags, set: bool) {
        self(query, answer, flags, set)
    }
}

/// A change of a query answer, for listeners that are channels.
#[derive(Debug, Clone)]
pub struct QueryEvent {
    pub query: QueryHandle,
    pub answer: Answer,
    pub flags: AnswerFlags,
    pub set: bool,
}

impl QueryListener for flume::Sender<QueryEvent> {
    fn query_answer(&mut self, query: QueryHandle, answer: &Answer, flags: AnswerFlags, set: bool) {
        let event = QueryEvent {
            query,
            answer: answer.clone(),
            flags,
            set,
        };
        if let Err(e) = self.try_send(event) {
            debug!("failed to send query event: {}", e);
        }
    }
}

pub(crate) enum QueryKind {
    /// Collects answers for `timeout`, counted from the first poll.
    Static {
        timeout: Duration,
        deadline: Option<Instant>,
    },
    Dynamic { listener: Box<dyn QueryListener> },
}

pub(crate) struct Query {
    pub(crate) handle: QueryHandle,
    pub(crate) target: QueryTarget,
    kind: QueryKind,
    answers: Vec<Answer>,
    sent: u32,
    next_send: Instant,
}

impl Query {
    pub(crate) fn new(
        handle: QueryHandle,
        target: QueryTarget,
        kind: QueryKind,
        now: Instant,
    ) -> Self {
        Self {
            handle,
            target,
            kind,
            answers: Vec::new(),
            sent: 0,
            next_send: now,
        }
    }

    pub(crate) fn answers(&self) -> &[Answer] {
        &self.answers
    }

    pub(crate) fn is_static(&self) -> bool {
        matches!(self.kind, QueryKind::Static { .. })
    }

    /// A static query is complete once its deadline passed.
    pub(crate) fn is_complete(&self, now: Instant) -> bool {
        match self.kind {
            QueryKind::Static {
                deadline: Some(deadline),
                ..
            } => now >= deadline,
            _ => false,
        }
    }

    /// Fixes the deadline of a static query at the first poll that sees it.
    pub(crate) fn start(&mut self, now: Instant) {
        if let QueryKind::Static { timeout, deadline } = &mut self.kind {
            if deadline.is_none() {
                *deadline = Some(now + *timeout);
                self.next_send = now;
            }
        }
    }

    /// Returns true if the question should be (re)sent now, and schedules the next one.
    ///
    /// The resend delay doubles each time, capped at `base << max_exp`.
    pub(crate) fn send_due(&mut self, now: Instant, base: Duration, max_exp: u32) -> bool {
        if self.is_complete(now) || now < self.next_send {
            return false;
        }
        self.sent += 1;
        let exp = (self.sent - 1).min(max_exp);
        self.next_send = now + base * (1u32 << exp);
        true
    }

    /// The questions this query asks.
    pub(crate) fn questions(&self) -> Vec<(Domain, RRType)> {
        match &self.target {
            QueryTarget::Service(ty_domain) => vec![(ty_domain.clone(), RRType::PTR)],
            QueryTarget::Host(host) => {
                vec![(host.clone(), RRType::A), (host.clone(), RRType::AAAA)]
            }
        }
    }

    /// PTR records we already know, for known-answer suppression.
    ///
    /// RFC 6762 section 7.1: only records with more than half their TTL left.
    pub(crate) fn known_answers(&self, now: Instant) -> Vec<DnsRecord> {
        let ty_domain = match &self.target {
            QueryTarget::Service(ty_domain) => ty_domain,
            QueryTarget::Host(_) => return Vec::new(),
        };

        self.answers
            .iter()
            .filter_map(|a| a.service.as_ref())
            .filter_map(|c| {
                let remaining = c.ttl.remaining_ttl(now);
                if remaining > c.ttl.ttl() / 2 {
                    Some(DnsRecord::new_ptr(
                        ty_domain.clone(),
                        CLASS_IN,
                        remaining,
                        c.value.clone(),
                    ))
                } else {
                    None
                }
            })
            .collect()
    }

    fn notify(&mut self, index: usize, flags: AnswerFlags, set: bool) {
        if flags.is_empty() {
            return;
        }
        if let QueryKind::Dynamic { listener } = &mut self.kind {
            if let Some(answer) = self.answers.get(index) {
                listener.query_answer(self.handle, answer, flags, set);
            }
        }
    }

    /// Folds the records of a response into the answers and notifies the listener.
    ///
    /// Records are taken in the order PTR, SRV and TXT, A and AAAA, so a
    /// complete response merges into one answer.
    pub(crate) fn process_response(&mut self, msg: &DnsIncoming, now: Instant) {
        let mut changes: Vec<AnswerFlags> = vec![AnswerFlags::default(); self.answers.len()];

        for record in msg.all_records().filter(|r| r.ty() == RRType::PTR as u16) {
            self.process_ptr(record, now, &mut changes);
        }
        for record in msg
            .all_records()
            .filter(|r| r.ty() == RRType::SRV as u16 || r.ty() == RRType::TXT as u16)
        {
            self.process_srv_txt(record, now, &mut changes);
        }
        for record in msg
            .all_records()
            .filter(|r| r.ty() == RRType::A as u16 || r.ty() == RRType::AAAA as u16)
        {
            self.process_address(record, now, &mut changes);
        }

        for (index, flags) in changes.into_iter().enumerate() {
            self.notify(index, flags, true);
        }
    }

    fn process_ptr(&mut self, record: &DnsRecord, now: Instant, changes: &mut Vec<AnswerFlags>) {
        let instance = match (&self.target, record.rdata()) {
            (QueryTarget::Service(ty_domain), RData::Ptr(instance))
                if record.name() == ty_domain =>
            {
                instance
            }
            _ => return,
        };

        let existing = self
            .answers
            .iter_mut()
            .filter_map(|a| a.service.as_mut())
            .find(|c| &c.value == instance);
        match existing {
            Some(service) => service.ttl.set(record.ttl(), now),
            None if record.ttl() > 0 => {
                trace!("query {:?}: new instance {}", self.handle, instance);
                self.answers.push(Answer {
                    service: Some(Component::new(instance.clone(), record.ttl(), now)),
                    ..Answer::default()
                });
                changes.push(AnswerFlags::SERVICE_DOMAIN);
            }
            None => {}
        }
    }

    fn process_srv_txt(&mut self, record: &DnsRecord, now: Instant, changes: &mut [AnswerFlags]) {
        if !matches!(self.target, QueryTarget::Service(_)) {
            return;
        }
        let index = match self
            .answers
            .iter()
            .position(|a| a.service_domain() == Some(record.name()))
        {
            Some(index) => index,
            None => return,
        };
        let answer = &mut self.answers[index];
        let ttl = record.ttl();

        match record.rdata() {
            RData::Srv { port, target, .. } => {
                let same = answer
                    .host
                    .as_ref()
                    .map_or(false, |h| h.value.0 == *target && h.value.1 == *port);
                if same {
                    if let Some(host) = answer.host.as_mut() {
                        host.ttl.set(ttl, now);
                    }
                } else if ttl > 0 {
                    // A new host invalidates addresses learned for the old one.
                    answer.ipv4.clear();
                    answer.ipv6.clear();
                    answer.host = Some(Component::new((target.clone(), *port), ttl, now));
                    changes[index] |= AnswerFlags::HOST_DOMAIN | AnswerFlags::PORT;
                }
            }
            RData::Txt(text) => {
                let same = answer.txt.as_ref().map_or(false, |t| &t.value == text);
                if same {
                    if let Some(txt) = answer.txt.as_mut() {
                        txt.ttl.set(ttl, now);
                    }
                } else if ttl > 0 {
                    answer.txt = Some(Component::new(text.clone(), ttl, now));
                    changes[index] |= AnswerFlags::TXTS;
                }
            }
            _ => {}
        }
    }

    fn process_address(
        &mut self,
        record: &DnsRecord,
        now: Instant,
        changes: &mut Vec<AnswerFlags>,
    ) {
        if let QueryTarget::Host(host) = &self.target {
            if record.name() == host
                && record.ttl() > 0
                && !self.answers.iter().any(|a| a.host_domain() == Some(host))
            {
                self.answers.push(Answer {
                    host: Some(Component::new((host.clone(), 0), record.ttl(), now)),
                    ..Answer::default()
                });
                changes.push(AnswerFlags::HOST_DOMAIN);
            }
        }

        let is_host_query = matches!(self.target, QueryTarget::Host(_));
        for (index, answer) in self.answers.iter_mut().enumerate() {
            let host = match answer.host.as_mut() {
                Some(host) if host.value.0 == *record.name() => host,
                _ => continue,
            };
            // The host part of a host query lives as long as its addresses.
            if is_host_query && record.ttl() > 0 {
                host.ttl.set(record.ttl(), now);
            }
            changes[index] |= match record.rdata() {
                RData::A(addr) => answer.add_ipv4(*addr, record.ttl(), now),
                RData::AAAA(addr) => answer.add_ipv6(*addr, record.ttl(), now),
                _ => AnswerFlags::default(),
            };
        }
    }

    /// Runs the TTL trackers: expired parts are deleted and the listener is told,
    /// parts due for refresh are returned as questions to send.
    pub(crate) fn check_cache(&mut self, now: Instant) -> Vec<(Domain, RRType)> {
        let is_service_query = matches!(self.target, QueryTarget::Service(_));
        let mut refresh = Vec::new();
        let mut deleted: Vec<(usize, AnswerFlags)> = Vec::new();
        let mut doomed: Vec<usize> = Vec::new();

        for (index, answer) in self.answers.iter_mut().enumerate() {
            let mut flags = AnswerFlags::default();
            let service_name = answer.service_domain().cloned();
            let host_name = answer.host_domain().cloned();

            let mut refresh_a = false;
            answer.ipv4.retain_mut(|c| match check(&mut c.ttl, now) {
                Check::Keep => true,
                Check::Refresh => {
                    refresh_a = true;
                    true
                }
                Check::Delete => {
                    flags |= AnswerFlags::IPV4;
                    false
                }
            });
            let mut refresh_aaaa = false;
            answer.ipv6.retain_mut(|c| match check(&mut c.ttl, now) {
                Check::Keep => true,
                Check::Refresh => {
                    refresh_aaaa = true;
                    true
                }
                Check::Delete => {
                    flags |= AnswerFlags::IPV6;
                    false
                }
            });
            if let Some(host) = &host_name {
                if refresh_a {
                    refresh.push((host.clone(), RRType::A));
                }
                if refresh_aaaa {
                    refresh.push((host.clone(), RRType::AAAA));
                }
            }

            match answer.txt.as_mut().map(|c| check(&mut c.ttl, now)) {
                Some(Check::Refresh) => {
                    if let Some(name) = &service_name {
                        refresh.push((name.clone(), RRType::TXT));
                    }
                }
                Some(Check::Delete) => {
                    flags |= AnswerFlags::TXTS;
                    answer.txt = None;
                }
                _ => {}
            }

            match answer.host.as_mut().map(|c| check(&mut c.ttl, now)) {
                Some(Check::Refresh) => match (&service_name, &host_name) {
                    (Some(name), _) => refresh.push((name.clone(), RRType::SRV)),
                    (None, Some(host)) => refresh.push((host.clone(), RRType::A)),
                    _ => {}
                },
                Some(Check::Delete) if is_service_query => {
                    flags |= AnswerFlags::HOST_DOMAIN | AnswerFlags::PORT;
                    answer.host = None;
                    if !answer.ipv4.is_empty() {
                        flags |= AnswerFlags::IPV4;
                    }
                    if !answer.ipv6.is_empty() {
                        flags |= AnswerFlags::IPV6;
                    }
                    answer.ipv4.clear();
                    answer.ipv6.clear();
                }
                Some(Check::Delete) => {
                    // The host is the key of a host query's answer.
                    flags |= AnswerFlags::HOST_DOMAIN;
                    doomed.push(index);
                }
                _ => {}
            }

            match answer.service.as_mut().map(|c| check(&mut c.ttl, now)) {
                Some(Check::Refresh) => refresh.push((self.target.domain().clone(), RRType::PTR)),
                Some(Check::Delete) => {
                    // Without the instance, host, port and TXT are meaningless.
                    flags |= AnswerFlags::SERVICE_DOMAIN;
                    doomed.push(index);
                }
                _ => {}
            }

            if !flags.is_empty() {
                deleted.push((index, flags));
            }
        }

        for (index, flags) in deleted {
            debug!("query {:?}: answer {} lost {:?}", self.handle, index, flags);
            self.notify(index, flags, false);
        }

        if !doomed.is_empty() {
            let mut index = 0;
            self.answers.retain(|_| {
                let keep = !doomed.contains(&index);
                index += 1;
                keep
            });
        }

        refresh.sort();
        refresh.dedup();
        refresh
    }

    /// The earliest time this query needs attention.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let send = match self.kind {
            QueryKind::Static {
                deadline: Some(deadline),
                ..
            } if self.next_send >= deadline => None,
            _ => Some(self.next_send),
        };
        self.answers
            .iter()
            .filter_map(Answer::next_deadline)
            .chain(send)
            .min()
    }
}

enum Check {
    Keep,
    Refresh,
    Delete,
}

/// A part past its lifetime is deleted. Otherwise a flagged tracker asks for
/// one refresh and moves beyond every level it has reached.
fn check(ttl: &mut TtlTracker, now: Instant) -> Check {
    if !ttl.flagged(now) {
        Check::Keep
    } else if ttl.expired(now) {
        Check::Delete
    } else {
        ttl.catch_up(now);
        Check::Refresh
    }
}
