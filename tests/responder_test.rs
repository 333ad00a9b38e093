use mdns_responder::{
    decode_txt, Answer, AnswerFlags, DnsIncoming, DnsOutgoing, DnsRecord, Domain, DynamicTxt,
    Error, Host, HostConfig, HostEvent, NetIf, NetIfState, ProbeStatus, QueryEvent, QueryHandle,
    RData, RRType, Result, Transport, TxtProvider, CLASS_CACHE_FLUSH, CLASS_IN, FLAGS_AA,
    FLAGS_QR_QUERY, FLAGS_QR_RESPONSE,
};
use std::{
    cell::RefCell,
    collections::VecDeque,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    rc::Rc,
    time::{Duration, Instant},
};
use test_log::test;

const MY_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
const PEER: &str = "192.168.1.20:5353";

#[derive(Default)]
struct Wire {
    sent: Vec<(Vec<u8>, Option<SocketAddr>)>,
    inbox: VecDeque<(Vec<u8>, SocketAddr)>,

    /// Multicast packets come back to the sender, as with IP_MULTICAST_LOOP.
    loopback: bool,
}

/// In-memory transport. Clones share the same wire.
#[derive(Clone, Default)]
struct MockTransport(Rc<RefCell<Wire>>);

impl MockTransport {
    fn deliver(&self, out: &DnsOutgoing, src: &str) {
        let src: SocketAddr = src.parse().unwrap();
        for packet in out.to_data_on_wire() {
            self.0.borrow_mut().inbox.push_back((packet, src));
        }
    }

    fn take_sent(&self) -> Vec<(DnsIncoming, Option<SocketAddr>)> {
        let sent = std::mem::take(&mut self.0.borrow_mut().sent);
        sent.into_iter()
            .map(|(data, dest)| (DnsIncoming::new(data).unwrap(), dest))
            .collect()
    }
}

impl Transport for MockTransport {
    fn send_multicast(&mut self, packet: &[u8]) -> Result<()> {
        let mut wire = self.0.borrow_mut();
        wire.sent.push((packet.to_vec(), None));
        if wire.loopback {
            let me = SocketAddr::new(IpAddr::V4(MY_ADDR), 5353);
            wire.inbox.push_back((packet.to_vec(), me));
        }
        Ok(())
    }

    fn send_unicast(&mut self, packet: &[u8], addr: SocketAddr) -> Result<()> {
        self.0.borrow_mut().sent.push((packet.to_vec(), Some(addr)));
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        match self.0.borrow_mut().inbox.pop_front() {
            Some((data, src)) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok(Some((data.len(), src)))
            }
            None => Ok(None),
        }
    }
}

struct MockNetIf;

impl NetIf for MockNetIf {
    fn state(&mut self) -> NetIfState {
        NetIfState {
            up: true,
            ipv4: Some(MY_ADDR),
            ipv6: None,
        }
    }
}

type TestHost = Host<MockTransport, MockNetIf>;
type Sent = Vec<(u64, DnsIncoming, Option<SocketAddr>)>;

fn new_host(hostname: &str) -> (TestHost, MockTransport, Instant) {
    let wire = MockTransport::default();
    let config = HostConfig::default()
        .with_probe_wait(Duration::from_millis(0))
        .with_seed(1);
    let host = Host::with_config(wire.clone(), MockNetIf, hostname, config).unwrap();
    let start = Instant::now();
    (host, wire, start)
}

/// Polls every 250 ms from `from_ms` to `to_ms`, and collects what was
/// sent along with the poll time.
fn run(
    host: &mut TestHost,
    wire: &MockTransport,
    start: Instant,
    from_ms: u64,
    to_ms: u64,
) -> Sent {
    let mut sent = Vec::new();
    let mut ms = from_ms;
    while ms <= to_ms {
        host.update_at(start + Duration::from_millis(ms));
        for (msg, dest) in wire.take_sent() {
            sent.push((ms, msg, dest));
        }
        ms += 250;
    }
    sent
}

fn domain(name: &str) -> Domain {
    Domain::parse(name).unwrap()
}

fn is_probe_for(msg: &DnsIncoming, name: &Domain) -> bool {
    msg.is_query()
        && msg
            .questions()
            .iter()
            .any(|q| q.name() == name && q.qtype() == RRType::ANY as u16)
}

fn times<F>(sent: &Sent, filter: F) -> Vec<u64>
where
    F: Fn(&DnsIncoming, &Option<SocketAddr>) -> bool,
{
    sent.iter()
        .filter(|(_, msg, dest)| filter(msg, dest))
        .map(|(ms, _, _)| *ms)
        .collect()
}

fn mentions(msg: &DnsIncoming, name: &Domain) -> bool {
    msg.questions().iter().any(|q| q.name() == name)
        || msg
            .all_records()
            .any(|r| r.name() == name || r.rdata() == &RData::Ptr(name.clone()))
}

/// A host "box" with "MyDevice._http._tcp.local" on port 80, fully announced.
fn announced_host() -> (TestHost, MockTransport, Instant) {
    let (mut host, wire, start) = new_host("box");
    let http = host
        .add_service(Some("MyDevice"), "http", "tcp", 80)
        .unwrap();
    host.add_service_txt(http, "path", Some("/")).unwrap();
    run(&mut host, &wire, start, 0, 5000);
    assert_eq!(host.service_status(http), Some(ProbeStatus::Done));
    (host, wire, start)
}

#[test]
fn service_probe_and_announce() {
    let (mut host, wire, start) = new_host("box");
    let events = host.monitor();
    let http = host
        .add_service(Some("MyDevice"), "http", "tcp", 80)
        .unwrap();
    host.add_service_txt(http, "path", Some("/")).unwrap();

    let sent = run(&mut host, &wire, start, 0, 5000);
    let host_domain = domain("box.local");
    let ty_domain = domain("_http._tcp.local");
    let fullname = domain("MyDevice._http._tcp.local");

    // Services are probed only once the host name is settled.
    assert_eq!(
        times(&sent, |m, _| is_probe_for(m, &host_domain)),
        vec![0, 250, 500]
    );
    assert_eq!(
        times(&sent, |m, _| is_probe_for(m, &fullname)),
        vec![750, 1000, 1250]
    );

    let (_, probe, _) = sent
        .iter()
        .find(|(_, m, _)| is_probe_for(m, &fullname))
        .unwrap();
    assert!(probe.questions()[0].unicast_response());
    assert!(probe
        .authorities()
        .iter()
        .any(|r| matches!(r.rdata(), RData::Srv { port: 80, .. })));

    let host_announce = |m: &DnsIncoming, _: &Option<SocketAddr>| {
        m.is_response()
            && m.answers()
                .iter()
                .any(|r| r.name() == &host_domain && r.ty() == RRType::A as u16)
    };
    assert_eq!(times(&sent, host_announce), vec![750, 1750, 3750]);

    let ptr = RData::Ptr(fullname.clone());
    let service_announce = |m: &DnsIncoming, dest: &Option<SocketAddr>| {
        m.is_response()
            && dest.is_none()
            && m.answers()
                .iter()
                .any(|r| r.name() == &ty_domain && r.rdata() == &ptr)
    };
    assert_eq!(times(&sent, service_announce), vec![1500, 2500, 4500]);

    let (_, announce, _) = sent
        .iter()
        .find(|(_, m, d)| service_announce(m, d))
        .unwrap();
    assert_eq!(announce.flags() & FLAGS_AA, FLAGS_AA);

    let srv = announce
        .answers()
        .iter()
        .find(|r| r.ty() == RRType::SRV as u16)
        .unwrap();
    assert_eq!(srv.name(), &fullname);
    assert_eq!(srv.ttl(), 120);
    assert!(srv.cache_flush());
    match srv.rdata() {
        RData::Srv { port, target, .. } => {
            assert_eq!(*port, 80);
            assert_eq!(target, &host_domain);
        }
        other => panic!("unexpected rdata {:?}", other),
    }

    let txt = announce
        .answers()
        .iter()
        .find(|r| r.ty() == RRType::TXT as u16)
        .unwrap();
    assert_eq!(txt.rdata(), &RData::Txt(b"\x06path=/".to_vec()));
    assert_eq!(txt.ttl(), 4500);

    assert!(announce
        .answers()
        .iter()
        .any(|r| r.name() == &Domain::meta_service()
            && r.rdata() == &RData::Ptr(ty_domain.clone())));
    assert!(announce
        .additionals()
        .iter()
        .any(|r| r.rdata() == &RData::A(MY_ADDR)));

    assert_eq!(host.status(), ProbeStatus::Done);
    assert_eq!(host.service_status(http), Some(ProbeStatus::Done));
    assert_eq!(
        events.try_iter().collect::<Vec<_>>(),
        vec![
            HostEvent::Announced(host_domain),
            HostEvent::Announced(fullname)
        ]
    );
}

#[test]
fn answers_ptr_query_with_additionals() {
    let (mut host, wire, start) = announced_host();
    let ty_domain = domain("_http._tcp.local");

    let mut query = DnsOutgoing::new(FLAGS_QR_QUERY);
    query.add_question(&ty_domain, RRType::PTR);
    wire.deliver(&query, PEER);

    let sent = run(&mut host, &wire, start, 5250, 5250);
    assert_eq!(sent.len(), 1);
    let (_, msg, dest) = &sent[0];
    assert!(msg.is_response());
    assert!(dest.is_none());

    assert_eq!(msg.answers().len(), 1);
    assert_eq!(
        msg.answers()[0].rdata(),
        &RData::Ptr(domain("MyDevice._http._tcp.local"))
    );
    let additional_types: Vec<u16> = msg.additionals().iter().map(|r| r.ty()).collect();
    assert!(additional_types.contains(&(RRType::SRV as u16)));
    assert!(additional_types.contains(&(RRType::TXT as u16)));
    assert!(additional_types.contains(&(RRType::A as u16)));
}

#[test]
fn known_answer_suppression() {
    let (mut host, wire, start) = announced_host();
    let ty_domain = domain("_http._tcp.local");
    let fullname = domain("MyDevice._http._tcp.local");

    let mut query = DnsOutgoing::new(FLAGS_QR_QUERY);
    query.add_question(&ty_domain, RRType::PTR);
    query.add_answer_record(DnsRecord::new_ptr(
        ty_domain.clone(),
        CLASS_IN,
        4500,
        fullname.clone(),
    ));
    wire.deliver(&query, PEER);
    let sent = run(&mut host, &wire, start, 5250, 5250);
    assert!(sent.is_empty());

    // Less than half the TTL left: the known answer does not suppress.
    let mut query = DnsOutgoing::new(FLAGS_QR_QUERY);
    query.add_question(&ty_domain, RRType::PTR);
    query.add_answer_record(DnsRecord::new_ptr(ty_domain, CLASS_IN, 2000, fullname));
    wire.deliver(&query, PEER);
    let sent = run(&mut host, &wire, start, 5500, 5500);
    assert_eq!(sent.len(), 1);
}

#[test]
fn legacy_unicast_query() {
    let (mut host, wire, start) = announced_host();
    let host_domain = domain("box.local");

    let mut query = DnsOutgoing::new(FLAGS_QR_QUERY);
    query.set_id(0x1234);
    query.add_question(&host_domain, RRType::A);
    wire.deliver(&query, "192.168.1.20:40000");

    let sent = run(&mut host, &wire, start, 5250, 5250);
    assert_eq!(sent.len(), 1);
    let (_, msg, dest) = &sent[0];
    assert_eq!(*dest, Some("192.168.1.20:40000".parse().unwrap()));
    assert_eq!(msg.id(), 0x1234);
    assert_eq!(msg.questions().len(), 1);

    let answer = &msg.answers()[0];
    assert_eq!(answer.rdata(), &RData::A(MY_ADDR));
    assert_eq!(answer.ttl(), 10);
    assert!(!answer.cache_flush());
}

#[test]
fn unicast_response_requested() {
    let (mut host, wire, start) = announced_host();

    let mut query = DnsOutgoing::new(FLAGS_QR_QUERY);
    query.add_question_raw(&domain("box.local"), RRType::A as u16, true);
    wire.deliver(&query, PEER);

    let sent = run(&mut host, &wire, start, 5250, 5250);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].2, Some(PEER.parse().unwrap()));
}

#[test]
fn missing_address_type_answered_with_nsec() {
    let (mut host, wire, start) = announced_host();

    let mut query = DnsOutgoing::new(FLAGS_QR_QUERY);
    query.add_question(&domain("box.local"), RRType::AAAA);
    wire.deliver(&query, PEER);

    let sent = run(&mut host, &wire, start, 5250, 5250);
    assert_eq!(sent.len(), 1);
    let msg = &sent[0].1;
    assert_eq!(msg.answers().len(), 1);
    assert_eq!(msg.answers()[0].ty(), RRType::NSEC as u16);
    assert!(msg
        .additionals()
        .iter()
        .any(|r| r.rdata() == &RData::A(MY_ADDR)));
}

#[test]
fn reverse_lookup() {
    let (mut host, wire, start) = announced_host();

    let mut query = DnsOutgoing::new(FLAGS_QR_QUERY);
    query.add_question(&domain("10.1.168.192.in-addr.arpa"), RRType::PTR);
    wire.deliver(&query, PEER);

    let sent = run(&mut host, &wire, start, 5250, 5250);
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].1.answers()[0].rdata(),
        &RData::Ptr(domain("box.local"))
    );
}

#[test]
fn no_answers_while_probing() {
    let (mut host, wire, start) = new_host("box");

    let mut query = DnsOutgoing::new(FLAGS_QR_QUERY);
    query.add_question(&domain("box.local"), RRType::A);
    wire.deliver(&query, PEER);
    let sent = run(&mut host, &wire, start, 0, 250);
    wire.deliver(&query, PEER);
    let more = run(&mut host, &wire, start, 500, 500);

    assert!(sent.iter().chain(more.iter()).all(|(_, m, _)| m.is_query()));
}

#[test]
fn announce_is_repeatable() {
    let (mut host, wire, _start) = announced_host();

    host.announce();
    let first = wire.take_sent();
    host.announce();
    let second = wire.take_sent();

    // One packet for the host, one for the service.
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2);
    for ((a, _), (b, _)) in first.iter().zip(second.iter()) {
        assert_eq!(a.answers(), b.answers());
        assert_eq!(a.additionals(), b.additionals());
    }
    assert_eq!(host.status(), ProbeStatus::Done);
}

#[test]
fn remove_service_while_probing() {
    let (mut host, wire, start) = new_host("box");
    let http = host
        .add_service(Some("MyDevice"), "http", "tcp", 80)
        .unwrap();
    let fullname = domain("MyDevice._http._tcp.local");
    let ty_domain = domain("_http._tcp.local");

    let sent = run(&mut host, &wire, start, 0, 1000);
    assert_eq!(times(&sent, |m, _| is_probe_for(m, &fullname)), vec![750, 1000]);

    assert!(host.remove_service(http));
    assert!(!host.remove_service(http));

    let sent = run(&mut host, &wire, start, 1250, 6000);
    assert!(!sent.is_empty());
    assert!(sent
        .iter()
        .all(|(_, m, _)| !mentions(m, &fullname) && !mentions(m, &ty_domain)));
}

#[test]
fn remove_announced_service_says_goodbye() {
    let (mut host, wire, _start) = announced_host();
    let http = host.find_service("mydevice", "_http", "_tcp").unwrap();

    assert!(host.remove_service(http));
    let sent = wire.take_sent();
    assert_eq!(sent.len(), 1);
    let msg = &sent[0].0;
    assert!(msg.answers().iter().all(|r| r.ttl() == 0));
    // The last service of its type also withdraws the type.
    assert!(msg
        .answers()
        .iter()
        .any(|r| r.name() == &Domain::meta_service()));
}

#[test]
fn lost_tiebreak_renames_host() {
    let (mut host, wire, start) = new_host("foo");
    let events = host.monitor();
    let foo = domain("foo.local");
    let foo2 = domain("foo-2.local");

    let mut sent = run(&mut host, &wire, start, 0, 0);

    // A simultaneous probe from a peer with a later address.
    let mut probe = DnsOutgoing::new(FLAGS_QR_QUERY);
    probe.add_question_raw(&foo, RRType::ANY as u16, true);
    probe.add_authority(DnsRecord::new_address(
        foo.clone(),
        CLASS_IN | CLASS_CACHE_FLUSH,
        120,
        IpAddr::V4(Ipv4Addr::new(200, 0, 0, 1)),
    ));
    wire.deliver(&probe, PEER);
    sent.extend(run(&mut host, &wire, start, 250, 6000));

    assert_eq!(host.hostname(), "foo-2");
    assert_eq!(times(&sent, |m, _| is_probe_for(m, &foo)), vec![0]);
    assert_eq!(
        times(&sent, |m, _| is_probe_for(m, &foo2)),
        vec![1250, 1500, 1750]
    );
    assert!(sent
        .iter()
        .filter(|(_, m, _)| m.is_response())
        .all(|(_, m, _)| m.answers().iter().all(|r| r.name() != &foo)));
    assert!(sent
        .iter()
        .any(|(_, m, _)| m.is_response() && m.answers().iter().any(|r| r.name() == &foo2)));

    assert_eq!(
        events.try_iter().collect::<Vec<_>>(),
        vec![
            HostEvent::ProbeFailed(foo.clone()),
            HostEvent::NameChanged {
                old: foo,
                new: foo2.clone()
            },
            HostEvent::Announced(foo2),
        ]
    );
}

#[test]
fn identical_probe_is_no_conflict() {
    let (mut host, wire, start) = new_host("foo");
    let foo = domain("foo.local");
    run(&mut host, &wire, start, 0, 0);

    let mut probe = DnsOutgoing::new(FLAGS_QR_QUERY);
    probe.add_question_raw(&foo, RRType::ANY as u16, true);
    probe.add_authority(DnsRecord::new_address(
        foo,
        CLASS_IN | CLASS_CACHE_FLUSH,
        120,
        IpAddr::V4(MY_ADDR),
    ));
    wire.deliver(&probe, PEER);
    run(&mut host, &wire, start, 250, 4000);

    assert_eq!(host.hostname(), "foo");
    assert_eq!(host.status(), ProbeStatus::Done);
}

#[test]
fn conflicting_response_uses_listener_name() {
    let (mut host, wire, start) = new_host("box");
    let results: Rc<RefCell<Vec<(Domain, bool)>>> = Rc::default();
    let log = results.clone();
    host.set_probe_listener(move |name: &Domain, success: bool| -> Option<String> {
        log.borrow_mut().push((name.clone(), success));
        if success {
            None
        } else {
            Some("spare".to_string())
        }
    });
    run(&mut host, &wire, start, 0, 0);

    let mut response = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
    response.add_answer_record(DnsRecord::new_address(
        domain("box.local"),
        CLASS_IN | CLASS_CACHE_FLUSH,
        120,
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 99)),
    ));
    wire.deliver(&response, PEER);
    run(&mut host, &wire, start, 250, 4000);

    assert_eq!(host.hostname(), "spare");
    assert_eq!(host.host_domain(), &domain("spare.local"));
    assert_eq!(
        *results.borrow(),
        vec![(domain("box.local"), false), (domain("spare.local"), true)]
    );
}

#[test]
fn host_query_refresh_and_expiry() {
    let (mut host, wire, start) = new_host("box");
    let peer = domain("peer.local");

    let changes: Rc<RefCell<Vec<(AnswerFlags, bool)>>> = Rc::default();
    let log = changes.clone();
    let query = host
        .install_host_query(
            "peer",
            move |_: QueryHandle, _: &Answer, flags: AnswerFlags, set: bool| {
                log.borrow_mut().push((flags, set));
            },
        )
        .unwrap();

    let mut response = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
    response.add_answer_record(DnsRecord::new_address(
        peer.clone(),
        CLASS_IN | CLASS_CACHE_FLUSH,
        120,
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
    ));
    wire.deliver(&response, PEER);

    let sent = run(&mut host, &wire, start, 0, 121_000);

    let answers = host.query_answers(query).unwrap();
    assert!(answers.is_empty());

    // A refresh asks for A alone; the regular resends ask for A and AAAA.
    let refresh = |m: &DnsIncoming, _: &Option<SocketAddr>| {
        m.is_query()
            && m.questions().len() == 1
            && m.questions()[0].name() == &peer
            && m.questions()[0].qtype() == RRType::A as u16
    };
    assert_eq!(
        times(&sent, refresh),
        vec![96_000, 102_000, 108_000, 114_000]
    );

    let both = AnswerFlags::HOST_DOMAIN | AnswerFlags::IPV4;
    assert_eq!(*changes.borrow(), vec![(both, true), (both, false)]);
}

#[test]
fn static_service_query() {
    let (mut host, wire, start) = new_host("box");
    let ty_domain = domain("_ipp._tcp.local");
    let office = domain("Office._ipp._tcp.local");
    let printer = domain("printer.local");

    let query = host
        .query_service("ipp", "tcp", Duration::from_secs(3))
        .unwrap();
    let sent = run(&mut host, &wire, start, 0, 0);
    assert!(sent.iter().any(|(_, m, _)| m.is_query()
        && m.questions()
            .iter()
            .any(|q| q.name() == &ty_domain && q.qtype() == RRType::PTR as u16)));

    let mut response = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
    response.add_answer_record(DnsRecord::new_ptr(
        ty_domain.clone(),
        CLASS_IN,
        4500,
        office.clone(),
    ));
    let flush = CLASS_IN | CLASS_CACHE_FLUSH;
    response.add_additional_answer(DnsRecord::new_srv(
        office.clone(),
        flush,
        120,
        631,
        printer.clone(),
    ));
    response.add_additional_answer(DnsRecord::new_txt(
        office.clone(),
        flush,
        4500,
        b"\x06rp=ipp".to_vec(),
    ));
    response.add_additional_answer(DnsRecord::new_address(
        printer.clone(),
        flush,
        120,
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 30)),
    ));
    wire.deliver(&response, PEER);

    let sent = run(&mut host, &wire, start, 250, 3000);
    assert_eq!(host.query_complete(query), Some(true));

    // The resend carries what is already known.
    let (_, resend, _) = sent
        .iter()
        .find(|(ms, m, _)| *ms == 1000 && m.is_query() && m.questions()[0].name() == &ty_domain)
        .unwrap();
    assert_eq!(resend.answers().len(), 1);
    assert_eq!(resend.answers()[0].rdata(), &RData::Ptr(office.clone()));

    let answers = host.query_answers(query).unwrap();
    assert_eq!(answers.len(), 1);
    let answer = &answers[0];
    assert_eq!(answer.service_domain(), Some(&office));
    assert_eq!(answer.host_domain(), Some(&printer));
    assert_eq!(answer.port(), 631);
    let txt = answer.txt_properties();
    assert_eq!(txt.len(), 1);
    assert_eq!(txt[0].key(), "rp");
    assert_eq!(txt[0].val_str(), Some("ipp"));
    assert_eq!(
        answer.ipv4().collect::<Vec<_>>(),
        vec![Ipv4Addr::new(192, 168, 1, 30)]
    );

    assert!(host.remove_query(query));
    assert!(host.query_answers(query).is_none());
}

#[test]
fn add_service_limits() {
    let wire = MockTransport::default();
    let config = HostConfig::default().with_max_services(2);
    let mut host = Host::with_config(wire, MockNetIf, "box", config).unwrap();

    host.add_service(Some("One"), "http", "tcp", 80).unwrap();
    assert!(host.add_service(Some("one"), "_http", "_tcp", 8080).is_err());
    assert!(host
        .add_service(Some("bad"), "this-is-far-too-long", "tcp", 80)
        .is_err());

    host.add_service(Some("Two"), "http", "tcp", 80).unwrap();
    assert!(matches!(
        host.add_service(Some("Three"), "http", "tcp", 80),
        Err(Error::LimitExceeded(_))
    ));
}

#[test]
fn default_instance_follows_hostname() {
    let (mut host, _wire, _start) = new_host("box");
    let http = host.add_service(None, "http", "tcp", 80).unwrap();
    assert_eq!(
        host.service_fullname(http),
        Some(&domain("box._http._tcp.local"))
    );

    host.set_hostname("cube.local").unwrap();
    assert_eq!(
        host.service_fullname(http),
        Some(&domain("cube._http._tcp.local"))
    );

    host.set_default_instance_name(Some("Kitchen"));
    assert_eq!(
        host.service_fullname(http),
        Some(&domain("Kitchen._http._tcp.local"))
    );

    host.set_service_name(http, "Pinned").unwrap();
    host.set_default_instance_name(None);
    assert_eq!(
        host.service_fullname(http),
        Some(&domain("Pinned._http._tcp.local"))
    );
}

/// Adds an increasing "seq" entry on every send.
struct Sequence(u32);

impl TxtProvider for Sequence {
    fn provide_txt(&mut self, _instance: &Domain, txt: &mut DynamicTxt<'_>) {
        self.0 += 1;
        txt.add("seq", &self.0.to_string()).unwrap();
        assert!(txt.add("path", "/other").is_err());
    }
}

#[test]
fn txt_provider_entries_are_per_send() {
    let (mut host, wire, start) = new_host("box");
    let http = host
        .add_service(Some("MyDevice"), "http", "tcp", 80)
        .unwrap();
    host.add_service_txt(http, "path", Some("/")).unwrap();
    host.set_service_txt_provider(http, Sequence(0)).unwrap();

    let sent = run(&mut host, &wire, start, 0, 5000);

    let mut seqs = Vec::new();
    for (_, msg, _) in sent.iter().filter(|(_, m, _)| m.is_response()) {
        for record in msg.answers() {
            if let RData::Txt(data) = record.rdata() {
                let props = decode_txt(data);
                assert!(props
                    .iter()
                    .any(|p| p.key() == "path" && p.val_str() == Some("/")));
                let seq = props
                    .iter()
                    .find(|p| p.key() == "seq")
                    .and_then(|p| p.val_str())
                    .map(str::to_string);
                seqs.push(seq);
            }
        }
    }

    // Three probes come first, then three announcements.
    let expected: Vec<Option<String>> = vec![Some("4".into()), Some("5".into()), Some("6".into())];
    assert_eq!(seqs, expected);

    let txt = host.service_txt(http).unwrap();
    assert_eq!(txt.len(), 1);
    assert!(txt.get("seq").is_none());
}

#[test]
fn service_query_events() {
    let (mut host, wire, start) = new_host("box");
    let ty_domain = domain("_ipp._tcp.local");
    let office = domain("Office._ipp._tcp.local");
    let printer = domain("printer.local");

    let (tx, rx) = flume::unbounded::<QueryEvent>();
    let query = host.install_service_query("ipp", "tcp", tx).unwrap();

    let flush = CLASS_IN | CLASS_CACHE_FLUSH;
    let mut response = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
    response.add_answer_record(DnsRecord::new_ptr(
        ty_domain.clone(),
        CLASS_IN,
        4500,
        office.clone(),
    ));
    response.add_answer_record(DnsRecord::new_srv(
        office.clone(),
        flush,
        120,
        631,
        printer.clone(),
    ));
    response.add_answer_record(DnsRecord::new_txt(office.clone(), flush, 4500, vec![0]));
    response.add_answer_record(DnsRecord::new_address(
        printer,
        flush,
        120,
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 30)),
    ));
    wire.deliver(&response, PEER);
    run(&mut host, &wire, start, 0, 1750);

    // The peer withdraws the instance.
    let mut goodbye = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
    goodbye.add_answer_record(DnsRecord::new_ptr(ty_domain, CLASS_IN, 0, office.clone()));
    wire.deliver(&goodbye, PEER);
    run(&mut host, &wire, start, 2000, 4000);

    let events: Vec<QueryEvent> = rx.try_iter().collect();
    assert_eq!(events.len(), 2);

    let found = &events[0];
    assert_eq!(found.query, query);
    assert!(found.set);
    assert_eq!(
        found.flags,
        AnswerFlags::SERVICE_DOMAIN
            | AnswerFlags::HOST_DOMAIN
            | AnswerFlags::PORT
            | AnswerFlags::TXTS
            | AnswerFlags::IPV4
    );
    assert_eq!(found.answer.service_domain(), Some(&office));
    assert_eq!(found.answer.port(), 631);

    let lost = &events[1];
    assert!(!lost.set);
    assert_eq!(lost.flags, AnswerFlags::SERVICE_DOMAIN);
    assert!(host.query_answers(query).unwrap().is_empty());
}

#[test]
fn port_change_probes_again() {
    let (mut host, wire, start) = announced_host();
    let http = host.find_service("MyDevice", "http", "tcp").unwrap();
    let fullname = domain("MyDevice._http._tcp.local");

    host.set_service_port(http, 8080).unwrap();
    assert_eq!(host.service_status(http), Some(ProbeStatus::ReadyToStart));

    let sent = run(&mut host, &wire, start, 5250, 10_000);
    assert_eq!(
        times(&sent, |m, _| is_probe_for(m, &fullname)),
        vec![5250, 5500, 5750]
    );
    let port_8080 = |m: &DnsIncoming, _: &Option<SocketAddr>| {
        m.is_response()
            && m.answers()
                .iter()
                .any(|r| matches!(r.rdata(), RData::Srv { port: 8080, .. }))
    };
    assert_eq!(times(&sent, port_8080), vec![6000, 7000, 9000]);
    assert_eq!(host.service_status(http), Some(ProbeStatus::Done));
}

#[test]
fn indexed_hostname() {
    let (mut host, _wire, _start) = new_host("box");
    host.index_hostname().unwrap();
    assert_eq!(host.hostname(), "box-2");
    host.index_hostname().unwrap();
    assert_eq!(host.host_domain(), &domain("box-3.local"));
}

#[test]
fn answers_srv_and_txt_questions() {
    let (mut host, wire, start) = announced_host();
    let fullname = domain("MyDevice._http._tcp.local");

    let mut query = DnsOutgoing::new(FLAGS_QR_QUERY);
    query.add_question(&fullname, RRType::SRV);
    query.add_question(&fullname, RRType::TXT);
    wire.deliver(&query, PEER);

    let sent = run(&mut host, &wire, start, 5250, 5250);
    assert_eq!(sent.len(), 1);
    let (_, msg, _) = &sent[0];
    assert!(msg.is_response());
    assert_eq!(msg.answers().len(), 2);

    let srv = msg
        .answers()
        .iter()
        .find(|r| r.ty() == RRType::SRV as u16)
        .unwrap();
    assert_eq!(srv.name(), &fullname);
    assert!(matches!(
        srv.rdata(),
        RData::Srv { port: 80, target, .. } if target == &domain("box.local")
    ));

    let txt = msg
        .answers()
        .iter()
        .find(|r| r.ty() == RRType::TXT as u16)
        .unwrap();
    let props = match txt.rdata() {
        RData::Txt(data) => decode_txt(data),
        other => panic!("unexpected rdata {:?}", other),
    };
    assert_eq!(props.len(), 1);
    assert_eq!(props[0].key(), "path");

    // The host address follows the SRV record.
    assert!(msg
        .additionals()
        .iter()
        .any(|r| r.rdata() == &RData::A(MY_ADDR)));
}

#[test]
fn lost_service_tiebreak_renames_instance() {
    let (mut host, wire, start) = new_host("box");
    let events = host.monitor();
    let http = host
        .add_service(Some("MyDevice"), "http", "tcp", 80)
        .unwrap();
    host.add_service_txt(http, "path", Some("/")).unwrap();
    let fullname = domain("MyDevice._http._tcp.local");
    let renamed = domain("MyDevice (2)._http._tcp.local");

    let mut sent = run(&mut host, &wire, start, 0, 750);

    // A peer probes the same instance with a later SRV record.
    let flush = CLASS_IN | CLASS_CACHE_FLUSH;
    let mut probe = DnsOutgoing::new(FLAGS_QR_QUERY);
    probe.add_question_raw(&fullname, RRType::ANY as u16, true);
    probe.add_authority(DnsRecord::new_srv(
        fullname.clone(),
        flush,
        120,
        9999,
        domain("peer.local"),
    ));
    probe.add_authority(DnsRecord::new_txt(
        fullname.clone(),
        flush,
        120,
        b"\x06path=/".to_vec(),
    ));
    wire.deliver(&probe, PEER);
    sent.extend(run(&mut host, &wire, start, 1000, 8000));

    assert_eq!(host.service_fullname(http), Some(&renamed));
    assert_eq!(host.service_status(http), Some(ProbeStatus::Done));
    assert_eq!(times(&sent, |m, _| is_probe_for(m, &fullname)), vec![750]);
    assert_eq!(
        times(&sent, |m, _| is_probe_for(m, &renamed)),
        vec![2000, 2250, 2500]
    );
    assert!(sent
        .iter()
        .filter(|(_, m, _)| m.is_response())
        .all(|(_, m, _)| !mentions(m, &fullname)));

    let events: Vec<HostEvent> = events.try_iter().collect();
    assert!(events.contains(&HostEvent::ProbeFailed(fullname.clone())));
    assert!(events.contains(&HostEvent::NameChanged {
        old: fullname,
        new: renamed.clone()
    }));
    assert!(events.contains(&HostEvent::Announced(renamed)));
}

#[test]
fn conflicting_response_renames_instance() {
    let (mut host, wire, start) = new_host("box");
    let http = host
        .add_service(Some("MyDevice"), "http", "tcp", 80)
        .unwrap();
    let fullname = domain("MyDevice._http._tcp.local");
    run(&mut host, &wire, start, 0, 750);

    let mut response = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
    response.add_answer_record(DnsRecord::new_srv(
        fullname,
        CLASS_IN | CLASS_CACHE_FLUSH,
        120,
        8080,
        domain("peer.local"),
    ));
    wire.deliver(&response, PEER);
    run(&mut host, &wire, start, 1000, 8000);

    assert_eq!(
        host.service_fullname(http),
        Some(&domain("MyDevice (2)._http._tcp.local"))
    );
    assert_eq!(host.service_status(http), Some(ProbeStatus::Done));
}

/// Adds a "heap" entry that shrinks on every send.
struct FreeHeap(u32);

impl TxtProvider for FreeHeap {
    fn provide_txt(&mut self, _instance: &Domain, txt: &mut DynamicTxt<'_>) {
        self.0 -= 100;
        txt.add("heap", &self.0.to_string()).unwrap();
    }
}

#[test]
fn own_packets_looped_back_are_no_conflict() {
    let (mut host, wire, start) = new_host("box");
    wire.0.borrow_mut().loopback = true;
    let events = host.monitor();
    let http = host
        .add_service(Some("MyDevice"), "http", "tcp", 80)
        .unwrap();
    host.set_service_txt_provider(http, FreeHeap(9900)).unwrap();

    run(&mut host, &wire, start, 0, 5000);

    assert_eq!(host.hostname(), "box");
    assert_eq!(
        host.service_fullname(http),
        Some(&domain("MyDevice._http._tcp.local"))
    );
    assert_eq!(host.service_status(http), Some(ProbeStatus::Done));
    assert!(events
        .try_iter()
        .all(|e| !matches!(e, HostEvent::ProbeFailed(_))));
}

#[test]
fn static_query_deadline_counts_from_first_poll() {
    let (mut host, wire, start) = new_host("box");
    let ty_domain = domain("_ipp._tcp.local");
    run(&mut host, &wire, start, 0, 0);

    // The application comes back long after its last poll.
    let query = host
        .query_service("ipp", "tcp", Duration::from_secs(5))
        .unwrap();
    let sent = run(&mut host, &wire, start, 60_000, 60_000);
    assert!(sent.iter().any(|(_, m, _)| m.is_query()
        && m.questions()
            .iter()
            .any(|q| q.name() == &ty_domain && q.qtype() == RRType::PTR as u16)));
    assert_eq!(host.query_complete(query), Some(false));

    run(&mut host, &wire, start, 64_750, 64_750);
    assert_eq!(host.query_complete(query), Some(false));
    run(&mut host, &wire, start, 65_000, 65_000);
    assert_eq!(host.query_complete(query), Some(true));
}

fn peer_address(ttl: u32) -> DnsOutgoing {
    let mut response = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
    response.add_answer_record(DnsRecord::new_address(
        domain("peer.local"),
        CLASS_IN | CLASS_CACHE_FLUSH,
        ttl,
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
    ));
    response
}

#[test]
fn sparse_polls_expire_answers_on_time() {
    let (mut host, wire, start) = new_host("box");
    let changes: Rc<RefCell<Vec<bool>>> = Rc::default();
    let log = changes.clone();
    let query = host
        .install_host_query(
            "peer",
            move |_: QueryHandle, _: &Answer, _: AnswerFlags, set: bool| {
                log.borrow_mut().push(set);
            },
        )
        .unwrap();

    wire.deliver(&peer_address(120), PEER);
    run(&mut host, &wire, start, 0, 0);
    assert_eq!(host.query_answers(query).unwrap().len(), 1);

    run(&mut host, &wire, start, 96_000, 96_000);
    assert_eq!(host.query_answers(query).unwrap().len(), 1);

    // No answer to the refresh, and the next poll is past the TTL.
    run(&mut host, &wire, start, 121_000, 121_000);
    assert!(host.query_answers(query).unwrap().is_empty());
    assert_eq!(*changes.borrow(), vec![true, false]);
}

#[test]
fn refreshed_answer_expires_from_refresh() {
    let (mut host, wire, start) = new_host("box");
    let ignore = |_: QueryHandle, _: &Answer, _: AnswerFlags, _: bool| {};
    let query = host.install_host_query("peer", ignore).unwrap();

    wire.deliver(&peer_address(120), PEER);
    run(&mut host, &wire, start, 0, 0);
    wire.deliver(&peer_address(120), PEER);
    run(&mut host, &wire, start, 50_000, 50_000);

    // Only regular resends for A and AAAA, no refresh of a single type.
    let sent = run(&mut host, &wire, start, 121_000, 121_000);
    assert_eq!(host.query_answers(query).unwrap().len(), 1);
    assert!(sent
        .iter()
        .filter(|(_, m, _)| m.is_query() && mentions(m, &domain("peer.local")))
        .all(|(_, m, _)| m.questions().len() == 2));

    run(&mut host, &wire, start, 170_000, 170_000);
    assert!(host.query_answers(query).unwrap().is_empty());
}
