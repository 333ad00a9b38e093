//! A small and poll-driven library for Multicast DNS and DNS-SD (Service Discovery).
//!
//! A [`Host`] owns one network interface. It probes and announces a host
//! name and any number of services, answers queries for them, and runs
//! service and host queries of its own. There is no background thread:
//! the application calls [`Host::update`] whenever a datagram may be
//! pending or the time from [`Host::next_deadline`] has come.
//!
//! ```text
//!  Application                 Host                      Network
//!    |  add_service("http") -->  |                          |
//!    |                           |  --- probe (QU) x3 --->  |
//!    |                           |  --- announce x3 ----->  |
//!    |  <-- HostEvent::Announced |                          |
//!    |                           |  <-- query PTR? -------  |
//!    |                           |  --- PTR/SRV/TXT/A --->  |
//!```
//!
//! Networking sits behind two traits, [`Transport`] and [`NetIf`], so the
//! protocol logic runs the same against real sockets ([`MulticastSocket`],
//! [`SystemNetIf`]) and against in-memory test doubles.
//!
//! # Usage
//!
//! ```no_run
//! use mdns_responder::{Host, MulticastSocket, SystemNetIf};
//! use std::time::Instant;
//!
//! let netif = SystemNetIf::first().expect("an IPv4 interface");
//! let socket = MulticastSocket::new(netif.name()).expect("mDNS sockets");
//! let mut host = Host::new(socket, netif, "my-box").expect("valid hostname");
//!
//! let http = host.add_service(None, "http", "tcp", 80).expect("service added");
//! host.add_service_txt(http, "path", Some("/")).expect("TXT entry added");
//!
//! loop {
//!     let timeout = host
//!         .next_deadline()
//!         .map(|deadline| deadline.saturating_duration_since(Instant::now()));
//!     host.transport_mut().wait(timeout).expect("poll sockets");
//!     host.update();
//! }
//! ```
//!
//! # Limitations
//!
//! One interface per [`Host`]. Known-answer lists spanning several packets
//! are not reassembled.

#![forbid(unsafe_code)]
#![allow(clippy::single_component_path_imports)]

// log for logging (optional).
#[cfg(feature = "logging")]
use log;

#[cfg(not(feature = "logging"))]
#[macro_use]
mod log {
    macro_rules! trace {
        ($($arg:expr),*) => {
            {
                let _ = ($($arg),*); // avoid warnings about unused variables.
            }
        };
    }

    macro_rules! debug {
        ($($arg:expr),*) => {
            {
                let _ = ($($arg),*);
            }
        };
    }
}

mod config;
mod dns_parser;
mod domain;
mod error;
mod host;
mod probe;
mod query;
mod service;
mod transport;

pub use config::{HostConfig, DNS_HOST_TTL, DNS_LEGACY_TTL, DNS_OTHER_TTL};
pub use dns_parser::{
    DnsIncoming, DnsOutgoing, DnsQuestion, DnsRecord, RData, RRType, CLASS_CACHE_FLUSH, CLASS_IN,
    FLAGS_AA, FLAGS_QR_QUERY, FLAGS_QR_RESPONSE, FLAGS_TC, MAX_MSG_ABSOLUTE,
};
pub use domain::Domain;
pub use error::{Error, Result};
pub use host::{Host, HostEvent};
pub use probe::{ProbeListener, ProbeStatus};
pub use query::{
    Answer, AnswerFlags, QueryEvent, QueryHandle, QueryListener, QueryTarget, TtlTracker,
};
pub use service::{
    decode_txt, DynamicTxt, ServiceHandle, TxtProperties, TxtProperty, TxtProvider,
};
pub use transport::{
    MulticastSocket, NetIf, NetIfState, SystemNetIf, Transport, GROUP_ADDR_V4, GROUP_ADDR_V6,
    MDNS_PORT,
};

/// Re-export from `flume`, the receiver of [`Host::monitor`] and of
/// channel-based query listeners.
pub use flume::Receiver;
