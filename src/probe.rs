//! Probing and announcing of the names a host owns.
//!
//! RFC 6762 section 8: before a name is used, the host asks three times
//! whether someone else uses it ("probing"), then tells everyone about its
//! records ("announcing").

#[cfg(feature = "logging")]
use crate::log::debug;
use crate::{config::HostConfig, dns_parser::DnsRecord, domain::Domain};
use std::{
    cmp,
    time::{Duration, Instant},
};

/// Where a name is in its probe and announce cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// The name is not known yet, or a service waits for its host.
    WaitingForData,

    /// Probing starts on the next poll.
    ReadyToStart,

    /// Probe queries are being sent.
    InProgress,

    /// Probing succeeded, announcements are being sent.
    ReadyToAnnounce,

    /// All announcements are sent.
    Done,
}

/// What the owner of a [Probe] should do now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProbeStep {
    Idle,
    SendProbe,
    Succeeded,
    /// A conflict or a lost tiebreak. The name must change before probing again.
    Failed,
    SendAnnounce,
}

#[derive(Debug)]
pub(crate) struct Probe {
    status: ProbeStatus,
    sent: u32,
    deadline: Option<Instant>,

    /// A response claimed the name with different data.
    pub(crate) conflict: bool,

    /// We lost a simultaneous probe tiebreak.
    pub(crate) tiebreak_needed: bool,

    /// At least one announcement went out, so goodbyes are due on removal.
    announced: bool,

    /// Authority records of the latest probe sent.
    records: Vec<DnsRecord>,
}

impl Probe {
    pub(crate) fn new() -> Self {
        Self {
            status: ProbeStatus::WaitingForData,
            sent: 0,
            deadline: None,
            conflict: false,
            tiebreak_needed: false,
            announced: false,
            records: Vec::new(),
        }
    }

    pub(crate) fn status(&self) -> ProbeStatus {
        self.status
    }

    #[cfg(test)]
    pub(crate) fn set_status(&mut self, status: ProbeStatus) {
        self.status = status;
    }

    pub(crate) fn announced(&self) -> bool {
        self.announced
    }

    pub(crate) fn is_done(&self) -> bool {
        self.status == ProbeStatus::Done
    }

    /// Probing finished without conflict, whether or not announcing is over.
    pub(crate) fn is_probed(&self) -> bool {
        matches!(
            self.status,
            ProbeStatus::ReadyToAnnounce | ProbeStatus::Done
        )
    }

    pub(crate) fn is_probing(&self) -> bool {
        self.status == ProbeStatus::InProgress
    }

    /// What we claimed in the latest probe. Empty until a probe went out.
    pub(crate) fn records(&self) -> &[DnsRecord] {
        &self.records
    }

    pub(crate) fn set_records(&mut self, records: Vec<DnsRecord>) {
        self.records = records;
    }

    /// Updates readiness: `ready` tells whether the name and its
    /// prerequisites are available.
    pub(crate) fn set_ready(&mut self, ready: bool) {
        match (self.status, ready) {
            (ProbeStatus::WaitingForData, true) => self.status = ProbeStatus::ReadyToStart,
            (ProbeStatus::WaitingForData, false) => {}
            (_, false) => {
                self.status = ProbeStatus::WaitingForData;
                self.deadline = None;
            }
            (_, true) => {}
        }
    }

    /// Returns to `ReadyToStart`, unless there is nothing to probe yet.
    pub(crate) fn restart(&mut self) {
        if self.status != ProbeStatus::WaitingForData {
            self.status = ProbeStatus::ReadyToStart;
        }
        self.sent = 0;
        self.deadline = None;
        self.conflict = false;
        self.tiebreak_needed = false;
        self.records.clear();
    }

    /// Probes again from scratch after `delay`.
    pub(crate) fn defer(&mut self, now: Instant, delay: Duration) {
        self.status = ProbeStatus::InProgress;
        self.sent = 0;
        self.deadline = Some(now + delay);
        self.conflict = false;
        self.tiebreak_needed = false;
        self.records.clear();
    }

    /// Advances the state machine. Call again while it returns anything but `Idle`.
    pub(crate) fn step(
        &mut self,
        now: Instant,
        config: &HostConfig,
        rng: &mut fastrand::Rng,
    ) -> ProbeStep {
        match self.status {
            ProbeStatus::WaitingForData | ProbeStatus::Done => ProbeStep::Idle,

            ProbeStatus::ReadyToStart => {
                // RFC 6762 section 8.1: "... the host should first wait for a short
                // random delay time, uniformly distributed in the range 0-250 ms."
                let max_wait = config.probe_wait.as_millis() as u64;
                let wait = Duration::from_millis(rng.u64(0..=max_wait));
                self.status = ProbeStatus::InProgress;
                self.sent = 0;
                self.deadline = Some(now + wait);
                self.conflict = false;
                self.tiebreak_needed = false;
                self.records.clear();
                debug!("probe starts in {:?}", wait);
                self.step(now, config, rng)
            }

            ProbeStatus::InProgress => {
                if self.conflict || self.tiebreak_needed {
                    self.conflict = false;
                    self.tiebreak_needed = false;
                    self.sent = 0;
                    self.deadline = None;
                    return ProbeStep::Failed;
                }
                if !self.is_due(now) {
                    return ProbeStep::Idle;
                }
                if self.sent < config.probe_count {
                    self.sent += 1;
                    self.deadline = Some(now + config.probe_interval);
                    return ProbeStep::SendProbe;
                }
                self.status = ProbeStatus::ReadyToAnnounce;
                self.sent = 0;
                self.deadline = Some(now);
                ProbeStep::Succeeded
            }

            ProbeStatus::ReadyToAnnounce => {
                if !self.is_due(now) {
                    return ProbeStep::Idle;
                }
                // Intervals double: 1 s, 2 s, ...
                let interval = config.announce_interval * (1 << self.sent.min(16));
                self.sent += 1;
                self.announced = true;
                if self.sent >= config.announce_count {
                    self.status = ProbeStatus::Done;
                    self.deadline = None;
                } else {
                    self.deadline = Some(now + interval);
                }
                ProbeStep::SendAnnounce
            }
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        self.deadline.map_or(true, |deadline| now >= deadline)
    }

    /// The earliest time `step` has something to do.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        match self.status {
            ProbeStatus::InProgress | ProbeStatus::ReadyToAnnounce => self.deadline,
            _ => None,
        }
    }
}

/// Receives the outcome of probing a host or service name.
///
/// On failure (`success == false`) the listener may return a new name to
/// probe. Returning `None` picks an indexed name like "foo-2" or "foo (2)".
pub trait ProbeListener {
    fn probe_result(&mut self, name: &Domain, success: bool) -> Option<String>;
}

impl<F> ProbeListener for F
where
    F: FnMut(&Domain, bool) -> Option<String>,
{
    fn probe_result(&mut self, name: &Domain, success: bool) -> Option<String> {
        self(name, success)
    }
}

/// Compares our records with a peer's records for the same name.
///
/// Returns `Greater` if ours win, `Less` if the peer's win and `Equal`
/// if the sets are identical, i.e. there is no conflict.
///
/// RFC 6762 section 8.2: "... the two records are compared and the
/// lexicographically later data wins. ... If both lists run out of
/// records at the same time without any difference being detected, then
/// this indicates that two devices are advertising identical sets of
/// records, as is sometimes done for fault tolerance, and there is, in
/// fact, no conflict."
pub(crate) fn tiebreak(ours: &[DnsRecord], theirs: &[DnsRecord]) -> cmp::Ordering {
    let mut ours: Vec<&DnsRecord> = ours.iter().collect();
    let mut theirs: Vec<&DnsRecord> = theirs.iter().collect();
    ours.sort_by(|a, b| a.compare(b));
    theirs.sort_by(|a, b| a.compare(b));

    for (mine, other) in ours.iter().zip(theirs.iter()) {
        match mine.compare(other) {
            cmp::Ordering::Equal => continue,
            not_equal => return not_equal,
        }
    }

    // A list with extra records is later.
    ours.len().cmp(&theirs.len())
}

/// Returns a new name based on the `original` to avoid conflicts.
/// If the name already contains a number in parentheses, increments that number.
///
/// Examples:
/// - `foo` becomes `foo (2)`
/// - `foo (2)` becomes `foo (3)`
pub(crate) fn name_change(original: &str) -> String {
    // check if there is already has `(<num>)` suffix.
    if let Some(paren_pos) = original.rfind(" (") {
        if let Some(inner) = original[paren_pos + 2..].strip_suffix(')') {
            if let Some(next) = inner.parse::<u32>().ok().and_then(|n| n.checked_add(1)) {
                return format!("{} ({})", &original[..paren_pos], next);
            }
        }
    }

    format!("{} (2)", original)
}

/// Returns a new name based on the `original` to avoid conflicts.
/// If the name already contains a hyphenated number, increments that number.
///
/// Examples:
/// - `foo.local` becomes `foo-2.local`
/// - `foo-2` becomes `foo-3`
pub(crate) fn hostname_change(original: &str) -> String {
    let mut parts: Vec<_> = original.split('.').collect();
    let first_part = match parts.get_mut(0) {
        Some(first) => first,
        None => return format!("{}-2", original),
    };

    let mut new_name = format!("{}-2", first_part);

    // check if there is already a `-<num>` suffix
    if let Some(hyphen_pos) = first_part.rfind('-') {
        // Try to parse everything after the hyphen as a number
        let number = first_part[hyphen_pos + 1..].parse::<u32>().ok();
        if let Some(next) = number.and_then(|n| n.checked_add(1)) {
            let base_name = &first_part[..hyphen_pos];
            new_name = format!("{}-{}", base_name, next);
        }
    }

    *first_part = &new_name;
    parts.join(".")
}
