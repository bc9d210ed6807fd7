use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};

use crate::config::MatchingMode;
use crate::error::{Error, Result};

bitflags! {
    /// SIP methods a contact accepts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Methods: u32 {
        const INVITE = 1 << 0;
        const CANCEL = 1 << 1;
        const ACK = 1 << 2;
        const BYE = 1 << 3;
        const INFO = 1 << 4;
        const REGISTER = 1 << 5;
        const SUBSCRIBE = 1 << 6;
        const NOTIFY = 1 << 7;
        const MESSAGE = 1 << 8;
        const OPTIONS = 1 << 9;
        const PRACK = 1 << 10;
        const UPDATE = 1 << 11;
        const REFER = 1 << 12;
        const PUBLISH = 1 << 13;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
    Sctp,
    Ws,
    Wss,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
            Transport::Tls => "tls",
            Transport::Sctp => "sctp",
            Transport::Ws => "ws",
            Transport::Wss => "wss",
        }
    }
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Transport::Udp),
            "tcp" => Ok(Transport::Tcp),
            "tls" => Ok(Transport::Tls),
            "sctp" => Ok(Transport::Sctp),
            "ws" => Ok(Transport::Ws),
            "wss" => Ok(Transport::Wss),
            other => Err(Error::InvalidOperation(format!("unknown transport {other:?}"))),
        }
    }
}

/// Network source a REGISTER was received from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Source {
    pub host: String,
    pub port: u16,
    pub transport: Transport,
}

impl Source {
    pub fn new(host: impl Into<String>, port: u16, transport: Transport) -> Self {
        Self {
            host: host.into(),
            port,
            transport,
        }
    }
}

/// Written as `transport:host:port`; IPv6 hosts keep their brackets.
impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.transport.as_str(), self.host, self.port)
    }
}

impl FromStr for Source {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::InvalidOperation(format!("malformed source {s:?}"));
        let (transport, rest) = s.split_once(':').ok_or_else(bad)?;
        let (host, port) = rest.rsplit_once(':').ok_or_else(bad)?;
        if host.is_empty() {
            return Err(bad());
        }
        Ok(Source {
            host: host.to_string(),
            port: port.parse().map_err(|_| bad())?,
            transport: transport.parse()?,
        })
    }
}

/// Contact preference in thousandths, 0..=1000, or unspecified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Q(i32);

impl Q {
    pub const UNSPECIFIED: Q = Q(-1);
    pub const MAX: Q = Q(1000);

    pub fn from_millis(millis: i32) -> Self {
        if millis < 0 {
            Q::UNSPECIFIED
        } else {
            Q(millis.min(1000))
        }
    }

    pub fn from_f64(q: f64) -> Self {
        if q.is_nan() || q < 0.0 {
            Q::UNSPECIFIED
        } else {
            Q::from_millis((q * 1000.0).round() as i32)
        }
    }

    pub fn millis(&self) -> i32 {
        self.0
    }

    pub fn is_specified(&self) -> bool {
        self.0 >= 0
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.is_specified().then(|| self.0 as f64 / 1000.0)
    }
}

impl Default for Q {
    fn default() -> Self {
        Q::UNSPECIFIED
    }
}

impl fmt::Display for Q {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_f64() {
            Some(q) => write!(f, "{q:.3}"),
            None => f.write_str("-"),
        }
    }
}

/// Lifecycle of a contact. Expiry only ever moves a contact forward through
/// these states; memory is reclaimed by the contact table once a
/// `DelayedDelete` contact is no longer referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContactState {
    #[default]
    Valid,
    ExpirePendingNotify,
    NotifyReady,
    Deleted,
    DelayedDelete,
}

impl fmt::Display for ContactState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContactState::Valid => "valid",
            ContactState::ExpirePendingNotify => "expire-pending-notify",
            ContactState::NotifyReady => "notify-ready",
            ContactState::Deleted => "deleted",
            ContactState::DelayedDelete => "delayed-delete",
        };
        f.write_str(s)
    }
}

/// Agreement between a contact and its persisted row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// Never written.
    #[default]
    New,
    /// Memory and storage agree.
    Sync,
    /// Modified since last written.
    Dirty,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::New => "new",
            SyncState::Sync => "sync",
            SyncState::Dirty => "dirty",
        };
        f.write_str(s)
    }
}

/// Write needed to bring storage in line with memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingWrite {
    Insert,
    Update,
}

/// Caller-supplied contact fields for insert and update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContactInfo {
    /// Absolute expiry in unix seconds, 0 for a permanent contact.
    pub expires: i64,
    pub q: Q,
    pub callid: Option<String>,
    pub cseq: i32,
    pub path: Option<String>,
    pub received: Option<Source>,
    pub user_agent: Option<String>,
    pub methods: Option<Methods>,
    pub flags: u32,
    pub cflags: u32,
    pub ruid: Option<String>,
    pub instance: Option<String>,
    pub reg_id: u32,
    pub socket: Option<String>,
    /// Unix seconds; 0 means "now" at insert or update time.
    pub last_modified: i64,
    pub server_id: i32,
    /// Transport connection the contact registered over, if any.
    pub connection_id: Option<i32>,
    /// 3GPP-class contact, counted against the per-record 3GPP limit.
    pub is_3gpp: bool,
}

impl ContactInfo {
    pub fn new(expires: i64) -> Self {
        Self {
            expires,
            ..Default::default()
        }
    }

    pub fn q(mut self, q: Q) -> Self {
        self.q = q;
        self
    }

    pub fn callid(mut self, callid: impl Into<String>) -> Self {
        self.callid = Some(callid.into());
        self
    }

    pub fn cseq(mut self, cseq: i32) -> Self {
        self.cseq = cseq;
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn received(mut self, source: Source) -> Self {
        self.received = Some(source);
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    pub fn methods(mut self, methods: Methods) -> Self {
        self.methods = Some(methods);
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn cflags(mut self, cflags: u32) -> Self {
        self.cflags = cflags;
        self
    }

    pub fn ruid(mut self, ruid: impl Into<String>) -> Self {
        self.ruid = Some(ruid.into());
        self
    }

    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn reg_id(mut self, reg_id: u32) -> Self {
        self.reg_id = reg_id;
        self
    }

    pub fn socket(mut self, socket: impl Into<String>) -> Self {
        self.socket = Some(socket.into());
        self
    }

    pub fn last_modified(mut self, at: i64) -> Self {
        self.last_modified = at;
        self
    }

    pub fn connection_id(mut self, id: i32) -> Self {
        self.connection_id = Some(id);
        self
    }

    pub fn is_3gpp(mut self, is_3gpp: bool) -> Self {
        self.is_3gpp = is_3gpp;
        self
    }
}

/// Criteria for finding a stored contact.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContactQuery<'a> {
    pub uri: &'a str,
    pub callid: Option<&'a str>,
    pub path: Option<&'a str>,
    pub cseq: Option<i32>,
}

impl<'a> ContactQuery<'a> {
    pub fn new(uri: &'a str) -> Self {
        Self {
            uri,
            ..Default::default()
        }
    }

    pub fn callid(mut self, callid: &'a str) -> Self {
        self.callid = Some(callid);
        self
    }

    pub fn path(mut self, path: &'a str) -> Self {
        self.path = Some(path);
        self
    }

    pub fn cseq(mut self, cseq: i32) -> Self {
        self.cseq = Some(cseq);
        self
    }
}

/// Mutable contact state, guarded by the contact's own lock. Empty strings
/// stand for absent optional fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactData {
    pub uri: String,
    pub expires: i64,
    pub q: Q,
    pub callid: String,
    pub cseq: i32,
    pub path: String,
    pub received: Option<Source>,
    pub user_agent: String,
    pub methods: Methods,
    pub flags: u32,
    pub cflags: u32,
    pub ruid: String,
    pub instance: String,
    pub reg_id: u32,
    pub socket: String,
    pub last_modified: i64,
    pub server_id: i32,
    pub connection_id: Option<i32>,
    pub state: ContactState,
    pub sync: SyncState,
    pub refs: u32,
    /// The sweep holds one of `refs` while the contact awaits its final pass.
    pub(crate) swept: bool,
}

/// Overwrites `dst`, keeping its buffer and growing it only when `src` is
/// longer.
fn assign(dst: &mut String, src: &str) {
    dst.clear();
    dst.push_str(src);
}

impl ContactData {
    fn new(uri: &str, info: &ContactInfo, now: i64) -> Self {
        let mut data = Self {
            uri: uri.to_string(),
            expires: 0,
            q: Q::UNSPECIFIED,
            callid: String::new(),
            cseq: 0,
            path: String::new(),
            received: None,
            user_agent: String::new(),
            methods: Methods::all(),
            flags: 0,
            cflags: 0,
            ruid: String::new(),
            instance: String::new(),
            reg_id: 0,
            socket: String::new(),
            last_modified: 0,
            server_id: 0,
            connection_id: None,
            state: ContactState::Valid,
            sync: SyncState::New,
            refs: 0,
            swept: false,
        };
        data.apply(info, now);
        if let Some(instance) = &info.instance {
            assign(&mut data.instance, instance);
        }
        if let Some(ruid) = &info.ruid {
            assign(&mut data.ruid, ruid);
        }
        data
    }

    /// In-place update from a re-registration. The contact URI never
    /// changes; it fixes the contact's slot.
    fn apply(&mut self, info: &ContactInfo, now: i64) {
        self.expires = info.expires;
        self.q = info.q;
        self.cseq = info.cseq;
        self.flags = info.flags;
        self.cflags = info.cflags;
        self.reg_id = info.reg_id;
        self.server_id = info.server_id;
        self.connection_id = info.connection_id;
        self.received = info.received.clone();
        if let Some(methods) = info.methods {
            self.methods = methods;
        }
        if let Some(callid) = &info.callid {
            assign(&mut self.callid, callid);
        }
        assign(&mut self.path, info.path.as_deref().unwrap_or(""));
        assign(&mut self.user_agent, info.user_agent.as_deref().unwrap_or(""));
        assign(&mut self.socket, info.socket.as_deref().unwrap_or(""));
        self.last_modified = if info.last_modified == 0 {
            now
        } else {
            info.last_modified
        };
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires != 0 && self.expires <= now
    }

    /// Valid and not yet expired.
    pub fn is_live(&self, now: i64) -> bool {
        self.state == ContactState::Valid && !self.is_expired(now)
    }

    pub fn path(&self) -> Option<&str> {
        (!self.path.is_empty()).then_some(self.path.as_str())
    }

    pub fn matches(&self, query: &ContactQuery<'_>, mode: MatchingMode) -> bool {
        if self.state == ContactState::DelayedDelete {
            return false;
        }
        match mode {
            MatchingMode::ContactOnly => self.uri == query.uri,
            MatchingMode::ContactCallId => {
                self.uri == query.uri && self.callid == query.callid.unwrap_or("")
            }
            MatchingMode::ContactPath => match query.path {
                Some(path) => self.uri == query.uri && self.path == path,
                None => self.uri == query.uri,
            },
            MatchingMode::ContactPortIp => host_port(&self.uri) == host_port(query.uri),
        }
    }

    /// A modification is now pending persistence.
    pub fn touch(&mut self) {
        if self.sync == SyncState::Sync {
            self.sync = SyncState::Dirty;
        }
    }

    pub fn pending_write(&self) -> Option<PendingWrite> {
        match self.sync {
            SyncState::New => Some(PendingWrite::Insert),
            SyncState::Dirty => Some(PendingWrite::Update),
            SyncState::Sync => None,
        }
    }

    pub fn mark_synced(&mut self) {
        self.sync = SyncState::Sync;
    }

    /// Whether a row for this contact may exist in storage.
    pub fn is_persisted(&self) -> bool {
        self.sync != SyncState::New
    }
}

/// `host[:port]` part of a contact URI, without scheme, user part or
/// parameters.
pub fn host_port(uri: &str) -> &str {
    let uri = uri.trim_start_matches('<');
    let uri = uri
        .strip_prefix("sips:")
        .or_else(|| uri.strip_prefix("sip:"))
        .or_else(|| uri.strip_prefix("tel:"))
        .unwrap_or(uri);
    let uri = uri.rsplit_once('@').map_or(uri, |(_, host)| host);
    let end = uri.find(&[';', '>', '?'][..]).unwrap_or(uri.len());
    &uri[..end]
}

/// One registered binding. The URI-independent identity (AoR, domain,
/// owning contact-table slot, class) is immutable; everything else sits
/// behind the contact's lock.
pub struct Contact {
    id: u64,
    domain: Arc<str>,
    aor: Arc<str>,
    slot: Option<usize>,
    is_3gpp: bool,
    data: Mutex<ContactData>,
}

impl fmt::Debug for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contact")
            .field("id", &self.id)
            .field("aor", &self.aor)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl Contact {
    pub(crate) fn new(
        id: u64,
        domain: Arc<str>,
        aor: Arc<str>,
        uri: &str,
        info: &ContactInfo,
        slot: Option<usize>,
        now: i64,
    ) -> Self {
        Self {
            id,
            domain,
            aor,
            slot,
            is_3gpp: info.is_3gpp,
            data: Mutex::new(ContactData::new(uri, info, now)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn aor(&self) -> &str {
        &self.aor
    }

    /// Contact-table slot owning this contact; `None` for the transient
    /// contacts built in db-only mode.
    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    pub fn is_3gpp(&self) -> bool {
        self.is_3gpp
    }

    pub(crate) fn data(&self) -> MutexGuard<'_, ContactData> {
        self.data.lock()
    }

    pub fn snapshot(&self) -> ContactData {
        self.data.lock().clone()
    }

    pub fn uri(&self) -> String {
        self.data.lock().uri.clone()
    }

    pub fn state(&self) -> ContactState {
        self.data.lock().state
    }

    pub fn sync_state(&self) -> SyncState {
        self.data.lock().sync
    }

    pub fn refs(&self) -> u32 {
        self.data.lock().refs
    }

    pub fn expires(&self) -> i64 {
        self.data.lock().expires
    }

    pub fn cseq(&self) -> i32 {
        self.data.lock().cseq
    }

    pub fn q(&self) -> Q {
        self.data.lock().q
    }

    pub fn is_live(&self, now: i64) -> bool {
        self.data.lock().is_live(now)
    }

    pub(crate) fn update(&self, info: &ContactInfo, now: i64) {
        let mut data = self.data.lock();
        if let Some(instance) = info.instance.as_deref().filter(|i| !i.is_empty()) {
            assign(&mut data.instance, instance);
        }
        data.apply(info, now);
        data.touch();
    }

    pub fn matches(&self, query: &ContactQuery<'_>, mode: MatchingMode) -> bool {
        self.data.lock().matches(query, mode)
    }
}

/// Forking order: highest q first, ties broken by most recent modification.
/// With `desc_time_order` only recency counts.
pub fn preference_order(a: &ContactData, b: &ContactData, desc_time_order: bool) -> Ordering {
    let recency = b.last_modified.cmp(&a.last_modified);
    if desc_time_order {
        recency
    } else {
        b.q.cmp(&a.q).then(recency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(uri: &str, info: ContactInfo) -> Contact {
        Contact::new(1, "location".into(), "alice@example.com".into(), uri, &info, Some(0), 1000)
    }

    #[test]
    fn test_new_copies_fields() {
        let info = ContactInfo::new(2000)
            .q(Q::from_f64(0.5))
            .callid("abc")
            .cseq(7)
            .user_agent("phone/1.0")
            .received(Source::new("10.0.0.1", 5060, Transport::Udp));
        let c = contact("sip:alice@10.0.0.1:5060", info);
        let data = c.snapshot();
        assert_eq!(data.uri, "sip:alice@10.0.0.1:5060");
        assert_eq!(data.q.millis(), 500);
        assert_eq!(data.callid, "abc");
        assert_eq!(data.last_modified, 1000);
        assert_eq!(data.methods, Methods::all());
        assert_eq!(data.state, ContactState::Valid);
        assert_eq!(data.sync, SyncState::New);
        assert_eq!(data.refs, 0);
        assert_eq!(data.connection_id, None);
    }

    #[test]
    fn test_update_keeps_uri_and_tracks_connection() {
        let c = contact("sip:a@h", ContactInfo::new(10).connection_id(3));
        assert_eq!(c.data().connection_id, Some(3));
        c.update(&ContactInfo::new(20).instance("<urn:uuid:1>"), 1500);
        let data = c.data();
        assert_eq!(data.uri, "sip:a@h");
        assert_eq!(data.instance, "<urn:uuid:1>");
        assert_eq!(data.connection_id, None);
    }

    #[test]
    fn test_update_reuses_buffers_and_keeps_callid() {
        let c = contact("sip:a@h", ContactInfo::new(10).callid("first").path("<sip:longer-proxy>"));
        let capacity = c.data().path.capacity();

        c.update(&ContactInfo::new(20).cseq(3).path("<sip:p>"), 1500);
        let data = c.data();
        assert_eq!(data.callid, "first");
        assert_eq!(data.path, "<sip:p>");
        assert_eq!(data.path.capacity(), capacity);
        assert_eq!(data.expires, 20);
        assert_eq!(data.cseq, 3);
        assert_eq!(data.last_modified, 1500);
    }

    #[test]
    fn test_sync_transitions() {
        let c = contact("sip:a@h", ContactInfo::new(10));
        assert_eq!(c.data().pending_write(), Some(PendingWrite::Insert));
        c.update(&ContactInfo::new(20), 0);
        // Still never written, so still an insert.
        assert_eq!(c.sync_state(), SyncState::New);

        c.data().mark_synced();
        assert_eq!(c.data().pending_write(), None);
        c.update(&ContactInfo::new(30), 0);
        assert_eq!(c.sync_state(), SyncState::Dirty);
        assert_eq!(c.data().pending_write(), Some(PendingWrite::Update));
    }

    #[test]
    fn test_matching_modes() {
        let c = contact(
            "sip:alice@10.0.0.1:5060;transport=udp",
            ContactInfo::new(0).callid("cid").path("<sip:pcscf>"),
        );
        let uri = "sip:alice@10.0.0.1:5060;transport=udp";

        assert!(c.matches(&ContactQuery::new(uri), MatchingMode::ContactOnly));
        assert!(!c.matches(&ContactQuery::new("sip:alice@10.0.0.1"), MatchingMode::ContactOnly));

        assert!(c.matches(&ContactQuery::new(uri).callid("cid"), MatchingMode::ContactCallId));
        assert!(!c.matches(&ContactQuery::new(uri).callid("other"), MatchingMode::ContactCallId));

        assert!(c.matches(&ContactQuery::new(uri), MatchingMode::ContactPath));
        assert!(c.matches(&ContactQuery::new(uri).path("<sip:pcscf>"), MatchingMode::ContactPath));
        assert!(!c.matches(&ContactQuery::new(uri).path("<sip:other>"), MatchingMode::ContactPath));

        assert!(c.matches(
            &ContactQuery::new("<sip:bob@10.0.0.1:5060>"),
            MatchingMode::ContactPortIp
        ));
        assert!(!c.matches(&ContactQuery::new("sip:10.0.0.1:5070"), MatchingMode::ContactPortIp));
    }

    #[test]
    fn test_delayed_delete_never_matches() {
        let c = contact("sip:a@h", ContactInfo::new(0));
        c.data().state = ContactState::DelayedDelete;
        assert!(!c.matches(&ContactQuery::new("sip:a@h"), MatchingMode::ContactOnly));
    }

    #[test]
    fn test_host_port() {
        assert_eq!(host_port("sip:alice@10.0.0.1:5060;ob"), "10.0.0.1:5060");
        assert_eq!(host_port("<sips:[::1]:5061>"), "[::1]:5061");
        assert_eq!(host_port("sip:example.com"), "example.com");
    }

    #[test]
    fn test_source_text_form() {
        let source = Source::new("[2001:db8::1]", 5060, Transport::Tcp);
        assert_eq!(source.to_string(), "tcp:[2001:db8::1]:5060");
        assert_eq!("tcp:[2001:db8::1]:5060".parse::<Source>().unwrap(), source);
        assert!("udp:host".parse::<Source>().is_err());
        assert!("carrier-pigeon:h:1".parse::<Source>().is_err());
    }

    #[test]
    fn test_preference_order() {
        let mut a = contact("sip:a@h", ContactInfo::new(0).q(Q::from_f64(1.0))).snapshot();
        let mut b = contact("sip:b@h", ContactInfo::new(0).q(Q::from_f64(0.5))).snapshot();
        a.last_modified = 10;
        b.last_modified = 20;
        assert_eq!(preference_order(&a, &b, false), Ordering::Less);
        assert_eq!(preference_order(&a, &b, true), Ordering::Greater);
        assert_eq!(Q::from_f64(0.8).to_string(), "0.800");
        assert!(Q::MAX > Q::UNSPECIFIED);
    }
}
