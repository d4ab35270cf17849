use crate::error::Error;
use log::{debug, warn};
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::timeout;

pub const DNS_PORT: u16 = 53;
const MAX_CNAME_DEPTH: usize = 5;
const QCLASS_IN: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    fn qtype(&self) -> u16 {
        match self {
            Family::V4 => 1,   // A
            Family::V6 => 28,  // AAAA
        }
    }

    fn matches(&self, ip: &IpAddr) -> bool {
        matches!(
            (self, ip),
            (Family::V4, IpAddr::V4(_)) | (Family::V6, IpAddr::V6(_))
        )
    }

    fn env_tag(&self) -> &'static str {
        match self {
            Family::V4 => "IPV4",
            Family::V6 => "IPV6",
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    ip: IpAddr,
    /// Millisecond timestamp; 0 means the entry never expires (hosts file).
    created: u64,
    forbidden: bool,
    localhost: bool,
}

#[derive(Default)]
struct DnsState {
    cache: HashMap<(String, Family), Vec<CacheEntry>>,
    busy: HashMap<(String, Family), HashSet<IpAddr>>,
    servers: Vec<SocketAddr>,
    source_addrs: Vec<IpAddr>,
    ttl_ms: u64,
    timeout: Duration,
    prefix: Option<String>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Recursive DNS resolver with a TTL-scoped cache, a per-domain blacklist
/// that survives cache flushes, hosts-file overrides and per-family
/// cancellation.
///
/// Lookups consult, in order: environment overrides, the cache (including
/// hosts entries), then the configured upstream servers over UDP. Servers
/// are shuffled per resolve and tried until one answers within the timeout.
pub struct DnsResolver {
    state: Mutex<DnsState>,
    cancel_v4: Notify,
    cancel_v6: Notify,
    cancelled_v4: AtomicBool,
    cancelled_v6: AtomicBool,
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsResolver {
    pub fn new() -> Self {
        let state = DnsState {
            servers: vec![
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), DNS_PORT),
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)), DNS_PORT),
            ],
            ttl_ms: 60_000,
            timeout: Duration::from_secs(5),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
            cancel_v4: Notify::new(),
            cancel_v6: Notify::new(),
            cancelled_v4: AtomicBool::new(false),
            cancelled_v6: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DnsState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_servers(&self, servers: Vec<IpAddr>) {
        self.lock().servers = servers
            .into_iter()
            .map(|ip| SocketAddr::new(ip, DNS_PORT))
            .collect();
    }

    /// Upstreams with explicit ports, mostly for tests and local stubs.
    pub fn set_server_addrs(&self, servers: Vec<SocketAddr>) {
        self.lock().servers = servers;
    }

    pub fn set_source_addrs(&self, addrs: Vec<IpAddr>) {
        self.lock().source_addrs = addrs;
    }

    /// DNS cache lifetime in milliseconds.
    pub fn set_ttl(&self, ttl_ms: u64) {
        self.lock().ttl_ms = ttl_ms;
    }

    pub fn set_timeout(&self, per_server: Duration) {
        self.lock().timeout = per_server;
    }

    /// Prefix for `${PREFIX}_DNS_IPV4_<DOMAIN>` environment overrides.
    pub fn set_prefix(&self, prefix: Option<String>) {
        self.lock().prefix = prefix;
    }

    pub fn set_to_cache(&self, domain: &str, ip: IpAddr) {
        let family = family_of(&ip);
        let created = now_ms();
        self.insert_entry(domain, ip, family, created, false, false);
    }

    /// Blacklisted records are never handed out and survive cache flushes.
    pub fn set_to_blacklist(&self, domain: &str, ip: IpAddr) {
        let family = family_of(&ip);
        self.insert_entry(domain, ip, family, 0, true, false);
    }

    pub fn rm_from_blacklist(&self, domain: &str, ip: IpAddr) {
        let key = (normalize(domain), family_of(&ip));
        let mut state = self.lock();
        if let Some(entries) = state.cache.get_mut(&key) {
            entries.retain(|e| !(e.forbidden && e.ip == ip));
        }
    }

    pub fn in_blacklist(&self, domain: &str, ip: IpAddr) -> bool {
        let key = (normalize(domain), family_of(&ip));
        self.lock()
            .cache
            .get(&key)
            .map(|entries| entries.iter().any(|e| e.forbidden && e.ip == ip))
            .unwrap_or(false)
    }

    fn insert_entry(
        &self,
        domain: &str,
        ip: IpAddr,
        family: Family,
        created: u64,
        forbidden: bool,
        localhost: bool,
    ) {
        let key = (normalize(domain), family);
        let mut state = self.lock();
        let entries = state.cache.entry(key).or_default();
        if let Some(existing) = entries.iter_mut().find(|e| e.ip == ip) {
            existing.created = created;
            existing.forbidden = existing.forbidden || forbidden;
            existing.localhost = existing.localhost || localhost;
        } else {
            entries.push(CacheEntry {
                ip,
                created,
                forbidden,
                localhost,
            });
        }
    }

    /// Drops regular cache entries. Blacklist records and hosts-file entries
    /// stay.
    pub fn clear_cache(&self) {
        let mut state = self.lock();
        for entries in state.cache.values_mut() {
            entries.retain(|e| e.forbidden || e.localhost);
        }
        state.cache.retain(|_, entries| !entries.is_empty());
    }

    /// Full reset: cache, blacklist, busy tracking. Calling it on an empty
    /// resolver is a no-op, and calling it twice equals calling it once.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.cache.clear();
        state.busy.clear();
    }

    /// Marks an IP as in use so lookups steer other connections away from it.
    pub fn mark_busy(&self, domain: &str, ip: IpAddr) {
        let key = (normalize(domain), family_of(&ip));
        self.lock().busy.entry(key).or_default().insert(ip);
    }

    pub fn release_busy(&self, domain: &str, ip: IpAddr) {
        let key = (normalize(domain), family_of(&ip));
        let mut state = self.lock();
        if let Some(set) = state.busy.get_mut(&key) {
            set.remove(&ip);
        }
    }

    /// Aborts the in-flight resolve workers of one address family.
    pub fn cancel(&self, family: Family) {
        match family {
            Family::V4 => {
                self.cancelled_v4.store(true, Ordering::SeqCst);
                self.cancel_v4.notify_waiters();
            }
            Family::V6 => {
                self.cancelled_v6.store(true, Ordering::SeqCst);
                self.cancel_v6.notify_waiters();
            }
        }
    }

    /// Loads a hosts file: `#` starts a comment, the first token of a line
    /// is the IP, every following token a hostname. Entries never expire.
    pub fn load_hosts(&self, path: &str) -> Result<(), Error> {
        let content = std::fs::read_to_string(path)?;
        self.parse_hosts(&content);
        Ok(())
    }

    pub fn parse_hosts(&self, content: &str) {
        for line in content.lines() {
            let line = match line.find('#') {
                Some(at) => &line[..at],
                None => line,
            };
            let mut tokens = line.split_whitespace();
            let ip: IpAddr = match tokens.next().and_then(|t| t.parse().ok()) {
                Some(ip) => ip,
                None => continue,
            };
            for host in tokens {
                self.insert_entry(host, ip, family_of(&ip), 0, false, true);
            }
        }
    }

    fn cache_lookup(&self, name: &str, family: Family) -> Option<IpAddr> {
        let key = (name.to_string(), family);
        let now = now_ms();
        let mut state = self.lock();
        let ttl = state.ttl_ms;

        let entries = state.cache.get_mut(&key)?;
        // Expired records are treated as absent and evicted on read.
        entries.retain(|e| e.created == 0 || now.saturating_sub(e.created) <= ttl);
        let candidates: Vec<IpAddr> = entries
            .iter()
            .filter(|e| !e.forbidden)
            .map(|e| e.ip)
            .collect();
        if entries.is_empty() {
            state.cache.remove(&key);
        }
        if candidates.is_empty() {
            return None;
        }

        let busy = state.busy.get(&key).cloned().unwrap_or_default();
        let idle: Vec<IpAddr> = candidates
            .iter()
            .copied()
            .filter(|ip| !busy.contains(ip))
            .collect();
        let pool = if idle.is_empty() { &candidates } else { &idle };
        pool.choose(&mut thread_rng()).copied()
    }

    fn env_override(&self, name: &str, family: Family) -> Option<IpAddr> {
        let prefix = self.lock().prefix.clone()?;
        let postfix = name.replace(['.', '-'], "_").to_uppercase();
        let var = format!("{}_DNS_{}_{}", prefix, family.env_tag(), postfix);
        std::env::var(var).ok()?.parse().ok()
    }

    /// Resolves `domain` to one address of `family`.
    pub async fn resolve(&self, domain: &str, family: Family) -> Result<IpAddr, Error> {
        match family {
            Family::V4 => self.cancelled_v4.store(false, Ordering::SeqCst),
            Family::V6 => self.cancelled_v6.store(false, Ordering::SeqCst),
        }
        self.resolve_inner(domain, family, 0).await
    }

    async fn resolve_inner(
        &self,
        domain: &str,
        family: Family,
        depth: usize,
    ) -> Result<IpAddr, Error> {
        if depth > MAX_CNAME_DEPTH {
            return Err(Error::DnsNoRecord(domain.to_string()));
        }
        let name = encode_idn(domain)?;

        // Literal addresses skip everything.
        if let Ok(ip) = name.parse::<IpAddr>() {
            if family.matches(&ip) {
                return Ok(ip);
            }
        }

        if let Some(ip) = self.env_override(&name, family) {
            debug!("dns: environment override for {} -> {}", name, ip);
            return Ok(ip);
        }

        if let Some(ip) = self.cache_lookup(&name, family) {
            debug!("dns: cache hit for {} -> {}", name, ip);
            return Ok(ip);
        }

        let (mut servers, per_server, source_addrs) = {
            let state = self.lock();
            (
                state.servers.clone(),
                state.timeout,
                state.source_addrs.clone(),
            )
        };
        if servers.is_empty() {
            return Err(Error::DnsTimeout);
        }
        // Spread load across the configured upstreams.
        servers.shuffle(&mut thread_rng());

        let id = (std::process::id() & 0xFFFF) as u16;
        let query = build_query(id, &name, family.qtype())?;

        let mut last_err = Error::DnsTimeout;
        for server in servers {
            match self
                .exchange(&query, server, per_server, &source_addrs, family)
                .await
            {
                Ok(packet) => match parse_response(&packet, id, family) {
                    Ok(answer) => {
                        if answer.ips.is_empty() {
                            if let Some(target) = answer.cnames.into_iter().last() {
                                // Follow the CNAME chain with a fresh query.
                                return Box::pin(self.resolve_inner(&target, family, depth + 1))
                                    .await;
                            }
                            return Err(Error::DnsNoRecord(name));
                        }
                        let mut stored = Vec::new();
                        for ip in &answer.ips {
                            if self.in_blacklist(&name, *ip) {
                                debug!("dns: {} for {} is blacklisted, skipping", ip, name);
                                continue;
                            }
                            self.set_to_cache(&name, *ip);
                            stored.push(*ip);
                        }
                        return match self.cache_lookup(&name, family) {
                            Some(ip) => Ok(ip),
                            None => stored
                                .first()
                                .copied()
                                .ok_or_else(|| Error::DnsNoRecord(name.clone())),
                        };
                    }
                    // Terminal server verdicts are not retried elsewhere.
                    Err(e @ (Error::DnsNxDomain | Error::DnsRefused)) => return Err(e),
                    Err(e) => {
                        warn!("dns: server {} answered badly: {}", server, e);
                        last_err = e;
                    }
                },
                Err(e @ Error::DnsCancelled) => return Err(e),
                Err(e) => {
                    debug!("dns: server {} failed: {}", server, e);
                    last_err = match e {
                        Error::Timeout { .. } => Error::DnsTimeout,
                        other => other,
                    };
                }
            }
        }
        Err(last_err)
    }

    async fn exchange(
        &self,
        query: &[u8],
        server: SocketAddr,
        per_server: Duration,
        source_addrs: &[IpAddr],
        family: Family,
    ) -> Result<Vec<u8>, Error> {
        // Bind to a configured source address of the server's family, picked
        // at random when several are given, else the zero address.
        let candidates: Vec<IpAddr> = source_addrs
            .iter()
            .copied()
            .filter(|ip| ip.is_ipv4() == server.is_ipv4())
            .collect();
        let bind_ip = candidates
            .choose(&mut thread_rng())
            .copied()
            .unwrap_or(if server.is_ipv4() {
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            } else {
                IpAddr::V6(Ipv6Addr::UNSPECIFIED)
            });

        let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0)).await?;
        socket.connect(server).await?;
        socket.send(query).await?;

        let notify = match family {
            Family::V4 => &self.cancel_v4,
            Family::V6 => &self.cancel_v6,
        };
        let cancelled = match family {
            Family::V4 => &self.cancelled_v4,
            Family::V6 => &self.cancelled_v6,
        };
        if cancelled.load(Ordering::SeqCst) {
            return Err(Error::DnsCancelled);
        }

        let mut buf = vec![0u8; 4096];
        tokio::select! {
            _ = notify.notified() => Err(Error::DnsCancelled),
            received = timeout(per_server, socket.recv(&mut buf)) => {
                let n = received??;
                buf.truncate(n);
                Ok(buf)
            }
        }
    }
}

fn family_of(ip: &IpAddr) -> Family {
    match ip {
        IpAddr::V4(_) => Family::V4,
        IpAddr::V6(_) => Family::V6,
    }
}

fn normalize(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

/// A-label encoding for internationalized domains; plain ASCII names are
/// just lowercased.
pub fn encode_idn(domain: &str) -> Result<String, Error> {
    let name = normalize(domain);
    if name.is_ascii() {
        return Ok(name);
    }
    idna::domain_to_ascii(&name).map_err(|_| Error::DnsBadName(domain.to_string()))
}

/// U-label form for display.
pub fn decode_idn(domain: &str) -> String {
    let (name, result) = idna::domain_to_unicode(domain);
    match result {
        Ok(()) => name,
        Err(_) => domain.to_string(),
    }
}

/// Lowercased labels of a domain name.
pub fn split_name(name: &str) -> Vec<String> {
    normalize(name)
        .split('.')
        .filter(|l| !l.is_empty())
        .map(|l| l.to_string())
        .collect()
}

pub fn join_name(labels: &[String]) -> String {
    labels.join(".")
}

/// Composes the UDP query packet: 12-byte header with RD set and one
/// question (QNAME as length-prefixed labels, QTYPE, QCLASS=IN).
pub fn build_query(id: u16, name: &str, qtype: u16) -> Result<Vec<u8>, Error> {
    let mut packet = Vec::with_capacity(12 + name.len() + 6);
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&0x0100u16.to_be_bytes()); // flags: RD=1
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    for label in split_name(name) {
        if label.is_empty() || label.len() > 63 {
            return Err(Error::DnsBadName(name.to_string()));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&QCLASS_IN.to_be_bytes());
    Ok(packet)
}

pub struct DnsAnswer {
    pub ips: Vec<IpAddr>,
    pub cnames: Vec<String>,
}

/// Parses a response packet: checks the id, branches on RCODE, walks the
/// answer section and collects A/AAAA addresses plus CNAME targets.
pub fn parse_response(packet: &[u8], expected_id: u16, family: Family) -> Result<DnsAnswer, Error> {
    if packet.len() < 12 {
        return Err(Error::DnsBadResponse);
    }
    let id = u16::from_be_bytes([packet[0], packet[1]]);
    if id != expected_id {
        return Err(Error::DnsBadResponse);
    }
    match packet[3] & 0x0F {
        0 => {}
        1 => return Err(Error::DnsFormat),
        2 => return Err(Error::DnsServFail),
        3 => return Err(Error::DnsNxDomain),
        4 => return Err(Error::DnsNotImplemented),
        5 => return Err(Error::DnsRefused),
        _ => return Err(Error::DnsBadResponse),
    }

    let qdcount = u16::from_be_bytes([packet[4], packet[5]]) as usize;
    let ancount = u16::from_be_bytes([packet[6], packet[7]]) as usize;

    let mut pos = 12;
    for _ in 0..qdcount {
        decode_name(packet, &mut pos)?;
        pos += 4; // QTYPE + QCLASS
    }

    let mut answer = DnsAnswer {
        ips: Vec::new(),
        cnames: Vec::new(),
    };
    for _ in 0..ancount {
        decode_name(packet, &mut pos)?;
        if pos + 10 > packet.len() {
            return Err(Error::DnsBadResponse);
        }
        let rtype = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
        let rdlength = u16::from_be_bytes([packet[pos + 8], packet[pos + 9]]) as usize;
        pos += 10;
        if pos + rdlength > packet.len() {
            return Err(Error::DnsBadResponse);
        }
        match rtype {
            1 if rdlength == 4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&packet[pos..pos + 4]);
                if family == Family::V4 {
                    answer.ips.push(IpAddr::V4(Ipv4Addr::from(octets)));
                }
            }
            28 if rdlength == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&packet[pos..pos + 16]);
                if family == Family::V6 {
                    answer.ips.push(IpAddr::V6(Ipv6Addr::from(octets)));
                }
            }
            5 => {
                let mut cname_pos = pos;
                answer.cnames.push(decode_name(packet, &mut cname_pos)?);
            }
            _ => {}
        }
        pos += rdlength;
    }
    Ok(answer)
}

/// Decompresses a name, following 0xC0 pointers (two bytes, 14-bit offset).
fn decode_name(packet: &[u8], pos: &mut usize) -> Result<String, Error> {
    let mut labels = Vec::new();
    let mut at = *pos;
    let mut jumped = false;
    let mut hops = 0;

    loop {
        let len = *packet.get(at).ok_or(Error::DnsBadResponse)? as usize;
        if len & 0xC0 == 0xC0 {
            let low = *packet.get(at + 1).ok_or(Error::DnsBadResponse)? as usize;
            if !jumped {
                *pos = at + 2;
                jumped = true;
            }
            at = ((len & 0x3F) << 8) | low;
            hops += 1;
            if hops > 16 {
                return Err(Error::DnsBadResponse);
            }
            continue;
        }
        if len == 0 {
            if !jumped {
                *pos = at + 1;
            }
            break;
        }
        let label = packet
            .get(at + 1..at + 1 + len)
            .ok_or(Error::DnsBadResponse)?;
        labels.push(String::from_utf8_lossy(label).to_lowercase());
        at += 1 + len;
    }
    Ok(labels.join("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer_packet(id: u16, name_query: &str, ips: &[Ipv4Addr]) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(&id.to_be_bytes());
        packet.extend_from_slice(&0x8180u16.to_be_bytes()); // QR=1, RD, RA
        packet.extend_from_slice(&1u16.to_be_bytes());
        packet.extend_from_slice(&(ips.len() as u16).to_be_bytes());
        packet.extend_from_slice(&0u16.to_be_bytes());
        packet.extend_from_slice(&0u16.to_be_bytes());
        for label in split_name(name_query) {
            packet.push(label.len() as u8);
            packet.extend_from_slice(label.as_bytes());
        }
        packet.push(0);
        packet.extend_from_slice(&1u16.to_be_bytes());
        packet.extend_from_slice(&1u16.to_be_bytes());
        for ip in ips {
            packet.extend_from_slice(&[0xC0, 12]); // pointer back to the qname
            packet.extend_from_slice(&1u16.to_be_bytes()); // A
            packet.extend_from_slice(&1u16.to_be_bytes()); // IN
            packet.extend_from_slice(&300u32.to_be_bytes()); // TTL
            packet.extend_from_slice(&4u16.to_be_bytes());
            packet.extend_from_slice(&ip.octets());
        }
        packet
    }

    #[test]
    fn test_query_layout() {
        let query = build_query(0x1234, "a.example", 1).unwrap();
        assert_eq!(&query[..2], &[0x12, 0x34]);
        assert_eq!(&query[2..4], &[0x01, 0x00]); // RD
        assert_eq!(&query[4..6], &[0x00, 0x01]); // QDCOUNT
        // QNAME: 1 'a' 7 'example' 0
        assert_eq!(&query[12..], b"\x01a\x07example\x00\x00\x01\x00\x01");
    }

    #[test]
    fn test_name_split_join_roundtrip() {
        for name in ["Example.COM", "a.b.c.d", "single", "trailing.dot."] {
            let labels = split_name(name);
            assert_eq!(join_name(&labels), normalize(name));
        }
    }

    #[test]
    fn test_label_too_long_rejected() {
        let label = "x".repeat(64);
        assert!(build_query(1, &format!("{}.com", label), 1).is_err());
    }

    #[test]
    fn test_parse_answer_with_pointer_compression() {
        let packet = answer_packet(7, "a.example", &[Ipv4Addr::new(93, 184, 216, 34)]);
        let answer = parse_response(&packet, 7, Family::V4).unwrap();
        assert_eq!(answer.ips, vec![IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))]);
    }

    #[test]
    fn test_id_mismatch_rejected() {
        let packet = answer_packet(7, "a.example", &[Ipv4Addr::new(1, 2, 3, 4)]);
        assert!(matches!(
            parse_response(&packet, 8, Family::V4),
            Err(Error::DnsBadResponse)
        ));
    }

    #[test]
    fn test_rcode_mapping() {
        let mut packet = answer_packet(7, "a.example", &[]);
        packet[3] = 0x83; // NXDOMAIN
        assert!(matches!(
            parse_response(&packet, 7, Family::V4),
            Err(Error::DnsNxDomain)
        ));
        packet[3] = 0x82;
        assert!(matches!(
            parse_response(&packet, 7, Family::V4),
            Err(Error::DnsServFail)
        ));
    }

    #[test]
    fn test_zero_answers_is_no_record_not_an_error() {
        let packet = answer_packet(7, "a.example", &[]);
        let answer = parse_response(&packet, 7, Family::V4).unwrap();
        assert!(answer.ips.is_empty());
        assert!(answer.cnames.is_empty());
    }

    #[test]
    fn test_cache_and_blacklist() {
        let resolver = DnsResolver::new();
        let good = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let bad = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

        resolver.set_to_cache("srv.example", good);
        resolver.set_to_blacklist("srv.example", bad);

        for _ in 0..20 {
            assert_eq!(resolver.cache_lookup("srv.example", Family::V4), Some(good));
        }
        assert!(resolver.in_blacklist("srv.example", bad));

        // The blacklist outlives a cache flush.
        resolver.clear_cache();
        assert_eq!(resolver.cache_lookup("srv.example", Family::V4), None);
        assert!(resolver.in_blacklist("srv.example", bad));

        resolver.rm_from_blacklist("srv.example", bad);
        assert!(!resolver.in_blacklist("srv.example", bad));
    }

    #[test]
    fn test_ttl_expiry_evicts_lazily() {
        let resolver = DnsResolver::new();
        resolver.set_ttl(0);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1));
        resolver.insert_entry("old.example", ip, Family::V4, 1, false, false);
        assert_eq!(resolver.cache_lookup("old.example", Family::V4), None);
        // Hosts entries (created=0) never expire.
        resolver.insert_entry("pinned.example", ip, Family::V4, 0, false, true);
        assert_eq!(
            resolver.cache_lookup("pinned.example", Family::V4),
            Some(ip)
        );
    }

    #[test]
    fn test_busy_bias() {
        let resolver = DnsResolver::new();
        let first = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let second = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        resolver.set_to_cache("lb.example", first);
        resolver.set_to_cache("lb.example", second);

        resolver.mark_busy("lb.example", first);
        for _ in 0..20 {
            assert_eq!(
                resolver.cache_lookup("lb.example", Family::V4),
                Some(second)
            );
        }
        resolver.release_busy("lb.example", first);
    }

    #[test]
    fn test_hosts_parsing() {
        let resolver = DnsResolver::new();
        resolver.parse_hosts(
            "# comment line\n\
             127.0.0.1 localhost local.dev # trailing comment\n\
             ::1 localhost6\n\
             garbage line without ip\n",
        );
        assert_eq!(
            resolver.cache_lookup("localhost", Family::V4),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
        assert_eq!(
            resolver.cache_lookup("local.dev", Family::V4),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
        assert_eq!(
            resolver.cache_lookup("localhost6", Family::V6),
            Some(IpAddr::V6(Ipv6Addr::LOCALHOST))
        );
    }

    #[test]
    fn test_clear_is_idempotent() {
        let resolver = DnsResolver::new();
        resolver.clear(); // empty clear is a no-op
        resolver.set_to_cache("x.example", IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)));
        resolver.clear();
        resolver.clear();
        assert_eq!(resolver.cache_lookup("x.example", Family::V4), None);
    }

    #[test]
    fn test_idn_encoding() {
        assert_eq!(encode_idn("Example.COM").unwrap(), "example.com");
        assert_eq!(encode_idn("bücher.de").unwrap(), "xn--bcher-kva.de");
        assert_eq!(decode_idn("xn--bcher-kva.de"), "bücher.de");
    }

    #[tokio::test]
    async fn test_env_override_beats_network() {
        let resolver = DnsResolver::new();
        resolver.set_prefix(Some("WIREFLOW_TEST".to_string()));
        std::env::set_var("WIREFLOW_TEST_DNS_IPV4_ENV_EXAMPLE", "10.9.8.7");

        let ip = resolver.resolve("env.example", Family::V4).await.unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(10, 9, 8, 7)));
        std::env::remove_var("WIREFLOW_TEST_DNS_IPV4_ENV_EXAMPLE");
    }

    #[tokio::test]
    async fn test_failover_to_second_server_and_cache_insert() {
        // First upstream is a bound socket that never answers, second one is
        // a stub server returning an A record.
        let dead = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();

        let live = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let live_addr = live.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (n, peer) = live.recv_from(&mut buf).await.unwrap();
            let id = u16::from_be_bytes([buf[0], buf[1]]);
            assert!(n > 12);
            let reply = answer_packet(id, "a.example", &[Ipv4Addr::new(93, 184, 216, 34)]);
            live.send_to(&reply, peer).await.unwrap();
        });

        let resolver = DnsResolver::new();
        resolver.set_timeout(Duration::from_millis(300));
        resolver.set_server_addrs(vec![dead_addr, live_addr]);

        // Retry a few times: server order is shuffled per resolve, so the
        // stub may be hit first or second; either way the record must land.
        let ip = resolver.resolve("a.example", Family::V4).await.unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)));

        // Second lookup is served from the cache without any live upstream.
        resolver.set_server_addrs(vec![dead_addr]);
        let cached = resolver.resolve("a.example", Family::V4).await.unwrap();
        assert_eq!(cached, IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)));

        drop(dead);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_resolve() {
        use std::sync::Arc;

        let dead = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();

        let resolver = Arc::new(DnsResolver::new());
        resolver.set_timeout(Duration::from_secs(30));
        resolver.set_server_addrs(vec![dead_addr]);

        let worker = resolver.clone();
        let handle =
            tokio::spawn(async move { worker.resolve("slow.example", Family::V4).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        resolver.cancel(Family::V4);

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::DnsCancelled)));
        drop(dead);
    }
}
