//! ICMP transport: send one Echo Request and correlate exactly one reply.
//!
//! Keeps the raw-socket handling this module had under the teacher
//! (`socket2::Socket` construction, manual packet framing, manual checksum)
//! but replaces polling `collect_responses` with an async, readiness-driven
//! receive path so concurrent `probe()` calls from many sessions can share
//! one socket per address family without busy-waiting.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::sync::oneshot;

use crate::error::ProbeError;

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_DEST_UNREACHABLE: u8 = 3;
const ICMP_TIME_EXCEEDED: u8 = 11;

const ICMP6_DEST_UNREACHABLE: u8 = 1;
const ICMP6_ECHO_REQUEST: u8 = 128;
const ICMP6_ECHO_REPLY: u8 = 129;
const ICMP6_TIME_EXCEEDED: u8 = 3;

const MAX_PACKET: usize = 1500;

/// Kind of ICMP response a probe resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    EchoReply,
    TimeExceeded,
    Unreachable,
    OtherIcmp(u8),
    Timeout,
    SendError,
}

impl OutcomeKind {
    /// Only `timeout` and `send_error` count as loss for hop-statistics
    /// purposes; an ICMP error reply is a response, not a loss.
    pub fn is_loss(self) -> bool {
        matches!(self, OutcomeKind::Timeout | OutcomeKind::SendError)
    }

    /// Only replies that completed a round trip carry a meaningful RTT.
    pub fn carries_rtt(self) -> bool {
        matches!(self, OutcomeKind::EchoReply | OutcomeKind::TimeExceeded)
    }
}

/// The result of a single Echo Request.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub responder: Option<IpAddr>,
    pub rtt: Option<Duration>,
    pub kind: OutcomeKind,
    pub ttl: u8,
    pub sequence: u16,
    pub sent_at: Instant,
    pub received_at: Option<Instant>,
    /// Set when `kind == SendError` and the OS rejected the send for a
    /// permanent reason (permission revoked) rather than a transient one.
    /// A `TraceSession` treats this as `transport_fatal` and stops probing
    /// further TTLs.
    pub fatal: bool,
}

/// Seam `TraceSession` probes through, so tests can script deterministic
/// ICMP outcomes without a raw socket. Hand-rolled boxed-future trait,
/// matching the style already used for `SessionRunner` and `Sink` rather
/// than pulling in `async_trait` for one more seam.
pub trait ProbeSource: Send + Sync {
    fn supports(&self, target: IpAddr) -> bool;

    fn probe(
        &self,
        target: IpAddr,
        ttl: u8,
        timeout: Duration,
        sequence_hint: Option<u16>,
    ) -> Pin<Box<dyn Future<Output = ProbeOutcome> + Send + '_>>;
}

impl ProbeSource for Transport {
    fn supports(&self, target: IpAddr) -> bool {
        Transport::supports(self, target)
    }

    fn probe(
        &self,
        target: IpAddr,
        ttl: u8,
        timeout: Duration,
        sequence_hint: Option<u16>,
    ) -> Pin<Box<dyn Future<Output = ProbeOutcome> + Send + '_>> {
        Box::pin(Transport::probe(self, target, ttl, timeout, sequence_hint))
    }
}

struct CorrelatedReply {
    responder: IpAddr,
    kind: OutcomeKind,
    received_at: Instant,
}

struct FamilySocket {
    fd: AsyncFd<Socket>,
    pending: Mutex<HashMap<u16, oneshot::Sender<CorrelatedReply>>>,
}

impl FamilySocket {
    fn new(socket: Socket) -> std::io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            fd: AsyncFd::new(socket)?,
            pending: Mutex::new(HashMap::new()),
        })
    }
}

/// Sends ICMP Echo Requests and correlates replies by identifier + sequence.
///
/// Thread-safe: may be called by multiple [`crate::session::TraceSession`]s
/// concurrently. Internally this shares one raw socket per address family
/// (IPv4 mandatory, IPv6 best-effort) rather than opening one socket per
/// probe, bounding file-descriptor use regardless of concurrency.
pub struct Transport {
    identifier: u16,
    next_sequence: AtomicU16,
    v4: Arc<FamilySocket>,
    v6: Option<Arc<FamilySocket>>,
}

impl Transport {
    /// Opens the raw ICMPv4 socket (required) and ICMPv6 socket (optional,
    /// IPv6 support is disabled rather than fatal if it fails) and spawns a
    /// background receive loop per socket that lives for the process.
    pub fn new() -> Result<Self, ProbeError> {
        let v4_socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).map_err(
            |e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => ProbeError::PermissionDenied,
                _ => ProbeError::Io(e),
            },
        )?;
        let v4 = Arc::new(FamilySocket::new(v4_socket)?);

        let v6 = match Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6)) {
            Ok(socket) => match FamilySocket::new(socket) {
                Ok(fs) => {
                    tracing::info!("IPv6 ICMP socket created");
                    Some(Arc::new(fs))
                }
                Err(e) => {
                    tracing::warn!("IPv6 ICMP socket setup failed, disabling IPv6: {e}");
                    None
                }
            },
            Err(e) => {
                tracing::warn!("IPv6 ICMP socket creation failed, disabling IPv6: {e}");
                None
            }
        };

        spawn_receiver(v4.clone(), false);
        if let Some(ref v6) = v6 {
            spawn_receiver(v6.clone(), true);
        }

        Ok(Self {
            identifier: std::process::id() as u16,
            next_sequence: AtomicU16::new(0),
            v4,
            v6,
        })
    }

    fn alloc_sequence(&self, hint: Option<u16>) -> u16 {
        hint.unwrap_or_else(|| self.next_sequence.fetch_add(1, Ordering::Relaxed))
    }

    /// Whether `target`'s address family has a usable socket.
    pub fn supports(&self, target: IpAddr) -> bool {
        match target {
            IpAddr::V4(_) => true,
            IpAddr::V6(_) => self.v6.is_some(),
        }
    }

    /// Send one Echo Request at `ttl` to `target` and wait up to `timeout`
    /// for the correlated reply.
    pub async fn probe(
        &self,
        target: IpAddr,
        ttl: u8,
        timeout: Duration,
        sequence_hint: Option<u16>,
    ) -> ProbeOutcome {
        let sequence = self.alloc_sequence(sequence_hint);
        let sent_at = Instant::now();

        let family = match target {
            IpAddr::V4(_) => Some(&self.v4),
            IpAddr::V6(_) => self.v6.as_ref(),
        };

        let Some(family) = family else {
            return ProbeOutcome {
                responder: None,
                rtt: None,
                kind: OutcomeKind::SendError,
                ttl,
                sequence,
                sent_at,
                received_at: None,
                fatal: false,
            };
        };

        let (tx, rx) = oneshot::channel();
        family.pending.lock().insert(sequence, tx);

        if let Err(e) = send_echo_request(family, target, ttl, self.identifier, sequence) {
            family.pending.lock().remove(&sequence);
            let fatal = e.kind() == std::io::ErrorKind::PermissionDenied;
            tracing::debug!("send_error for seq={sequence} ttl={ttl} target={target}: {e}");
            return ProbeOutcome {
                responder: None,
                rtt: None,
                kind: OutcomeKind::SendError,
                ttl,
                sequence,
                sent_at,
                received_at: None,
                fatal,
            };
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => ProbeOutcome {
                responder: Some(reply.responder),
                rtt: reply.kind.carries_rtt().then(|| reply.received_at - sent_at),
                kind: reply.kind,
                ttl,
                sequence,
                sent_at,
                received_at: Some(reply.received_at),
                fatal: false,
            },
            _ => {
                family.pending.lock().remove(&sequence);
                ProbeOutcome {
                    responder: None,
                    rtt: None,
                    kind: OutcomeKind::Timeout,
                    ttl,
                    sequence,
                    sent_at,
                    received_at: None,
                    fatal: false,
                }
            }
        }
    }
}

#[cfg(test)]
impl Transport {
    /// Build a `Transport` backed by an ordinary UDP socket instead of a raw
    /// ICMP socket, for tests that need a valid handle to thread through a
    /// call site (e.g. the scheduler's worker pool) without `CAP_NET_RAW`
    /// and without ever calling `probe` on it.
    pub(crate) fn test_stub() -> Self {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, None).expect("udp socket for test stub");
        let v4 = Arc::new(FamilySocket::new(socket).expect("non-blocking setup for test stub"));
        Self {
            identifier: 0,
            next_sequence: AtomicU16::new(0),
            v4,
            v6: None,
        }
    }
}

fn send_echo_request(
    family: &FamilySocket,
    target: IpAddr,
    ttl: u8,
    identifier: u16,
    sequence: u16,
) -> std::io::Result<()> {
    let dest = SocketAddr::new(target, 0);
    match target {
        IpAddr::V4(_) => {
            family.fd.get_ref().set_ttl(ttl.into())?;
            let packet = build_icmpv4_echo(identifier, sequence);
            family.fd.get_ref().send_to(&packet, &dest.into())?;
        }
        IpAddr::V6(_) => {
            family.fd.get_ref().set_unicast_hops_v6(ttl.into())?;
            let packet = build_icmpv6_echo(identifier, sequence);
            family.fd.get_ref().send_to(&packet, &dest.into())?;
        }
    }
    Ok(())
}

fn spawn_receiver(family: Arc<FamilySocket>, is_v6: bool) {
    tokio::spawn(async move {
        let mut buf = [0u8; MAX_PACKET];
        loop {
            let mut guard = match family.fd.readable().await {
                Ok(g) => g,
                Err(e) => {
                    tracing::warn!("ICMP receive poll error: {e}");
                    continue;
                }
            };

            let recv = guard.try_io(|inner| {
                let socket = inner.get_ref();
                let mut uninit = [std::mem::MaybeUninit::<u8>::uninit(); MAX_PACKET];
                match socket.recv_from(&mut uninit) {
                    Ok((len, addr)) => {
                        for i in 0..len {
                            buf[i] = unsafe { uninit[i].assume_init() };
                        }
                        Ok((len, addr))
                    }
                    Err(e) => Err(e),
                }
            });

            let (len, addr) = match recv {
                Ok(Ok(v)) => v,
                Ok(Err(e)) => {
                    tracing::debug!("ICMP recv_from error: {e}");
                    continue;
                }
                Err(_would_block) => continue,
            };

            let parsed = if is_v6 {
                parse_icmpv6(&buf[..len], addr.as_socket())
            } else {
                parse_icmpv4(&buf[..len])
            };

            let Some((sequence, reply)) = parsed else {
                continue;
            };

            if let Some(tx) = family.pending.lock().remove(&sequence) {
                let _ = tx.send(reply);
            }
        }
    });
}

fn build_icmpv4_echo(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 16];
    packet[0] = ICMP_ECHO_REQUEST;
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    write_timestamp_payload(&mut packet[8..16]);

    let checksum = internet_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

fn build_icmpv6_echo(identifier: u16, sequence: u16) -> Vec<u8> {
    // The kernel computes the ICMPv6 pseudo-header checksum for us.
    let mut packet = vec![0u8; 16];
    packet[0] = ICMP6_ECHO_REQUEST;
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    write_timestamp_payload(&mut packet[8..16]);
    packet
}

fn write_timestamp_payload(slot: &mut [u8]) {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    slot.copy_from_slice(&nanos.to_be_bytes());
}

fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            (chunk[0] as u16) << 8
        };
        sum += word as u32;
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Parse an inbound IPv4 ICMP datagram (IP header still attached, as
/// delivered by a raw `SOCK_RAW`/`IPPROTO_ICMP` socket on Linux).
fn parse_icmpv4(buf: &[u8]) -> Option<(u16, CorrelatedReply)> {
    if buf.len() < 28 {
        return None;
    }
    let ip_header_len = ((buf[0] & 0x0f) as usize) * 4;
    if buf.len() < ip_header_len + 8 {
        return None;
    }
    let source = Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]);
    let icmp = &buf[ip_header_len..];
    let icmp_type = icmp[0];

    let (kind, sequence) = match icmp_type {
        ICMP_ECHO_REPLY => (OutcomeKind::EchoReply, seq_from_echo(icmp)?),
        ICMP_TIME_EXCEEDED => (OutcomeKind::TimeExceeded, seq_from_embedded_v4(icmp)?),
        ICMP_DEST_UNREACHABLE => (OutcomeKind::Unreachable, seq_from_embedded_v4(icmp)?),
        other => (OutcomeKind::OtherIcmp(other), seq_from_embedded_v4(icmp)?),
    };

    Some((
        sequence,
        CorrelatedReply {
            responder: IpAddr::V4(source),
            kind,
            received_at: Instant::now(),
        },
    ))
}

/// Parse an inbound IPv6 ICMP datagram. On most platforms a raw
/// `IPPROTO_ICMPV6` socket delivers only the ICMPv6 message, without the
/// IPv6 header, so the source address comes from the socket address instead.
fn parse_icmpv6(buf: &[u8], addr: Option<SocketAddr>) -> Option<(u16, CorrelatedReply)> {
    if buf.len() < 8 {
        return None;
    }
    let icmp_type = buf[0];

    let (kind, sequence) = match icmp_type {
        ICMP6_ECHO_REPLY => (OutcomeKind::EchoReply, seq_from_echo(buf)?),
        ICMP6_TIME_EXCEEDED => (OutcomeKind::TimeExceeded, seq_from_embedded_v6(buf)?),
        ICMP6_DEST_UNREACHABLE => (OutcomeKind::Unreachable, seq_from_embedded_v6(buf)?),
        other => (OutcomeKind::OtherIcmp(other), seq_from_embedded_v6(buf)?),
    };

    let responder = match addr? {
        SocketAddr::V6(v6) => IpAddr::V6(*v6.ip()),
        SocketAddr::V4(v4) => IpAddr::V4(*v4.ip()),
    };

    Some((
        sequence,
        CorrelatedReply {
            responder,
            kind,
            received_at: Instant::now(),
        },
    ))
}

fn seq_from_echo(icmp: &[u8]) -> Option<u16> {
    (icmp.len() >= 8).then(|| u16::from_be_bytes([icmp[6], icmp[7]]))
}

/// `time_exceeded`/`unreachable` messages reflect the original IPv4 header +
/// first 8 bytes of the original ICMP datagram in their payload.
fn seq_from_embedded_v4(icmp: &[u8]) -> Option<u16> {
    if icmp.len() < 8 + 20 + 8 {
        return None;
    }
    let inner_ip_header_len = ((icmp[8] & 0x0f) as usize) * 4;
    let inner_icmp = 8 + inner_ip_header_len;
    if icmp.len() < inner_icmp + 8 {
        return None;
    }
    Some(u16::from_be_bytes([icmp[inner_icmp + 6], icmp[inner_icmp + 7]]))
}

/// Same idea for ICMPv6, where the embedded original header is a fixed
/// 40-byte IPv6 header (no options assumed).
fn seq_from_embedded_v6(icmp: &[u8]) -> Option<u16> {
    let offset = 8 + 40;
    if icmp.len() < offset + 8 {
        return None;
    }
    Some(u16::from_be_bytes([icmp[offset + 6], icmp[offset + 7]]))
}
