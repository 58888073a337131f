//! Forwarding engine.
//!
//! One UDP socket serves both sides of the proxy. Every datagram read from it
//! is classified as either an upstream response or a client query:
//!
//! - responses are matched to waiting clients by transaction ID and relayed
//!   verbatim to each of them;
//! - queries from authorized clients are registered and forwarded upstream
//!   unchanged;
//! - queries from everyone else are answered directly with the portal address.
//!
//! Responses are recognised by the QR flag alone, not by source address.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, error, trace, warn};

use crate::dns::Message;
use crate::error::{ProxyError, Result};
use crate::pending::{CorrelationKey, PendingTable};
use crate::policy::Authorizer;
use crate::stats::Stats;
use crate::synth;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

/// Fixed endpoints the engine works with.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Resolver that authorized queries are forwarded to.
    pub upstream: SocketAddr,
    /// Address every redirect answer points at.
    pub portal: Ipv4Addr,
}

/// Why a datagram produced no output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    NoQuestions,
    /// A response nobody is waiting for.
    Unsolicited,
    EncodeFailed,
    /// Larger than the receive buffer, so only part of it was read.
    Oversized,
}

/// What to send as a result of one inbound datagram.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    Drop(DropReason),
    /// Upstream response to hand to every client waiting on its ID.
    Relay {
        payload: Arc<[u8]>,
        endpoints: Vec<SocketAddr>,
    },
    /// Authorized query, passed upstream as received.
    Forward {
        payload: Vec<u8>,
        upstream: SocketAddr,
    },
    /// Portal answer for an unauthorized client.
    Redirect {
        payload: Vec<u8>,
        client: SocketAddr,
    },
}

pub struct Engine {
    socket: Arc<UdpSocket>,
    config: EngineConfig,
    pending: Arc<PendingTable>,
    authorizer: Arc<dyn Authorizer>,
    stats: Arc<Stats>,
}

impl Engine {
    pub fn new(
        socket: Arc<UdpSocket>,
        config: EngineConfig,
        pending: Arc<PendingTable>,
        authorizer: Arc<dyn Authorizer>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            socket,
            config,
            pending,
            authorizer,
            stats,
        }
    }

    /// Receive loop. Only returns when the socket can no longer be read.
    pub async fn run(self) -> Result<()> {
        // One spare byte so a datagram cut off at the limit can be told apart.
        let mut buf = [0u8; MAX_DNS_PACKET_SIZE + 1];

        loop {
            let (len, src) = self
                .socket
                .recv_from(&mut buf)
                .await
                .map_err(ProxyError::Recv)?;

            self.stats.record_received();
            debug!(client = %src, len, "datagram received");

            if len > MAX_DNS_PACKET_SIZE {
                warn!(
                    from = %src,
                    limit = MAX_DNS_PACKET_SIZE,
                    "datagram exceeds receive buffer, dropping"
                );
                self.stats.record_dropped(DropReason::Oversized);
                continue;
            }

            let dispatch = self.classify(&buf[..len], src);
            self.dispatch(dispatch).await;
        }
    }

    /// Decide what to do with one datagram from `src`.
    ///
    /// Updates the pending table (drain on responses, register on authorized
    /// queries) but sends nothing.
    pub fn classify(&self, datagram: &[u8], src: SocketAddr) -> Dispatch {
        let msg = match Message::decode(datagram) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(client = %src, error = %e, "failed to decode datagram");
                return Dispatch::Drop(DropReason::Malformed);
            }
        };

        if msg.questions.is_empty() {
            trace!(client = %src, id = msg.header.id, "message without questions");
            return Dispatch::Drop(DropReason::NoQuestions);
        }

        let key = CorrelationKey(msg.header.id);

        if msg.header.response {
            return match self.pending.drain(key) {
                Some(endpoints) => Dispatch::Relay {
                    payload: Arc::from(datagram),
                    endpoints,
                },
                None => {
                    debug!(from = %src, id = %key, "no client waiting for response");
                    Dispatch::Drop(DropReason::Unsolicited)
                }
            };
        }

        if self.authorizer.is_authorized(src) {
            self.pending.register(key, src);
            return Dispatch::Forward {
                payload: datagram.to_vec(),
                upstream: self.config.upstream,
            };
        }

        let Some(answer) = synth::redirect(&msg, self.config.portal) else {
            return Dispatch::Drop(DropReason::NoQuestions);
        };
        match answer.encode() {
            Ok(payload) => Dispatch::Redirect {
                payload,
                client: src,
            },
            Err(e) => {
                error!(client = %src, id = %key, error = %e, "failed to encode redirect");
                Dispatch::Drop(DropReason::EncodeFailed)
            }
        }
    }

    /// Send whatever `classify` decided.
    ///
    /// Relayed responses go out as one task per endpoint so a slow or failing
    /// client never holds up the others or the receive loop.
    pub async fn dispatch(&self, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Drop(reason) => self.stats.record_dropped(reason),
            Dispatch::Relay { payload, endpoints } => {
                self.stats.record_relayed(endpoints.len());
                for endpoint in endpoints {
                    let socket = self.socket.clone();
                    let payload = payload.clone();
                    tokio::spawn(async move {
                        if let Err(e) = socket.send_to(&payload, endpoint).await {
                            warn!(client = %endpoint, error = %e, "failed to relay response");
                        }
                    });
                }
            }
            Dispatch::Forward { payload, upstream } => {
                self.stats.record_forwarded();
                if let Err(e) = self.socket.send_to(&payload, upstream).await {
                    warn!(upstream = %upstream, error = %e, "failed to forward query");
                }
            }
            Dispatch::Redirect { payload, client } => {
                self.stats.record_redirected();
                if let Err(e) = self.socket.send_to(&payload, client).await {
                    warn!(client = %client, error = %e, "failed to send redirect");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{Record, TYPE_A};
    use crate::policy::{AllowAll, DenyAll};
    use std::time::Duration;
    use tokio::time::timeout;

    const PORTAL: Ipv4Addr = Ipv4Addr::new(192, 168, 254, 254);
    const UPSTREAM: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53);
    const RECV_TIMEOUT: Duration = Duration::from_secs(2);

    struct Harness {
        engine: Engine,
        pending: Arc<PendingTable>,
        stats: Arc<Stats>,
    }

    async fn harness(authorizer: Arc<dyn Authorizer>, upstream: SocketAddr) -> Harness {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let pending = Arc::new(PendingTable::new());
        let stats = Arc::new(Stats::new());
        let engine = Engine::new(
            socket,
            EngineConfig {
                upstream,
                portal: PORTAL,
            },
            pending.clone(),
            authorizer,
            stats.clone(),
        );
        Harness {
            engine,
            pending,
            stats,
        }
    }

    fn client(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 5], port))
    }

    fn query(id: u16, name: &str) -> Vec<u8> {
        Message::query(id, name.parse().unwrap(), TYPE_A)
            .encode()
            .unwrap()
    }

    fn upstream_answer(id: u16, name: &str, addr: Ipv4Addr) -> Vec<u8> {
        let mut msg = Message::query(id, name.parse().unwrap(), TYPE_A);
        msg.header.response = true;
        msg.header.recursion_available = true;
        msg.answers.push(Record::a(name.parse().unwrap(), addr, 300));
        msg.encode().unwrap()
    }

    #[tokio::test]
    async fn unauthorized_query_gets_portal_answer() {
        let h = harness(Arc::new(DenyAll), UPSTREAM).await;
        let q = query(0x1234, "foo.example");

        let Dispatch::Redirect { payload, client: to } = h.engine.classify(&q, client(5000)) else {
            panic!("expected redirect");
        };

        assert_eq!(to, client(5000));
        let answer = Message::decode(&payload).unwrap();
        let original = Message::decode(&q).unwrap();
        assert_eq!(answer.header.id, 0x1234);
        assert!(answer.header.response);
        assert_eq!(answer.questions, original.questions);
        assert_eq!(answer.answers.len(), 1);
        assert_eq!(answer.answers[0].as_a(), Some(PORTAL));
        assert!(h.pending.is_empty());
    }

    #[tokio::test]
    async fn authorized_query_is_registered_and_forwarded_unchanged() {
        let h = harness(Arc::new(AllowAll), UPSTREAM).await;
        let q = query(0x1234, "foo.example");

        let dispatch = h.engine.classify(&q, client(5001));

        assert_eq!(
            dispatch,
            Dispatch::Forward {
                payload: q.clone(),
                upstream: UPSTREAM,
            }
        );
        assert_eq!(h.pending.len(), 1);
        assert_eq!(h.pending.waiting(CorrelationKey(0x1234)), 1);
    }

    #[tokio::test]
    async fn response_is_relayed_to_every_waiter_and_cleared() {
        let h = harness(Arc::new(AllowAll), UPSTREAM).await;
        h.engine.classify(&query(0x1234, "foo.example"), client(1));
        h.engine.classify(&query(0x1234, "bar.example"), client(2));
        let answer = upstream_answer(0x1234, "foo.example", Ipv4Addr::new(93, 184, 216, 34));

        let dispatch = h.engine.classify(&answer, UPSTREAM);

        assert_eq!(
            dispatch,
            Dispatch::Relay {
                payload: Arc::from(answer.as_slice()),
                endpoints: vec![client(1), client(2)],
            }
        );
        assert!(h.pending.is_empty());
        assert_eq!(
            h.engine.classify(&answer, UPSTREAM),
            Dispatch::Drop(DropReason::Unsolicited)
        );
    }

    #[tokio::test]
    async fn unsolicited_response_is_dropped() {
        let h = harness(Arc::new(AllowAll), UPSTREAM).await;
        let answer = upstream_answer(0x0BAD, "foo.example", Ipv4Addr::new(6, 6, 6, 6));

        let dispatch = h.engine.classify(&answer, UPSTREAM);
        h.engine.dispatch(dispatch).await;

        let snapshot = h.stats.snapshot_and_reset();
        assert_eq!(snapshot.unsolicited, 1);
        assert_eq!(snapshot.relayed, 0);
    }

    #[tokio::test]
    async fn unmatched_response_sends_nothing_over_udp() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let h = harness(Arc::new(AllowAll), upstream.local_addr().unwrap()).await;
        let proxy_addr = h.engine.socket.local_addr().unwrap();
        let pending = h.pending.clone();
        let stats = h.stats.clone();
        tokio::spawn(h.engine.run());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&query(0x1111, "foo.example"), proxy_addr)
            .await
            .unwrap();
        let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
        timeout(RECV_TIMEOUT, upstream.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        let stray = upstream_answer(0x2222, "foo.example", Ipv4Addr::new(6, 6, 6, 6));
        upstream.send_to(&stray, proxy_addr).await.unwrap();

        let mut client_buf = [0u8; MAX_DNS_PACKET_SIZE];
        assert!(
            timeout(Duration::from_millis(200), client.recv_from(&mut client_buf))
                .await
                .is_err()
        );
        assert!(
            timeout(Duration::from_millis(50), upstream.recv_from(&mut buf))
                .await
                .is_err()
        );
        assert_eq!(pending.waiting(CorrelationKey(0x1111)), 1);
        let snapshot = stats.snapshot_and_reset();
        assert_eq!(snapshot.unsolicited, 1);
        assert_eq!(snapshot.fanned_out, 0);
    }

    #[tokio::test]
    async fn oversized_datagram_is_dropped_before_decoding() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let h = harness(Arc::new(DenyAll), upstream.local_addr().unwrap()).await;
        let proxy_addr = h.engine.socket.local_addr().unwrap();
        let stats = h.stats.clone();
        tokio::spawn(h.engine.run());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut oversized = query(0x3333, "foo.example");
        oversized.resize(MAX_DNS_PACKET_SIZE + 100, 0);
        client.send_to(&oversized, proxy_addr).await.unwrap();
        client
            .send_to(&query(0x4444, "foo.example"), proxy_addr)
            .await
            .unwrap();

        let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
        let (len, _) = timeout(RECV_TIMEOUT, client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Message::decode(&buf[..len]).unwrap().header.id, 0x4444);

        let snapshot = stats.snapshot_and_reset();
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.dropped, 1);
        assert_eq!(snapshot.redirected, 1);
    }

    #[tokio::test]
    async fn response_from_client_side_is_not_treated_as_query() {
        let h = harness(Arc::new(AllowAll), UPSTREAM).await;
        let answer = upstream_answer(1, "foo.example", Ipv4Addr::new(6, 6, 6, 6));

        assert_eq!(
            h.engine.classify(&answer, client(9)),
            Dispatch::Drop(DropReason::Unsolicited)
        );
        assert!(h.pending.is_empty());
    }

    #[tokio::test]
    async fn malformed_datagram_is_dropped() {
        let h = harness(Arc::new(AllowAll), UPSTREAM).await;

        assert_eq!(
            h.engine.classify(&[0x12, 0x34, 0x01], client(1)),
            Dispatch::Drop(DropReason::Malformed)
        );
        assert!(h.pending.is_empty());
    }

    #[tokio::test]
    async fn message_without_questions_is_dropped() {
        let h = harness(Arc::new(AllowAll), UPSTREAM).await;
        h.engine.classify(&query(7, "foo.example"), client(1));
        let mut empty = Message::default();
        empty.header.id = 7;
        empty.header.response = true;

        assert_eq!(
            h.engine.classify(&empty.encode().unwrap(), UPSTREAM),
            Dispatch::Drop(DropReason::NoQuestions)
        );
        assert_eq!(h.pending.waiting(CorrelationKey(7)), 1);
    }

    #[tokio::test]
    async fn authorization_is_evaluated_per_query() {
        let allowed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = allowed.clone();
        let authorizer = move |_: SocketAddr| flag.load(std::sync::atomic::Ordering::SeqCst);
        let h = harness(Arc::new(authorizer), UPSTREAM).await;

        assert!(matches!(
            h.engine.classify(&query(1, "a.example"), client(1)),
            Dispatch::Redirect { .. }
        ));
        allowed.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(matches!(
            h.engine.classify(&query(1, "a.example"), client(1)),
            Dispatch::Forward { .. }
        ));
    }

    #[tokio::test]
    async fn proxies_authorized_round_trip_over_udp() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let h = harness(Arc::new(AllowAll), upstream.local_addr().unwrap()).await;
        let proxy_addr = h.engine.socket.local_addr().unwrap();
        let pending = h.pending.clone();
        let stats = h.stats.clone();
        tokio::spawn(h.engine.run());

        let client_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let q = query(0x1234, "foo.example");
        client_a.send_to(&q, proxy_addr).await.unwrap();
        client_b.send_to(&q, proxy_addr).await.unwrap();

        let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
        for _ in 0..2 {
            let (len, from) = timeout(RECV_TIMEOUT, upstream.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..len], q.as_slice());
            assert_eq!(from, proxy_addr);
        }

        let answer = upstream_answer(0x1234, "foo.example", Ipv4Addr::new(93, 184, 216, 34));
        upstream.send_to(&answer, proxy_addr).await.unwrap();

        let received = futures::future::join_all([&client_a, &client_b].map(|c| async move {
            let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
            let (len, _) = timeout(RECV_TIMEOUT, c.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            buf[..len].to_vec()
        }))
        .await;

        assert_eq!(received, vec![answer.clone(), answer]);
        assert!(pending.is_empty());
        let snapshot = stats.snapshot_and_reset();
        assert_eq!(snapshot.forwarded, 2);
        assert_eq!(snapshot.relayed, 1);
        assert_eq!(snapshot.fanned_out, 2);
    }

    #[tokio::test]
    async fn redirects_unauthorized_client_over_udp() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let h = harness(Arc::new(DenyAll), upstream.local_addr().unwrap()).await;
        let proxy_addr = h.engine.socket.local_addr().unwrap();
        tokio::spawn(h.engine.run());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&query(0x1234, "foo.example"), proxy_addr)
            .await
            .unwrap();

        let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
        let (len, from) = timeout(RECV_TIMEOUT, client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, proxy_addr);
        let answer = Message::decode(&buf[..len]).unwrap();
        assert_eq!(answer.header.id, 0x1234);
        assert_eq!(answer.answers[0].name.to_string(), "foo.example");
        assert_eq!(answer.answers[0].as_a(), Some(PORTAL));

        let mut upstream_buf = [0u8; MAX_DNS_PACKET_SIZE];
        assert!(
            timeout(Duration::from_millis(100), upstream.recv_from(&mut upstream_buf))
                .await
                .is_err()
        );
    }
}
