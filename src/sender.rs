//! Sending side: stop-and-wait upload of one transfer
//!
//! Every query must be confirmed by some datagram arriving on the session
//! socket within the ack timeout before the next one goes out. The first
//! unconfirmed query aborts the sequence: the sender then tries to close the
//! session cleanly by sending bare close queries, and reports how far it got.
//!
//! ```text
//! SendingDestination ──ack──▶ SendingData ──(data exhausted)──▶ SendingClose ──ack──▶ Done(Delivered)
//!        │                      │    ▲                              │
//!        └──────────────────────┴────┴─── no ack ───────────────────┘
//!                                   │
//!                   close retries (≤ max_tries)
//!                     ack ▶ Done(DeliveredUnconfirmedButClosed)
//!                  no ack ▶ Done(Failed)
//! ```

use async_trait::async_trait;
use log::{debug, info, warn};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::codec;
use crate::config::{validate_destination_path, SenderConfig};
use crate::fragment::{Fragment, Fragmenter};
use crate::wire::{self, TunnelSuffix, MAX_DNS_UDP_SIZE};
use crate::{Result, TunnelError};

/// How one transfer attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every query, close included, was confirmed
    Delivered,
    /// Some query went unconfirmed, but a close query was confirmed afterwards
    DeliveredUnconfirmedButClosed,
    /// Neither the data nor any close retry was confirmed
    Failed,
}

impl Outcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Outcome::Delivered)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Delivered => write!(f, "delivered"),
            Outcome::DeliveredUnconfirmedButClosed => {
                write!(f, "unconfirmed data, session closed")
            }
            Outcome::Failed => write!(f, "failed, close not confirmed"),
        }
    }
}

/// Counters for one transfer, including all whole-sequence retries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub outcome: Outcome,
    /// Queries sent in total
    pub packets_sent: u64,
    /// Close queries sent after an unconfirmed query
    pub close_retries: u64,
    /// Encoded payload length in characters
    pub encoded_len: usize,
    /// Whole-sequence attempts made
    pub attempts: u32,
}

impl TransferReport {
    fn new(encoded_len: usize) -> Self {
        Self {
            outcome: Outcome::Failed,
            packets_sent: 0,
            close_retries: 0,
            encoded_len,
            attempts: 0,
        }
    }

    /// Turn anything short of full delivery into a `TransferFailure`
    pub fn into_result(self) -> Result<Self> {
        if self.outcome.is_delivered() {
            Ok(self)
        } else {
            Err(TunnelError::TransferFailure(self.outcome))
        }
    }
}

/// The unreliable datagram path between sender and receiver
#[async_trait]
pub trait DatagramChannel: Send {
    /// Transmit one query datagram
    async fn send(&mut self, packet: &[u8]) -> Result<()>;

    /// Wait up to `wait` for any datagram; `true` if one arrived
    async fn wait_for_datagram(&mut self, wait: Duration) -> Result<bool>;
}

/// UDP socket aimed at the upstream resolver
///
/// Left unconnected: a datagram from any address counts as confirmation.
pub struct UdpChannel {
    socket: UdpSocket,
    server_addr: SocketAddr,
    buf: Vec<u8>,
}

impl UdpChannel {
    /// Bind an ephemeral local port suitable for reaching `server_addr`
    pub async fn open(server_addr: SocketAddr) -> Result<Self> {
        let loopback = server_addr.ip().is_loopback();
        let local_addr: SocketAddr = match (server_addr.is_ipv4(), loopback) {
            (true, true) => ([127, 0, 0, 1], 0).into(),
            (true, false) => ([0, 0, 0, 0], 0).into(),
            (false, true) => (std::net::Ipv6Addr::LOCALHOST, 0).into(),
            (false, false) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
        };

        let socket = UdpSocket::bind(local_addr)
            .await
            .map_err(TunnelError::Socket)?;

        let channel = Self {
            socket,
            server_addr,
            buf: vec![0u8; MAX_DNS_UDP_SIZE],
        };
        info!(
            "DNS sender bound to {} → resolver {}",
            channel.local_addr()?,
            server_addr
        );

        Ok(channel)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(TunnelError::Socket)
    }
}

#[async_trait]
impl DatagramChannel for UdpChannel {
    async fn send(&mut self, packet: &[u8]) -> Result<()> {
        self.socket
            .send_to(packet, self.server_addr)
            .await
            .map_err(TunnelError::Socket)?;
        Ok(())
    }

    async fn wait_for_datagram(&mut self, wait: Duration) -> Result<bool> {
        match timeout(wait, self.socket.recv_from(&mut self.buf)).await {
            Err(_) => Ok(false),
            Ok(Ok((n, from))) => {
                debug!("Confirmation: {} bytes from {}", n, from);
                Ok(true)
            }
            // Some platforms surface ICMP unreachable on the next receive
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                ) =>
            {
                debug!("Resolver unreachable: {}", e);
                Ok(false)
            }
            Ok(Err(e)) => Err(TunnelError::Socket(e)),
        }
    }
}

/// Position in the upload sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    SendingDestination,
    SendingData,
    SendingClose,
    Done(Outcome),
}

/// Drives transfers over a [`DatagramChannel`]
pub struct Sender<C> {
    channel: C,
    suffix: TunnelSuffix,
    max_tries: u32,
    ack_timeout: Duration,
    next_transaction_id: u16,
}

impl<C: DatagramChannel> Sender<C> {
    pub fn new(channel: C, suffix: TunnelSuffix, config: SenderConfig) -> Self {
        Self {
            channel,
            suffix,
            max_tries: config.max_tries.max(1),
            ack_timeout: config.ack_timeout,
            next_transaction_id: rand::random(),
        }
    }

    /// Start transaction ids at a fixed value instead of a random one
    pub fn with_transaction_id(mut self, transaction_id: u16) -> Self {
        self.next_transaction_id = transaction_id;
        self
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Send `payload` to `destination`, repeating the whole sequence up to
    /// `max_tries` times until it is fully confirmed
    ///
    /// The returned report carries the last attempt's outcome; only socket
    /// and build errors are returned as `Err`.
    pub async fn send_with_retries(
        &mut self,
        destination: &str,
        payload: &[u8],
    ) -> Result<TransferReport> {
        info!(
            "Sending {} bytes to \"{}\" via {}",
            payload.len(),
            destination,
            self.suffix
        );

        let destination = destination_fragment(destination)?;
        let encoded = codec::encode(payload);

        let mut report = TransferReport::new(encoded.len());
        for attempt in 1..=self.max_tries {
            report.attempts = attempt;
            report.outcome = self.run_sequence(&destination, &encoded, &mut report).await?;

            if report.outcome.is_delivered() {
                break;
            }
            warn!(
                "Transfer attempt {}/{} ended: {}",
                attempt, self.max_tries, report.outcome
            );
        }

        info!(
            "Transfer {} after {} attempt(s), {} queries, {} close retries",
            report.outcome, report.attempts, report.packets_sent, report.close_retries
        );
        Ok(report)
    }

    /// One pass over the sequence without whole-sequence retries
    pub async fn transmit(&mut self, destination: &str, payload: &[u8]) -> Result<TransferReport> {
        let destination = destination_fragment(destination)?;
        let encoded = codec::encode(payload);

        let mut report = TransferReport::new(encoded.len());
        report.attempts = 1;
        report.outcome = self.run_sequence(&destination, &encoded, &mut report).await?;
        Ok(report)
    }

    async fn run_sequence(
        &mut self,
        destination: &Fragment,
        encoded: &str,
        report: &mut TransferReport,
    ) -> Result<Outcome> {
        let mut fragments = Fragmenter::new(encoded)?;
        let mut state = SendState::SendingDestination;

        loop {
            state = match state {
                SendState::SendingDestination => {
                    if self.exchange(destination, report).await? {
                        SendState::SendingData
                    } else {
                        SendState::Done(self.close_early(report).await?)
                    }
                }
                SendState::SendingData => match fragments.next() {
                    Some(fragment) if !fragment.is_close() => {
                        if self.exchange(&fragment, report).await? {
                            SendState::SendingData
                        } else {
                            SendState::Done(self.close_early(report).await?)
                        }
                    }
                    _ => SendState::SendingClose,
                },
                SendState::SendingClose => {
                    if self.exchange(&Fragment::close(), report).await? {
                        SendState::Done(Outcome::Delivered)
                    } else {
                        SendState::Done(self.close_early(report).await?)
                    }
                }
                SendState::Done(outcome) => return Ok(outcome),
            };
        }
    }

    /// After an unconfirmed query, try to get a close through
    async fn close_early(&mut self, report: &mut TransferReport) -> Result<Outcome> {
        let close = Fragment::close();
        for attempt in 1..=self.max_tries {
            report.close_retries += 1;
            if self.exchange(&close, report).await? {
                warn!("Query unconfirmed; session closed on retry {}", attempt);
                return Ok(Outcome::DeliveredUnconfirmedButClosed);
            }
            warn!("Close retry {}/{} unconfirmed", attempt, self.max_tries);
        }
        Ok(Outcome::Failed)
    }

    /// Send one fragment and wait for its confirmation
    async fn exchange(&mut self, fragment: &Fragment, report: &mut TransferReport) -> Result<bool> {
        let transaction_id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);

        let packet = wire::build_query(transaction_id, &fragment.labels(), &self.suffix)?;
        debug!(
            "Query {:04x}: {} encoded chars ({} bytes on the wire)",
            transaction_id,
            fragment.len(),
            packet.len()
        );

        self.channel.send(&packet).await?;
        report.packets_sent += 1;

        let confirmed = self.channel.wait_for_datagram(self.ack_timeout).await?;
        if !confirmed {
            debug!("Query {:04x} unconfirmed after {:?}", transaction_id, self.ack_timeout);
        }
        Ok(confirmed)
    }
}

/// Destination fragment, refusing paths the receiver would reject
fn destination_fragment(destination: &str) -> Result<Fragment> {
    validate_destination_path(destination)?;
    Fragment::destination(destination)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::parse_query;
    use std::collections::VecDeque;

    /// Records every packet and answers waits from a script
    struct ScriptedChannel {
        sent: Vec<Vec<u8>>,
        acks: VecDeque<bool>,
        otherwise: bool,
    }

    impl ScriptedChannel {
        fn always(ack: bool) -> Self {
            Self {
                sent: Vec::new(),
                acks: VecDeque::new(),
                otherwise: ack,
            }
        }

        fn scripted(acks: &[bool], otherwise: bool) -> Self {
            Self {
                sent: Vec::new(),
                acks: acks.iter().copied().collect(),
                otherwise,
            }
        }

        fn data_labels(&self) -> Vec<Vec<Vec<u8>>> {
            self.sent
                .iter()
                .map(|p| {
                    let mut labels = parse_query(p).unwrap().labels;
                    labels.truncate(labels.len() - 2);
                    labels
                })
                .collect()
        }
    }

    #[async_trait]
    impl DatagramChannel for ScriptedChannel {
        async fn send(&mut self, packet: &[u8]) -> Result<()> {
            self.sent.push(packet.to_vec());
            Ok(())
        }

        async fn wait_for_datagram(&mut self, _wait: Duration) -> Result<bool> {
            Ok(self.acks.pop_front().unwrap_or(self.otherwise))
        }
    }

    fn sender(channel: ScriptedChannel) -> Sender<ScriptedChannel> {
        let suffix = TunnelSuffix::parse("tunnel.test").unwrap();
        let config = SenderConfig {
            max_tries: 3,
            ack_timeout: Duration::from_millis(10),
            ..SenderConfig::default()
        };
        Sender::new(channel, suffix, config)
    }

    #[tokio::test]
    async fn test_delivered_sequence() {
        let mut sender = sender(ScriptedChannel::always(true));
        let report = sender.transmit("out.txt", b"hello").await.unwrap();

        assert_eq!(report.outcome, Outcome::Delivered);
        assert_eq!(report.packets_sent, 3);
        assert_eq!(report.close_retries, 0);

        let labels = sender.channel().data_labels();
        assert_eq!(labels[0], vec![codec::encode(b"out.txt").into_bytes()]);
        assert_eq!(labels[1], vec![b"aGVsbG8".to_vec()]);
        assert!(labels[2].is_empty());
    }

    #[tokio::test]
    async fn test_two_full_fragments_make_four_queries() {
        // 189 bytes encode to exactly 252 characters
        let payload = vec![0x5Au8; 189];
        let mut sender = sender(ScriptedChannel::always(true));
        let report = sender.transmit("blob.bin", &payload).await.unwrap();

        assert_eq!(report.encoded_len, 252);
        assert_eq!(report.packets_sent, 4);
        assert_eq!(report.outcome, Outcome::Delivered);

        let labels = sender.channel().data_labels();
        assert_eq!(labels[1].len(), 2);
        assert_eq!(labels[2].len(), 2);
        assert!(labels[3].is_empty());
    }

    #[tokio::test]
    async fn test_all_timeouts_fail_after_max_tries_closes() {
        let mut sender = sender(ScriptedChannel::always(false));
        let report = sender.transmit("out.txt", b"hello").await.unwrap();

        assert_eq!(report.outcome, Outcome::Failed);
        assert_eq!(report.close_retries, 3);
        // destination query plus three close retries
        assert_eq!(report.packets_sent, 4);

        let labels = sender.channel().data_labels();
        assert!(labels[1..].iter().all(|l| l.is_empty()));
    }

    #[tokio::test]
    async fn test_unconfirmed_data_closed_on_retry() {
        // destination acked, data lost, first close retry acked
        let channel = ScriptedChannel::scripted(&[true, false, true], true);
        let mut sender = sender(channel);
        let report = sender.transmit("out.txt", b"hello").await.unwrap();

        assert_eq!(report.outcome, Outcome::DeliveredUnconfirmedButClosed);
        assert_eq!(report.packets_sent, 3);
        assert_eq!(report.close_retries, 1);
    }

    #[tokio::test]
    async fn test_unconfirmed_close_retried() {
        let channel = ScriptedChannel::scripted(&[true, true, false, false, true], true);
        let mut sender = sender(channel);
        let report = sender.transmit("out.txt", b"hello").await.unwrap();

        assert_eq!(report.outcome, Outcome::DeliveredUnconfirmedButClosed);
        assert_eq!(report.close_retries, 2);
    }

    #[tokio::test]
    async fn test_whole_sequence_retried_until_delivered() {
        // first attempt: destination lost, close retry acked; second attempt clean
        let channel = ScriptedChannel::scripted(&[false, true], true);
        let mut sender = sender(channel);
        let report = sender.send_with_retries("out.txt", b"hello").await.unwrap();

        assert_eq!(report.outcome, Outcome::Delivered);
        assert_eq!(report.attempts, 2);
        assert_eq!(report.packets_sent, 2 + 3);
        assert!(report.clone().into_result().is_ok());
    }

    #[tokio::test]
    async fn test_persistent_failure_reported() {
        let mut sender = sender(ScriptedChannel::always(false));
        let report = sender.send_with_retries("out.txt", b"hello").await.unwrap();

        assert_eq!(report.outcome, Outcome::Failed);
        assert_eq!(report.attempts, 3);
        assert_eq!(report.packets_sent, 3 * 4);
        assert!(matches!(
            report.into_result(),
            Err(TunnelError::TransferFailure(Outcome::Failed))
        ));
    }

    #[tokio::test]
    async fn test_transaction_ids_increment_and_wrap() {
        let mut sender = sender(ScriptedChannel::always(true)).with_transaction_id(0xFFFF);
        sender.transmit("out.txt", b"hello").await.unwrap();

        let ids: Vec<u16> = sender
            .channel()
            .sent
            .iter()
            .map(|p| parse_query(p).unwrap().transaction_id)
            .collect();
        assert_eq!(ids, vec![0xFFFF, 0x0000, 0x0001]);
    }

    #[tokio::test]
    async fn test_every_packet_within_budget() {
        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let mut sender = sender(ScriptedChannel::always(true));
        sender.transmit("some/nested/file.bin", &payload).await.unwrap();

        for packet in &sender.channel().sent {
            assert!(packet.len() <= MAX_DNS_UDP_SIZE);
        }
    }

    #[tokio::test]
    async fn test_empty_destination_rejected() {
        let mut sender = sender(ScriptedChannel::always(true));
        let result = sender.transmit("", b"hello").await;

        assert!(matches!(result, Err(TunnelError::Argument(_))));
        assert!(sender.channel().sent.is_empty());
    }

    #[tokio::test]
    async fn test_escaping_destination_rejected_before_sending() {
        for path in ["../escape.txt", "/etc/passwd", ".", "a/../../b"] {
            let mut sender = sender(ScriptedChannel::always(true));
            let result = sender.send_with_retries(path, b"hello").await;

            assert!(
                matches!(&result, Err(e) if e.exit_code() == crate::exit_code::ARGUMENT),
                "{} should be an argument error",
                path
            );
            assert!(sender.channel().sent.is_empty());
        }
    }

    #[tokio::test]
    async fn test_udp_channel_times_out_without_peer() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut channel = UdpChannel::open(server.local_addr().unwrap()).await.unwrap();

        channel.send(b"ping").await.unwrap();
        let confirmed = channel
            .wait_for_datagram(Duration::from_millis(50))
            .await
            .unwrap();
        assert!(!confirmed);

        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, channel.local_addr().unwrap());

        server.send_to(b"ack", from).await.unwrap();
        assert!(channel
            .wait_for_datagram(Duration::from_secs(1))
            .await
            .unwrap());
    }
}
