//! Receiving side: reassembling transfers out of query names
//!
//! The receiver answers for the tunnel suffix. Each query addressed below the
//! suffix carries one fragment in its leading labels:
//!
//! - the first fragment of a session names the destination subpath,
//! - following fragments are appended, still encoded, to the session buffer,
//! - an empty fragment closes the session; the buffer is decoded in one pass
//!   and written below the output directory.
//!
//! Queries for any other name are dropped without a reply, so the receiver
//! never answers traffic that is not part of the tunnel.

use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::net::UdpSocket;

use crate::codec;
use crate::config::{is_confined_path, ReceiverConfig};
use crate::wire::{self, ParsedQuery, TunnelSuffix, MAX_DNS_UDP_SIZE};
use crate::{Result, TunnelError};

/// An open transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSession {
    destination: PathBuf,
    accumulated: String,
}

impl TransferSession {
    fn new(destination: PathBuf) -> Self {
        Self {
            destination,
            accumulated: String::new(),
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Encoded text received so far
    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }
}

/// A closed session's decoded stream, ready to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransfer {
    pub destination: PathBuf,
    pub data: Vec<u8>,
}

/// Receiver state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    Receiving,
}

/// What to do with a packet after the reassembler has seen it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Not addressed to the tunnel; send nothing
    Ignored,
    /// Consumed; acknowledge
    Acknowledged,
    /// Closed a session; persist the stream, then acknowledge
    Completed(CompletedTransfer),
}

/// Single-session stream reassembly
#[derive(Debug)]
pub struct Reassembler {
    suffix: TunnelSuffix,
    output_dir: PathBuf,
    session: Option<TransferSession>,
}

impl Reassembler {
    pub fn new(suffix: TunnelSuffix, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            suffix,
            output_dir: output_dir.into(),
            session: None,
        }
    }

    pub fn state(&self) -> ReceiverState {
        match self.session {
            Some(_) => ReceiverState::Receiving,
            None => ReceiverState::Idle,
        }
    }

    pub fn session(&self) -> Option<&TransferSession> {
        self.session.as_ref()
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Parse a raw datagram and feed it through [`Reassembler::handle_query`]
    pub fn handle_packet(&mut self, packet: &[u8]) -> Result<Disposition> {
        let query = wire::parse_query(packet)?;
        self.handle_query(&query)
    }

    /// Advance the session with one parsed query
    ///
    /// Errors are per-packet: the caller drops the packet and sends no reply.
    pub fn handle_query(&mut self, query: &ParsedQuery) -> Result<Disposition> {
        let Some(data_labels) = self.suffix.strip_from(&query.labels) else {
            debug!("Ignoring query for {}", query.dotted_name());
            return Ok(Disposition::Ignored);
        };

        // Labels are rejoined without separators, undoing the 63-byte split
        let mut fragment = String::new();
        for label in data_labels {
            let text = std::str::from_utf8(label)
                .map_err(|_| TunnelError::Decode("label is not valid UTF-8".to_string()))?;
            fragment.push_str(text);
        }

        if fragment.is_empty() {
            return self.close();
        }

        match self.session.as_mut() {
            Some(session) => {
                session.accumulated.push_str(&fragment);
                debug!(
                    "Fragment of {} chars, {} buffered for {}",
                    fragment.len(),
                    session.accumulated.len(),
                    session.destination.display()
                );
            }
            None => self.open(&fragment)?,
        }

        Ok(Disposition::Acknowledged)
    }

    fn open(&mut self, fragment: &str) -> Result<()> {
        let subpath = codec::decode(fragment)?;
        let destination = self.destination_for(&subpath)?;

        info!("Transfer opened: {}", destination.display());
        self.session = Some(TransferSession::new(destination));
        Ok(())
    }

    fn close(&mut self) -> Result<Disposition> {
        // A close while idle is a sender retry after the session already ended
        let Some(session) = self.session.take() else {
            debug!("Close with no open session");
            return Ok(Disposition::Acknowledged);
        };

        // The session is gone even if its buffer turns out to be undecodable
        let data = codec::decode(&session.accumulated)?;
        info!(
            "Transfer closed: {} bytes for {}",
            data.len(),
            session.destination.display()
        );

        Ok(Disposition::Completed(CompletedTransfer {
            destination: session.destination,
            data,
        }))
    }

    /// Join a decoded subpath onto the output directory, refusing anything
    /// that would land outside it
    fn destination_for(&self, subpath: &[u8]) -> Result<PathBuf> {
        let subpath = std::str::from_utf8(subpath)
            .map_err(|_| TunnelError::Decode("destination is not valid UTF-8".to_string()))?;

        let relative = Path::new(subpath);
        if !is_confined_path(relative) {
            return Err(TunnelError::UnsafePath(subpath.to_string()));
        }

        Ok(self.output_dir.join(relative))
    }
}

/// Receiver counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    /// Datagrams received
    pub packets: u64,
    /// Queries outside the tunnel suffix
    pub ignored: u64,
    /// Tunnel queries dropped on a protocol or storage error
    pub dropped: u64,
    /// Files written
    pub completed: u64,
}

/// UDP server driving a [`Reassembler`]
pub struct ReceiverServer {
    socket: UdpSocket,
    reassembler: Reassembler,
    create_dirs: bool,
    stats: ReceiverStats,
}

impl ReceiverServer {
    /// Bind the configured listen address
    pub async fn bind(
        config: &ReceiverConfig,
        suffix: TunnelSuffix,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(config.listen_addr)
            .await
            .map_err(TunnelError::Socket)?;
        let reassembler = Reassembler::new(suffix, output_dir);

        info!(
            "DNS receiver listening on UDP {} for *.{} → {}",
            socket.local_addr().map_err(TunnelError::Socket)?,
            reassembler.suffix,
            reassembler.output_dir().display()
        );

        Ok(Self {
            socket,
            reassembler,
            create_dirs: config.create_dirs,
            stats: ReceiverStats::default(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(TunnelError::Socket)
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    pub fn stats(&self) -> ReceiverStats {
        self.stats
    }

    /// Serve until a fatal socket error
    pub async fn run(&mut self) -> Result<()> {
        let mut buf = vec![0u8; MAX_DNS_UDP_SIZE];
        loop {
            self.serve_one(&mut buf).await?;
        }
    }

    /// Receive and handle a single datagram
    pub async fn serve_one(&mut self, buf: &mut [u8]) -> Result<()> {
        let (len, client_addr) = match self.socket.recv_from(buf).await {
            Ok(received) => received,
            // ICMP unreachable from an earlier ack on some platforms
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                ) =>
            {
                debug!("Ignoring receive error: {}", e);
                return Ok(());
            }
            Err(e) => return Err(TunnelError::Socket(e)),
        };

        self.stats.packets += 1;
        let packet = &buf[..len];

        let transaction_id = match self.reassembler.handle_packet(packet) {
            Ok(Disposition::Ignored) => {
                self.stats.ignored += 1;
                return Ok(());
            }
            Ok(Disposition::Acknowledged) => transaction_id_of(packet),
            Ok(Disposition::Completed(transfer)) => {
                if let Err(e) = self.persist(&transfer).await {
                    error!("Failed to write {}: {}", transfer.destination.display(), e);
                    self.stats.dropped += 1;
                    return Ok(());
                }
                self.stats.completed += 1;
                info!(
                    "Saved {} ({} bytes); {} transfers, {} packets, {} ignored, {} dropped",
                    transfer.destination.display(),
                    transfer.data.len(),
                    self.stats.completed,
                    self.stats.packets,
                    self.stats.ignored,
                    self.stats.dropped
                );
                transaction_id_of(packet)
            }
            Err(e) if e.is_per_packet() => {
                warn!("Dropping packet from {}: {}", client_addr, e);
                self.stats.dropped += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let ack = wire::build_ack(transaction_id);
        if let Err(e) = self.socket.send_to(&ack, client_addr).await {
            warn!("Failed to acknowledge {}: {}", client_addr, e);
        }

        Ok(())
    }

    async fn persist(&self, transfer: &CompletedTransfer) -> io::Result<()> {
        if self.create_dirs {
            if let Some(parent) = transfer.destination.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&transfer.destination, &transfer.data).await
    }
}

fn transaction_id_of(packet: &[u8]) -> u16 {
    u16::from_be_bytes([packet[0], packet[1]])
}
