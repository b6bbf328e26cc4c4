//! DNS query wire format
//!
//! Just enough RFC 1035 to carry tunnel fragments: a fixed 12-byte header,
//! one question whose name is the data labels followed by the two-label
//! tunnel suffix, and a fixed `A`/`IN` type and class.
//!
//! ```text
//! +----+-------+---------+---------+---------+---------+
//! | ID | FLAGS | QDCOUNT | ANCOUNT | NSCOUNT | ARCOUNT |  12 bytes
//! +----+-------+---------+---------+---------+---------+
//! | [len data] [len data] len name len ext 0 | QTYPE | QCLASS |
//! +------------------------------------------+-------+--------+
//! ```

use bytes::{BufMut, BytesMut};

use crate::{Result, TunnelError};

/// DNS header size in bytes
pub const DNS_HEADER_SIZE: usize = 12;

/// Maximum bytes per DNS label (RFC 1035)
pub const MAX_LABEL_LEN: usize = 63;

/// Maximum encoded QNAME length including length octets and terminator
pub const MAX_NAME_LEN: usize = 255;

/// Maximum UDP DNS packet size (RFC 1035)
pub const MAX_DNS_UDP_SIZE: usize = 512;

/// Query type A (host address)
pub const QTYPE_A: u16 = 1;

/// Query class IN (internet)
pub const QCLASS_IN: u16 = 1;

/// Data labels a tunnel query carries ahead of the suffix
pub const MAX_DATA_LABELS: usize = 2;

/// Flags: standard query, recursion desired
const FLAG_RD: u16 = 0x0100;

/// Flags: response, recursion desired, recursion available
const FLAGS_ACK: u16 = 0x8180;

/// The two-label domain both endpoints treat as the tunnel's address space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSuffix {
    name: String,
    extension: String,
}

impl TunnelSuffix {
    /// Split a base host such as `tunnel.test` at its first `.`
    ///
    /// A single trailing root dot is accepted. Both halves must be non-empty
    /// single labels of at most 63 bytes.
    pub fn parse(base_host: &str) -> Result<Self> {
        let host = base_host.strip_suffix('.').unwrap_or(base_host);
        let (name, extension) = host.split_once('.').ok_or_else(|| {
            TunnelError::Argument(format!(
                "base host \"{}\" must have the form <name>.<extension>",
                base_host
            ))
        })?;

        if name.is_empty() || extension.is_empty() || extension.contains('.') {
            return Err(TunnelError::Argument(format!(
                "base host \"{}\" must consist of exactly two labels",
                base_host
            )));
        }

        for label in [name, extension] {
            if label.len() > MAX_LABEL_LEN {
                return Err(TunnelError::OversizeLabel(label.len()));
            }
        }

        Ok(Self {
            name: name.to_string(),
            extension: extension.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Suffix labels in wire order
    pub fn labels(&self) -> [&[u8]; 2] {
        [self.name.as_bytes(), self.extension.as_bytes()]
    }

    /// If `labels` ends with this suffix (ASCII case-insensitive), return the
    /// leading data labels
    pub fn strip_from<'a>(&self, labels: &'a [Vec<u8>]) -> Option<&'a [Vec<u8>]> {
        if labels.len() < 2 {
            return None;
        }

        let (data, tail) = labels.split_at(labels.len() - 2);
        let matches = tail
            .iter()
            .zip(self.labels())
            .all(|(got, want)| got.eq_ignore_ascii_case(want));

        matches.then_some(data)
    }
}

impl std::fmt::Display for TunnelSuffix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.name, self.extension)
    }
}

/// One DNS query datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPacket {
    pub transaction_id: u16,
    pub recursion_desired: bool,
    /// Full question name, data labels first then the suffix
    pub labels: Vec<Vec<u8>>,
    pub qtype: u16,
    pub qclass: u16,
}

impl QueryPacket {
    /// Standard recursive `A`/`IN` query for the given name labels
    pub fn new(transaction_id: u16, labels: Vec<Vec<u8>>) -> Self {
        Self {
            transaction_id,
            recursion_desired: true,
            labels,
            qtype: QTYPE_A,
            qclass: QCLASS_IN,
        }
    }

    /// Encoded length of the question name
    pub fn name_len(&self) -> usize {
        self.labels.iter().map(|l| 1 + l.len()).sum::<usize>() + 1
    }

    /// Serialize into a datagram, enforcing the label and name budgets
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if let Some(label) = self.labels.iter().find(|l| l.len() > MAX_LABEL_LEN) {
            return Err(TunnelError::OversizeLabel(label.len()));
        }

        let name_len = self.name_len();
        if name_len > MAX_NAME_LEN {
            return Err(TunnelError::OversizeName(name_len));
        }

        let mut packet = BytesMut::with_capacity(DNS_HEADER_SIZE + name_len + 4);

        // Header
        let flags = if self.recursion_desired { FLAG_RD } else { 0 };
        packet.put_u16(self.transaction_id);
        packet.put_u16(flags);
        packet.put_u16(1); // QDCOUNT
        packet.put_u16(0); // ANCOUNT
        packet.put_u16(0); // NSCOUNT
        packet.put_u16(0); // ARCOUNT

        // Question
        for label in &self.labels {
            packet.put_u8(label.len() as u8);
            packet.put_slice(label);
        }
        packet.put_u8(0);
        packet.put_u16(self.qtype);
        packet.put_u16(self.qclass);

        Ok(packet.to_vec())
    }
}

/// The parts of an inbound query the receiver cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQuery {
    pub transaction_id: u16,
    pub recursion_desired: bool,
    /// Question name labels exactly as they appeared on the wire
    pub labels: Vec<Vec<u8>>,
}

impl ParsedQuery {
    /// Dotted rendering of the question name, for logging
    pub fn dotted_name(&self) -> String {
        self.labels
            .iter()
            .map(|l| String::from_utf8_lossy(l))
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// Build a tunnel query: `data_labels` (at most two) followed by the suffix
pub fn build_query(
    transaction_id: u16,
    data_labels: &[&[u8]],
    suffix: &TunnelSuffix,
) -> Result<Vec<u8>> {
    if data_labels.len() > MAX_DATA_LABELS {
        return Err(TunnelError::TooManyLabels(data_labels.len()));
    }

    let labels = data_labels
        .iter()
        .copied()
        .chain(suffix.labels())
        .map(<[u8]>::to_vec)
        .collect();

    QueryPacket::new(transaction_id, labels).to_bytes()
}

/// Parse a DNS query and return its transaction id and question labels
pub fn parse_query(packet: &[u8]) -> Result<ParsedQuery> {
    if packet.len() < DNS_HEADER_SIZE {
        return Err(TunnelError::MalformedPacket(format!(
            "packet too short: {} bytes",
            packet.len()
        )));
    }

    let transaction_id = u16::from_be_bytes([packet[0], packet[1]]);
    let flags = u16::from_be_bytes([packet[2], packet[3]]);

    let mut labels = Vec::new();
    let mut pos = DNS_HEADER_SIZE;
    loop {
        let len = *packet.get(pos).ok_or_else(|| {
            TunnelError::MalformedPacket("question name is not terminated".to_string())
        })? as usize;
        pos += 1;

        if len == 0 {
            break;
        }

        // Compression pointers and reserved label types have no place in a
        // tunnel query name
        if len > MAX_LABEL_LEN {
            return Err(TunnelError::MalformedPacket(format!(
                "label at offset {} has invalid length {}",
                pos - 1,
                len
            )));
        }

        if pos + len > packet.len() {
            return Err(TunnelError::MalformedPacket(format!(
                "label at offset {} claims length {} but only {} bytes remain",
                pos - 1,
                len,
                packet.len() - pos
            )));
        }

        labels.push(packet[pos..pos + len].to_vec());
        pos += len;
    }

    Ok(ParsedQuery {
        transaction_id,
        recursion_desired: flags & FLAG_RD != 0,
        labels,
    })
}

/// Receiver's acknowledgement: a header-only response echoing the query id
///
/// Only its arrival matters to the sender; the content is never inspected.
pub fn build_ack(transaction_id: u16) -> Vec<u8> {
    let mut packet = BytesMut::with_capacity(DNS_HEADER_SIZE);
    packet.put_u16(transaction_id);
    packet.put_u16(FLAGS_ACK);
    packet.put_u16(0); // QDCOUNT
    packet.put_u16(0); // ANCOUNT
    packet.put_u16(0); // NSCOUNT
    packet.put_u16(0); // ARCOUNT
    packet.to_vec()
}
