//! dnsferry: file transfer tunneled through DNS queries
//!
//! A sender splits an arbitrary byte stream into a sequence of DNS `A` queries
//! whose leading labels carry unpadded base64 fragments, addressed under a
//! two-label tunnel suffix (e.g. `tunnel.test`). A receiver acting as the
//! authoritative server for that suffix strips the fragments back out of the
//! question names, rebuilds the stream and writes it under its output
//! directory.
//!
//! ## Wire shape
//!
//! ```text
//! query 0   <b64(destination)>.tunnel.test         open session
//! query 1   <63 chars>.<63 chars>.tunnel.test       data
//! ...
//! query n   <rest>.tunnel.test                      data
//! query n+1 tunnel.test                             close
//! ```
//!
//! Delivery is stop-and-wait: every query must be answered by *some*
//! datagram before the next one goes out. A missing answer makes the sender
//! close the session early and retry the whole transfer.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dnsferry::{Sender, SenderConfig, TunnelSuffix, UdpChannel};
//!
//! # async fn example() -> Result<(), dnsferry::TunnelError> {
//! let config = SenderConfig::default();
//! let suffix = TunnelSuffix::parse("tunnel.test")?;
//! let channel = UdpChannel::open("127.0.0.1:53".parse().unwrap()).await?;
//!
//! let mut sender = Sender::new(channel, suffix, config);
//! let report = sender.send_with_retries("out.txt", b"hello").await?;
//! println!("outcome: {}", report.outcome);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod fragment;
pub mod logging;
pub mod receiver;
pub mod resolv;
pub mod sender;
pub mod wire;

// Re-export core types
pub use config::{ReceiverConfig, SenderConfig};
pub use fragment::{Fragment, Fragmenter};
pub use receiver::{
    CompletedTransfer, Disposition, Reassembler, ReceiverServer, ReceiverState, ReceiverStats,
};
pub use sender::{DatagramChannel, Outcome, Sender, TransferReport, UdpChannel};
pub use wire::{ParsedQuery, QueryPacket, TunnelSuffix};

/// Process exit codes shared by both binaries
pub mod exit_code {
    /// Transfer delivered / receiver shut down cleanly
    pub const SUCCESS: i32 = 0;
    /// Bad argument or configuration
    pub const ARGUMENT: i32 = 1;
    /// Socket or local I/O failure
    pub const IO: i32 = 3;
    /// Transfer not confirmed after every retry
    pub const TRANSFER_FAILED: i32 = 4;
}

/// dnsferry error types
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Invalid command line argument or configuration value
    #[error("Invalid argument: {0}")]
    Argument(String),

    /// Socket could not be created, bound or used
    #[error("Socket error: {0}")]
    Socket(#[source] std::io::Error),

    /// Local file I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Fragment text is not valid unpadded base64
    #[error("Decode error: {0}")]
    Decode(String),

    /// Datagram is not a well-formed DNS query
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// A DNS label exceeds 63 octets
    #[error("Label too long: {0} bytes (max: 63)")]
    OversizeLabel(usize),

    /// An encoded DNS name exceeds 255 octets
    #[error("Name too long: {0} bytes (max: 255)")]
    OversizeName(usize),

    /// Encoded text exceeds what one query's two data labels can carry
    #[error("Fragment too long: {0} characters (max: 126)")]
    OversizeFragment(usize),

    /// A query was given more than two data labels
    #[error("Too many data labels: {0} (max: 2)")]
    TooManyLabels(usize),

    /// Decoded destination would escape the output directory
    #[error("Unsafe destination path: {0}")]
    UnsafePath(String),

    /// Transfer was not confirmed after every retry
    #[error("Transfer failed: {0}")]
    TransferFailure(Outcome),
}

impl TunnelError {
    /// Exit code the binaries report for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            TunnelError::Argument(_) => exit_code::ARGUMENT,
            TunnelError::TransferFailure(_) => exit_code::TRANSFER_FAILED,
            _ => exit_code::IO,
        }
    }

    /// Protocol-level errors concern a single packet; the receiver drops the
    /// packet and keeps listening.
    pub fn is_per_packet(&self) -> bool {
        matches!(
            self,
            TunnelError::Decode(_)
                | TunnelError::MalformedPacket(_)
                | TunnelError::OversizeLabel(_)
                | TunnelError::OversizeName(_)
                | TunnelError::UnsafePath(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let argument = TunnelError::Argument("missing host".into()).exit_code();
        let failure = TunnelError::TransferFailure(Outcome::Failed).exit_code();
        let io = TunnelError::Socket(std::io::Error::other("bind")).exit_code();

        assert_ne!(argument, failure);
        assert_ne!(argument, io);
        assert_ne!(failure, io);
        assert_ne!(failure, exit_code::SUCCESS);
    }

    #[test]
    fn test_per_packet_classification() {
        assert!(TunnelError::Decode("bad".into()).is_per_packet());
        assert!(TunnelError::OversizeLabel(64).is_per_packet());
        assert!(!TunnelError::Argument("x".into()).is_per_packet());
        assert!(!TunnelError::TransferFailure(Outcome::Failed).is_per_packet());
    }
}
