//! Link to the wireless co-processor
//!
//! Three layers:
//! - [`DatagramLink`]: acknowledged delivery of single frames (at most
//!   [`FRAME_SIZE`] bytes). [`serial::SerialDatagramLink`] implements it over
//!   a UART-style byte stream.
//! - [`framer::LinkFramer`]: fragments messages into frames and reassembles
//!   them on the way back.
//! - [`message`]: typed messages with a compact key/value payload.

pub mod framer;
pub mod message;
pub mod serial;

pub use framer::LinkFramer;

use core::future::Future;

use embassy_time::Duration;
use thiserror_no_std::Error;

/// Maximum datagram size, header byte included.
pub const FRAME_SIZE: usize = 64;

/// Content bytes carried by every fragment but the last.
pub const CHUNK_SIZE: usize = FRAME_SIZE - 1;

/// Upper bound of a reassembled message, type tag included.
pub const MAX_MESSAGE_SIZE: usize = 1024;

/// Fragments needed for the largest message.
pub const MAX_PARTS: usize = MAX_MESSAGE_SIZE.div_ceil(CHUNK_SIZE);

/// Longest gap accepted between two fragments of the same message.
pub const CONTINUATION_TIMEOUT: Duration = Duration::from_millis(500);

/// Set on the header byte of every fragment after the first.
pub const CONTINUATION_FLAG: u8 = 0x80;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    #[error("co-processor is off or still booting")]
    PeerNotReady,
    #[error("message of {size} bytes does not fit the link buffer")]
    PayloadTooLarge { size: usize },
    #[error("empty message")]
    EmptyMessage,
    #[error("fragment {part} of {total} was not acknowledged")]
    SendFailed { part: u8, total: u8 },
    #[error("no acknowledgement from peer")]
    NoAck,
    #[error("transport I/O error")]
    Io,
}

/// Power/boot state of the co-processor as tracked by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Off,
    Booting,
    Ready,
}

/// Reliable point-to-point datagram transport.
pub trait DatagramLink {
    /// Send one frame and wait for its acknowledgement. Retries and the ack
    /// timeout are owned by the transport.
    fn send_acked(&mut self, frame: &[u8]) -> impl Future<Output = Result<(), LinkError>>;

    /// Returns the length of a frame copied into `buf`, or `None` if nothing
    /// is waiting. Must not block waiting for new data.
    fn try_receive(&mut self, buf: &mut [u8; FRAME_SIZE]) -> impl Future<Output = Option<usize>>;

    /// The peer lost power: forget its session and anything half received.
    fn reset(&mut self) {}
}
