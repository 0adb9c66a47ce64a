//! Message fragmentation and reassembly over a [`DatagramLink`].
//!
//! Frame layout: one header byte followed by up to [`CHUNK_SIZE`] content
//! bytes.
//!
//! | fragment   | header byte          |
//! |------------|----------------------|
//! | first      | total parts (1..=17) |
//! | n-th (n>0) | `0x80 \| n`          |
//!
//! Only complete messages leave [`LinkFramer::poll`]. A missing, late or
//! out of order continuation throws the whole message away.

use embassy_time::Instant;
use heapless::Vec;

use super::{
    CHUNK_SIZE, CONTINUATION_FLAG, CONTINUATION_TIMEOUT, DatagramLink, FRAME_SIZE, LinkError,
    MAX_MESSAGE_SIZE, MAX_PARTS, PeerState,
};

/// Reassembly progress of a multi-part message.
#[derive(Debug, Clone, Copy)]
struct Assembly {
    total: u8,
    received: u8,
    last_fragment: Instant,
}

pub struct LinkFramer<L> {
    link: L,
    frame: [u8; FRAME_SIZE],
    inbound: Vec<u8, MAX_MESSAGE_SIZE>,
    assembly: Option<Assembly>,
}

impl<L: DatagramLink> LinkFramer<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            frame: [0; FRAME_SIZE],
            inbound: Vec::new(),
            assembly: None,
        }
    }

    /// Start over with a freshly powered peer.
    pub fn reset(&mut self) {
        self.link.reset();
        self.discard("link reset");
    }

    /// Whether a multi-part message is half way through.
    pub fn is_receiving(&self) -> bool {
        self.assembly.is_some()
    }

    /// Send a whole message. Succeeds only if every fragment was acknowledged.
    pub async fn send(&mut self, peer: PeerState, message: &[u8]) -> Result<(), LinkError> {
        if peer != PeerState::Ready {
            log::debug!("Can't send message, co-processor is off or still booting");
            return Err(LinkError::PeerNotReady);
        }
        if message.is_empty() {
            return Err(LinkError::EmptyMessage);
        }
        if message.len() > MAX_MESSAGE_SIZE {
            return Err(LinkError::PayloadTooLarge {
                size: message.len(),
            });
        }

        let total = message.len().div_ceil(CHUNK_SIZE) as u8;
        log::debug!(
            "Sending message in {} parts and {} bytes",
            total,
            message.len()
        );

        for (index, chunk) in message.chunks(CHUNK_SIZE).enumerate() {
            let index = index as u8;
            self.frame[0] = if index == 0 {
                total
            } else {
                CONTINUATION_FLAG | index
            };
            self.frame[1..=chunk.len()].copy_from_slice(chunk);

            if let Err(e) = self.link.send_acked(&self.frame[..=chunk.len()]).await {
                log::warn!("Error sending part {} of {} to co-processor: {}", index + 1, total, e);
                return Err(LinkError::SendFailed {
                    part: index + 1,
                    total,
                });
            }
        }

        Ok(())
    }

    /// Drain waiting frames and return the next complete message, if any.
    ///
    /// Nothing is received while the peer is powered off. A booting peer is
    /// still listened to, its boot announcement arrives that way.
    pub async fn poll(&mut self, peer: PeerState, now: Instant) -> Option<&[u8]> {
        if peer == PeerState::Off {
            self.discard("co-processor powered off");
            return None;
        }

        loop {
            if let Some(assembly) = self.assembly {
                if now.saturating_duration_since(assembly.last_fragment) >= CONTINUATION_TIMEOUT {
                    self.discard("timed out waiting for the next fragment");
                }
            }

            let len = self.link.try_receive(&mut self.frame).await?;
            if len == 0 || len > FRAME_SIZE {
                continue;
            }

            let header = self.frame[0];
            if header & CONTINUATION_FLAG == 0 {
                if self.start_message(header, len, now) {
                    return Some(self.inbound.as_slice());
                }
            } else if self.continue_message(header & !CONTINUATION_FLAG, len, now) {
                return Some(self.inbound.as_slice());
            }
        }
    }

    /// Returns `true` when the first fragment is already the whole message.
    fn start_message(&mut self, total: u8, len: usize, now: Instant) -> bool {
        if total == 0 || total as usize > MAX_PARTS {
            log::warn!("Dropping frame announcing {} parts", total);
            return false;
        }
        if self.assembly.is_some() {
            self.discard("a new message started");
        }

        self.inbound.clear();
        // Never fails: one chunk is far below the buffer capacity.
        let _ = self.inbound.extend_from_slice(&self.frame[1..len]);

        if total == 1 {
            return true;
        }
        log::debug!("Receiving message in {} parts", total);
        self.assembly = Some(Assembly {
            total,
            received: 1,
            last_fragment: now,
        });
        false
    }

    /// Returns `true` when this fragment completed the message.
    fn continue_message(&mut self, index: u8, len: usize, now: Instant) -> bool {
        let Some(mut assembly) = self.assembly else {
            log::debug!("Dropping orphan fragment {}", index);
            return false;
        };
        if index != assembly.received {
            self.discard("fragment out of order");
            return false;
        }
        if self.inbound.extend_from_slice(&self.frame[1..len]).is_err() {
            self.discard("message exceeds buffer");
            return false;
        }

        assembly.received += 1;
        assembly.last_fragment = now;
        if assembly.received == assembly.total {
            self.assembly = None;
            return true;
        }
        self.assembly = Some(assembly);
        false
    }

    fn discard(&mut self, reason: &str) {
        if self.assembly.take().is_some() {
            log::warn!("Discarding partial message: {}", reason);
            self.inbound.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockLink;
    use embassy_futures::block_on;
    use embassy_time::Duration;

    fn message(len: usize) -> std::vec::Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    /// Sends through one framer and feeds every sent frame to a second one.
    fn transfer(len: usize) -> Option<std::vec::Vec<u8>> {
        let tx_link = MockLink::new();
        let mut tx = LinkFramer::new(tx_link.clone());
        let payload = message(len);
        block_on(tx.send(PeerState::Ready, &payload)).ok()?;

        let rx_link = MockLink::new();
        for frame in tx_link.sent() {
            rx_link.push_inbound(&frame);
        }
        let mut rx = LinkFramer::new(rx_link);
        block_on(rx.poll(PeerState::Ready, Instant::from_millis(0))).map(|m| m.to_vec())
    }

    #[test]
    fn test_round_trip_preserves_bytes() {
        for len in [1, 62, 63, 64, 126, 127, 500, MAX_MESSAGE_SIZE] {
            assert_eq!(transfer(len), Some(message(len)), "length {}", len);
        }
    }

    #[test]
    fn test_fragment_headers() {
        let link = MockLink::new();
        let mut framer = LinkFramer::new(link.clone());
        block_on(framer.send(PeerState::Ready, &message(130))).unwrap();

        let sent = link.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0][0], 3);
        assert_eq!(sent[1][0], 0x81);
        assert_eq!(sent[2][0], 0x82);
        assert_eq!(sent[0].len(), FRAME_SIZE);
        assert_eq!(sent[2].len(), 1 + 130 - 2 * CHUNK_SIZE);
    }

    #[test]
    fn test_send_refused_when_peer_not_ready() {
        let link = MockLink::new();
        let mut framer = LinkFramer::new(link.clone());
        for peer in [PeerState::Off, PeerState::Booting] {
            assert_eq!(
                block_on(framer.send(peer, b"x")),
                Err(LinkError::PeerNotReady)
            );
        }
        assert!(link.sent().is_empty());
    }

    #[test]
    fn test_oversize_message_rejected() {
        let mut framer = LinkFramer::new(MockLink::new());
        let big = message(MAX_MESSAGE_SIZE + 1);
        assert_eq!(
            block_on(framer.send(PeerState::Ready, &big)),
            Err(LinkError::PayloadTooLarge {
                size: MAX_MESSAGE_SIZE + 1
            })
        );
    }

    #[test]
    fn test_failed_fragment_aborts_message() {
        let link = MockLink::new();
        link.fail_sends_after(1);
        let mut framer = LinkFramer::new(link.clone());
        assert_eq!(
            block_on(framer.send(PeerState::Ready, &message(200))),
            Err(LinkError::SendFailed { part: 2, total: 4 })
        );
        assert_eq!(link.sent().len(), 1);
    }

    #[test]
    fn test_missing_continuation_is_never_dispatched() {
        let tx_link = MockLink::new();
        let mut tx = LinkFramer::new(tx_link.clone());
        block_on(tx.send(PeerState::Ready, &message(150))).unwrap();
        let frames = tx_link.sent();

        let rx_link = MockLink::new();
        let mut rx = LinkFramer::new(rx_link.clone());
        rx_link.push_inbound(&frames[0]);
        rx_link.push_inbound(&frames[1]);
        assert!(block_on(rx.poll(PeerState::Ready, Instant::from_millis(0))).is_none());
        assert!(rx.is_receiving());

        // Last fragment shows up after the timeout.
        let late = Instant::from_millis(0) + CONTINUATION_TIMEOUT + Duration::from_millis(1);
        rx_link.push_inbound(&frames[2]);
        assert!(block_on(rx.poll(PeerState::Ready, late)).is_none());
        assert!(!rx.is_receiving());
    }

    #[test]
    fn test_out_of_order_fragment_discards() {
        let tx_link = MockLink::new();
        let mut tx = LinkFramer::new(tx_link.clone());
        block_on(tx.send(PeerState::Ready, &message(150))).unwrap();
        let frames = tx_link.sent();

        let rx_link = MockLink::new();
        rx_link.push_inbound(&frames[0]);
        rx_link.push_inbound(&frames[2]);
        rx_link.push_inbound(&frames[1]);
        let mut rx = LinkFramer::new(rx_link);
        assert!(block_on(rx.poll(PeerState::Ready, Instant::from_millis(0))).is_none());
    }

    #[test]
    fn test_new_message_replaces_partial_one() {
        let tx_link = MockLink::new();
        let mut tx = LinkFramer::new(tx_link.clone());
        block_on(tx.send(PeerState::Ready, &message(100))).unwrap();
        block_on(tx.send(PeerState::Ready, b"\x05{}")).unwrap();
        let frames = tx_link.sent();

        let rx_link = MockLink::new();
        rx_link.push_inbound(&frames[0]);
        rx_link.push_inbound(&frames[2]);
        let mut rx = LinkFramer::new(rx_link);
        let got = block_on(rx.poll(PeerState::Ready, Instant::from_millis(0))).map(|m| m.to_vec());
        assert_eq!(got.as_deref(), Some(&b"\x05{}"[..]));
    }

    #[test]
    fn test_reset_drops_partial_message_and_resets_link() {
        let tx_link = MockLink::new();
        let mut tx = LinkFramer::new(tx_link.clone());
        block_on(tx.send(PeerState::Ready, &message(100))).unwrap();
        let frames = tx_link.sent();

        let rx_link = MockLink::new();
        rx_link.push_inbound(&frames[0]);
        let mut rx = LinkFramer::new(rx_link.clone());
        assert!(block_on(rx.poll(PeerState::Ready, Instant::from_millis(0))).is_none());
        assert!(rx.is_receiving());

        rx.reset();
        assert!(!rx.is_receiving());
        assert_eq!(rx_link.resets(), 1);

        // The tail of the old message is an orphan now.
        rx_link.push_inbound(&frames[1]);
        assert!(block_on(rx.poll(PeerState::Ready, Instant::from_millis(10))).is_none());
    }

    #[test]
    fn test_nothing_received_while_peer_off() {
        let rx_link = MockLink::new();
        rx_link.push_inbound(&[1, 9]);
        let mut rx = LinkFramer::new(rx_link.clone());
        assert!(block_on(rx.poll(PeerState::Off, Instant::from_millis(0))).is_none());

        // Booting peers can still announce themselves.
        let got = block_on(rx.poll(PeerState::Booting, Instant::from_millis(0))).map(|m| m.to_vec());
        assert_eq!(got.as_deref(), Some(&[9u8][..]));
    }
}
