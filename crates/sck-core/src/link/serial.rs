//! Reliable datagrams over a byte stream (UART to the co-processor)
//!
//! Packet layout, CRC little endian:
//!
//! ```text
//! [0x7E][len][to][from][id][flags][data; len][crc16]
//! ```
//!
//! The CRC (CRC-16/IBM-3740) covers `len` through the last data byte. Every
//! data packet is answered with an ack packet (`flags & ACK`, no data) that
//! repeats the id. A data packet whose id equals the previous one is a
//! retransmission: it is acked again and not delivered twice.

use crc::{CRC_16_IBM_3740, Crc};
use embassy_time::{Duration, with_timeout};
use heapless::{Deque, Vec};

use super::{DatagramLink, FRAME_SIZE, LinkError};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

const START: u8 = 0x7E;
const FLAG_ACK: u8 = 0x80;
const HEADER_LEN: usize = 6;
const MAX_PACKET: usize = HEADER_LEN + FRAME_SIZE + 2;

/// Retransmissions after the first attempt.
pub const DEFAULT_RETRIES: u8 = 16;
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(30);

/// Frames that arrived while waiting for an ack.
const BACKLOG: usize = 4;

#[derive(Debug, Clone)]
struct Packet {
    to: u8,
    from: u8,
    id: u8,
    flags: u8,
    data: Vec<u8, FRAME_SIZE>,
}

/// Incremental packet decoder, resyncs on the start byte.
#[derive(Default)]
struct Decoder {
    buf: Vec<u8, MAX_PACKET>,
}

impl Decoder {
    fn feed(&mut self, byte: u8) -> Option<Packet> {
        if self.buf.is_empty() && byte != START {
            return None;
        }
        // Capacity cannot be exceeded: length is checked below.
        let _ = self.buf.push(byte);

        if self.buf.len() == 2 && self.buf[1] as usize > FRAME_SIZE {
            self.buf.clear();
            return None;
        }
        if self.buf.len() < HEADER_LEN {
            return None;
        }

        let len = self.buf[1] as usize;
        if self.buf.len() < HEADER_LEN + len + 2 {
            return None;
        }

        let body_end = HEADER_LEN + len;
        let expected = CRC16.checksum(&self.buf[1..body_end]);
        let received = u16::from_le_bytes([self.buf[body_end], self.buf[body_end + 1]]);
        let packet = if expected == received {
            Some(Packet {
                to: self.buf[2],
                from: self.buf[3],
                id: self.buf[4],
                flags: self.buf[5],
                data: Vec::from_slice(&self.buf[HEADER_LEN..body_end]).unwrap_or_default(),
            })
        } else {
            log::debug!("Dropping packet with bad checksum");
            None
        };
        self.buf.clear();
        packet
    }
}

fn encode(to: u8, from: u8, id: u8, flags: u8, data: &[u8]) -> Vec<u8, MAX_PACKET> {
    let mut out = Vec::new();
    let _ = out.push(START);
    let _ = out.push(data.len() as u8);
    let _ = out.push(to);
    let _ = out.push(from);
    let _ = out.push(id);
    let _ = out.push(flags);
    let _ = out.extend_from_slice(data);
    let crc = CRC16.checksum(&out[1..]);
    let _ = out.extend_from_slice(&crc.to_le_bytes());
    out
}

pub struct SerialDatagramLink<U> {
    uart: U,
    address: u8,
    peer: u8,
    retries: u8,
    ack_timeout: Duration,
    next_id: u8,
    last_delivered: Option<u8>,
    decoder: Decoder,
    backlog: Deque<Vec<u8, FRAME_SIZE>, BACKLOG>,
}

impl<U> SerialDatagramLink<U>
where
    U: embedded_io_async::Read + embedded_io_async::Write + embedded_io::ReadReady,
{
    pub fn new(uart: U, address: u8, peer: u8) -> Self {
        Self {
            uart,
            address,
            peer,
            retries: DEFAULT_RETRIES,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            next_id: 0,
            last_delivered: None,
            decoder: Decoder::default(),
            backlog: Deque::new(),
        }
    }

    pub fn with_retries(mut self, retries: u8, ack_timeout: Duration) -> Self {
        self.retries = retries;
        self.ack_timeout = ack_timeout;
        self
    }

    async fn write_packet(&mut self, id: u8, flags: u8, data: &[u8]) -> Result<(), LinkError> {
        let packet = encode(self.peer, self.address, id, flags, data);
        self.uart.write_all(&packet).await.map_err(|_| LinkError::Io)?;
        self.uart.flush().await.map_err(|_| LinkError::Io)
    }

    /// Acks a data packet and stores it unless it is a retransmission.
    /// Returns the data if it is new.
    async fn accept_data(&mut self, packet: Packet) -> Result<Option<Vec<u8, FRAME_SIZE>>, LinkError> {
        self.write_packet(packet.id, FLAG_ACK, &[]).await?;
        if self.last_delivered == Some(packet.id) {
            log::debug!("Dropping duplicate packet {}", packet.id);
            return Ok(None);
        }
        self.last_delivered = Some(packet.id);
        Ok(Some(packet.data))
    }

    fn addressed_to_us(&self, packet: &Packet) -> bool {
        packet.to == self.address && packet.from == self.peer
    }

    async fn wait_ack(&mut self, id: u8) -> Result<(), LinkError> {
        let mut byte = [0u8; 1];
        loop {
            let n = self.uart.read(&mut byte).await.map_err(|_| LinkError::Io)?;
            if n == 0 {
                continue;
            }
            let Some(packet) = self.decoder.feed(byte[0]) else {
                continue;
            };
            if !self.addressed_to_us(&packet) {
                continue;
            }
            if packet.flags & FLAG_ACK != 0 {
                if packet.id == id {
                    return Ok(());
                }
                continue;
            }
            if let Some(data) = self.accept_data(packet).await? {
                if self.backlog.push_back(data).is_err() {
                    log::warn!("Link backlog full, dropping frame");
                }
            }
        }
    }
}

impl<U> DatagramLink for SerialDatagramLink<U>
where
    U: embedded_io_async::Read + embedded_io_async::Write + embedded_io::ReadReady,
{
    async fn send_acked(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        for attempt in 0..=self.retries {
            self.write_packet(id, 0, frame).await?;
            match with_timeout(self.ack_timeout, self.wait_ack(id)).await {
                Ok(result) => return result,
                Err(_) => log::debug!("No ack for packet {} (attempt {})", id, attempt + 1),
            }
        }
        Err(LinkError::NoAck)
    }

    /// A rebooted peer numbers its packets from zero again, so the last
    /// delivered id no longer identifies a retransmission.
    fn reset(&mut self) {
        self.next_id = 0;
        self.last_delivered = None;
        self.decoder.buf.clear();
        self.backlog.clear();
    }

    async fn try_receive(&mut self, buf: &mut [u8; FRAME_SIZE]) -> Option<usize> {
        if let Some(data) = self.backlog.pop_front() {
            buf[..data.len()].copy_from_slice(&data);
            return Some(data.len());
        }

        let mut byte = [0u8; 1];
        while let Ok(true) = self.uart.read_ready() {
            match self.uart.read(&mut byte).await {
                Ok(1) => {}
                _ => return None,
            }
            let Some(packet) = self.decoder.feed(byte[0]) else {
                continue;
            };
            if !self.addressed_to_us(&packet) || packet.flags & FLAG_ACK != 0 {
                continue;
            }
            match self.accept_data(packet).await {
                Ok(Some(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    return Some(data.len());
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Failed to ack packet: {}", e);
                    return None;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;
    use embassy_futures::block_on;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    const SAM: u8 = 1;
    const ESP: u8 = 2;

    /// Byte pipe: `rx` is what the link reads, `tx` collects what it writes.
    #[derive(Clone, Default)]
    struct MockUart {
        rx: Rc<RefCell<VecDeque<u8>>>,
        tx: Rc<RefCell<std::vec::Vec<u8>>>,
    }

    impl embedded_io::ErrorType for MockUart {
        type Error = Infallible;
    }

    impl embedded_io::ReadReady for MockUart {
        fn read_ready(&mut self) -> Result<bool, Infallible> {
            Ok(!self.rx.borrow().is_empty())
        }
    }

    impl embedded_io_async::Read for MockUart {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Infallible> {
            loop {
                if let Some(b) = self.rx.borrow_mut().pop_front() {
                    buf[0] = b;
                    return Ok(1);
                }
                embassy_time::Timer::after_millis(1).await;
            }
        }
    }

    impl embedded_io_async::Write for MockUart {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Infallible> {
            self.tx.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        async fn flush(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
    }

    fn decode_all(bytes: &[u8]) -> std::vec::Vec<Packet> {
        let mut decoder = Decoder::default();
        bytes.iter().filter_map(|b| decoder.feed(*b)).collect()
    }

    #[test]
    fn test_send_completes_on_ack() {
        let uart = MockUart::default();
        uart.rx.borrow_mut().extend(encode(SAM, ESP, 0, FLAG_ACK, &[]));
        let mut link = SerialDatagramLink::new(uart.clone(), SAM, ESP);

        assert_eq!(block_on(link.send_acked(&[3, 1, 2, 3])), Ok(()));
        let sent = decode_all(&uart.tx.borrow());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, ESP);
        assert_eq!(sent[0].data.as_slice(), &[3, 1, 2, 3]);
    }

    #[test]
    fn test_send_gives_up_without_ack() {
        let uart = MockUart::default();
        let mut link = SerialDatagramLink::new(uart.clone(), SAM, ESP)
            .with_retries(2, Duration::from_millis(5));

        assert_eq!(block_on(link.send_acked(&[1])), Err(LinkError::NoAck));
        assert_eq!(decode_all(&uart.tx.borrow()).len(), 3);
    }

    #[test]
    fn test_receive_acks_and_drops_duplicates() {
        let uart = MockUart::default();
        let packet = encode(SAM, ESP, 7, 0, &[1, 42]);
        uart.rx.borrow_mut().extend(packet.iter().copied());
        uart.rx.borrow_mut().extend(packet.iter().copied());
        let mut link = SerialDatagramLink::new(uart.clone(), SAM, ESP);

        let mut buf = [0u8; FRAME_SIZE];
        assert_eq!(block_on(link.try_receive(&mut buf)), Some(2));
        assert_eq!(&buf[..2], &[1, 42]);
        assert_eq!(block_on(link.try_receive(&mut buf)), None);

        let acks = decode_all(&uart.tx.borrow());
        assert_eq!(acks.len(), 2);
        assert!(acks.iter().all(|a| a.flags & FLAG_ACK != 0 && a.id == 7));
    }

    #[test]
    fn test_peer_reboot_restarts_packet_ids() {
        let uart = MockUart::default();
        uart.rx.borrow_mut().extend(encode(SAM, ESP, 0, 0, &[1, 15]));
        let mut link = SerialDatagramLink::new(uart.clone(), SAM, ESP);

        let mut buf = [0u8; FRAME_SIZE];
        assert_eq!(block_on(link.try_receive(&mut buf)), Some(2));

        // Power cycled peer: its first packet reuses id 0.
        link.reset();
        uart.rx.borrow_mut().extend(encode(SAM, ESP, 0, 0, &[1, 15, 9]));
        assert_eq!(block_on(link.try_receive(&mut buf)), Some(3));
        assert_eq!(&buf[..3], &[1, 15, 9]);
    }

    #[test]
    fn test_reset_restarts_outgoing_ids() {
        let uart = MockUart::default();
        uart.rx.borrow_mut().extend(encode(SAM, ESP, 0, FLAG_ACK, &[]));
        let mut link = SerialDatagramLink::new(uart.clone(), SAM, ESP);
        assert_eq!(block_on(link.send_acked(&[1])), Ok(()));

        link.reset();
        uart.tx.borrow_mut().clear();
        uart.rx.borrow_mut().extend(encode(SAM, ESP, 0, FLAG_ACK, &[]));
        assert_eq!(block_on(link.send_acked(&[1])), Ok(()));
        assert_eq!(decode_all(&uart.tx.borrow())[0].id, 0);
    }

    #[test]
    fn test_corrupted_packet_ignored() {
        let uart = MockUart::default();
        let mut packet = encode(SAM, ESP, 1, 0, &[1, 5]);
        packet[HEADER_LEN] ^= 0xFF;
        uart.rx.borrow_mut().extend(packet.iter().copied());
        let mut link = SerialDatagramLink::new(uart.clone(), SAM, ESP);

        let mut buf = [0u8; FRAME_SIZE];
        assert_eq!(block_on(link.try_receive(&mut buf)), None);
        assert!(uart.tx.borrow().is_empty());
    }

    #[test]
    fn test_data_received_while_waiting_for_ack_is_kept() {
        let uart = MockUart::default();
        uart.rx.borrow_mut().extend(encode(SAM, ESP, 9, 0, &[1, 77]));
        uart.rx.borrow_mut().extend(encode(SAM, ESP, 0, FLAG_ACK, &[]));
        let mut link = SerialDatagramLink::new(uart.clone(), SAM, ESP);

        assert_eq!(block_on(link.send_acked(&[1, 0])), Ok(()));
        let mut buf = [0u8; FRAME_SIZE];
        assert_eq!(block_on(link.try_receive(&mut buf)), Some(2));
        assert_eq!(&buf[..2], &[1, 77]);
    }
}
