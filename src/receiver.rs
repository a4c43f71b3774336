// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::marker::PhantomData;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use crate::config::{Pacer, TransferConfig};
use crate::crc16::calculate_crc;
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::*;
use crate::serial::SerialPort;

// ============================================================================
// Packet Reception
// ============================================================================

/// Outcome of one [`receive_packet`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// A full block was verified, acknowledged and copied into the buffer.
    Block,
    /// ETB was acknowledged; no more data follows.
    Complete,
    /// CAN or an unknown control byte arrived; the session must restart.
    Cancelled,
}

/// Reads the control byte and, for data packets, the sequence pair.
fn read_header(serial: &mut dyn SerialPort) -> std::io::Result<Header> {
    let control = serial.read_byte()?;
    if control != SOH {
        return Ok(Header::parse([control, 0, 0]));
    }

    let mut sequence = [0u8; 2];
    serial.read_exact(&mut sequence)?;
    Ok(Header::parse([control, sequence[0], sequence[1]]))
}

/// Receives the packet numbered `expected` into `block`.
///
/// EOT is acknowledged and skipped, since ETB is expected to follow it. A
/// header naming the wrong sequence, or a payload whose CRC does not match,
/// is answered with NAK and a pause of `config.retry_backoff`; after
/// `config.receiver_retries` such failures the call gives up. A budget of
/// zero still allows one attempt.
pub fn receive_packet(
    serial: &mut dyn SerialPort,
    expected: u8,
    block: &mut [u8; PACKET_SIZE],
    config: &TransferConfig,
    pacer: &mut dyn Pacer,
) -> Result<Received> {
    let budget = config.receiver_retries.max(1);
    let mut retries = 0;

    loop {
        let header = read_header(serial)?;
        debug!(
            "Received header: {:02X} {:02X} {:02X}",
            header.control, header.sequence, header.complement
        );

        match header.kind() {
            HeaderKind::Cancel => {
                warn!("Invalid or CAN header byte 0x{:02X} received, cancelling transmission", header.control);
                return Ok(Received::Cancelled);
            }
            HeaderKind::EndOfTransmission => {
                serial.write_all(&[ACK])?;
                debug!("EOT received, acknowledged, waiting for ETB");
                continue;
            }
            HeaderKind::EndOfBlock => {
                serial.write_all(&[ACK])?;
                debug!("ETB received, transmission complete");
                return Ok(Received::Complete);
            }
            HeaderKind::Data => {}
        }

        if !header.matches(expected) {
            warn!("Packet header mismatch: expected {} but got {}", expected, header.sequence);
            serial.write_all(&[NAK])?;
            retries += 1;
            pacer.pause(config.retry_backoff);
            if retries >= budget {
                return Err(ProtocolError::HeaderMismatch {
                    expected,
                    sequence: header.sequence,
                    complement: header.complement,
                }.into());
            }
            continue;
        }

        serial.read_exact(&mut block[..])?;
        let mut crc_bytes = [0u8; CRC_SIZE];
        serial.read_exact(&mut crc_bytes)?;

        let received_crc = decode_crc(crc_bytes);
        let calculated_crc = calculate_crc(&block[..]);

        if received_crc != calculated_crc {
            warn!(
                "CRC mismatch on packet {}: expected 0x{:04X}, received 0x{:04X}",
                expected, calculated_crc, received_crc
            );
            serial.write_all(&[NAK])?;
            retries += 1;
            pacer.pause(config.retry_backoff);
            if retries >= budget {
                return Err(ProtocolError::CrcMismatch {
                    expected: calculated_crc,
                    received: received_crc,
                }.into());
            }
            continue;
        }

        serial.write_all(&[ACK])?;
        debug!("Sent ACK for packet {}", expected);
        return Ok(Received::Block);
    }
}

// ============================================================================
// States
// ============================================================================

pub struct Prepare;
pub struct Synchronize;
pub struct ReceiveBlock;
pub struct Cancel;

// ============================================================================
// FSM Structure
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct ReceiverStats {
    pub blocks: u64,
    pub bytes: u64,
    pub sync_requests: u64,
    pub restarts: u64,
}

pub struct ReceiverFsm<State> {
    state: PhantomData<State>,
    serial: Box<dyn SerialPort>,
    pacer: Box<dyn Pacer>,
    path: PathBuf,
    file: File,
    block: [u8; PACKET_SIZE],
    sequence: u8,
    stats: ReceiverStats,
    config: TransferConfig,
}

// ============================================================================
// Trait
// ============================================================================

pub trait ReceiverState: Send {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>>;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S> ReceiverFsm<S> {
    fn transition<T>(self) -> Box<ReceiverFsm<T>> {
        Box::new(ReceiverFsm {
            state: PhantomData,
            serial: self.serial,
            pacer: self.pacer,
            path: self.path,
            file: self.file,
            block: self.block,
            sequence: self.sequence,
            stats: self.stats,
            config: self.config,
        })
    }

    fn io_error(&self, e: std::io::Error) -> Error {
        let type_name = std::any::type_name::<S>();
        let state_name = type_name.split("::").last().unwrap_or(type_name);
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("{} (in state: {})", e, state_name)
        ))
    }

    fn receive(&mut self) -> Result<Received> {
        let result = receive_packet(
            self.serial.as_mut(),
            self.sequence,
            &mut self.block,
            &self.config,
            self.pacer.as_mut(),
        );

        match result {
            Err(Error::Io(e)) => Err(self.io_error(e)),
            other => other,
        }
    }

    fn store_block(&mut self) -> Result<()> {
        self.file.write_all(&self.block).map_err(|e| Error::file(&self.path, e))?;
        self.stats.blocks += 1;
        self.stats.bytes += PACKET_SIZE as u64;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }

    fn complete(&mut self) -> Result<Box<dyn ReceiverState>> {
        self.file.flush().map_err(|e| Error::file(&self.path, e))?;
        info!(
            "Received {} bytes in {} packets ({} sync requests, {} restarts)",
            self.stats.bytes, self.stats.blocks, self.stats.sync_requests, self.stats.restarts
        );
        Err(Error::TransferComplete)
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl ReceiverState for ReceiverFsm<Prepare> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>> {
        let mut fsm = *self;
        fsm.serial.flush().map_err(|e| fsm.io_error(e))?;
        let next = fsm.transition::<Synchronize>();
        Ok(next as Box<dyn ReceiverState>)
    }
}

impl ReceiverState for ReceiverFsm<Synchronize> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>> {
        let mut fsm = *self;

        fsm.serial.write_all(&[CRC_REQUEST]).map_err(|e| fsm.io_error(e))?;
        fsm.stats.sync_requests += 1;
        debug!("Sent: 'C'");

        let ready = fsm.serial
            .wait_readable(fsm.config.sync_timeout)
            .map_err(|e| fsm.io_error(e))?;
        if !ready {
            debug!("Timeout, resending 'C'");
            return Ok(Box::new(fsm) as Box<dyn ReceiverState>);
        }

        match fsm.receive()? {
            Received::Block => {
                info!("Sender responded, receiving into {:?}", fsm.path);
                fsm.store_block()?;
                let next = fsm.transition::<ReceiveBlock>();
                Ok(next as Box<dyn ReceiverState>)
            }
            Received::Complete => {
                info!("Sender closed the session before any data");
                fsm.complete()
            }
            Received::Cancelled => {
                let next = fsm.transition::<Cancel>();
                Ok(next as Box<dyn ReceiverState>)
            }
        }
    }
}

impl ReceiverState for ReceiverFsm<ReceiveBlock> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>> {
        let mut fsm = *self;

        match fsm.receive()? {
            Received::Block => {
                fsm.store_block()?;
                Ok(Box::new(fsm) as Box<dyn ReceiverState>)
            }
            Received::Complete => fsm.complete(),
            Received::Cancelled => {
                let next = fsm.transition::<Cancel>();
                Ok(next as Box<dyn ReceiverState>)
            }
        }
    }
}

impl ReceiverState for ReceiverFsm<Cancel> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>> {
        let mut fsm = *self;

        // Reopening truncates; nothing from the aborted session survives.
        fsm.file = File::create(&fsm.path).map_err(|e| Error::file(&fsm.path, e))?;
        warn!("Partial file reset due to cancelled transmission");

        fsm.pacer.pause(fsm.config.cancel_pause);
        fsm.serial.flush().map_err(|e| fsm.io_error(e))?;

        fsm.sequence = 1;
        fsm.stats.restarts += 1;
        fsm.stats.blocks = 0;
        fsm.stats.bytes = 0;

        let next = fsm.transition::<Synchronize>();
        Ok(next as Box<dyn ReceiverState>)
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl ReceiverFsm<Prepare> {
    pub fn new(
        serial: Box<dyn SerialPort>,
        path: PathBuf,
        config: TransferConfig,
        pacer: Box<dyn Pacer>,
    ) -> Result<Box<dyn ReceiverState>> {
        let file = File::create(&path).map_err(|e| Error::file(&path, e))?;
        debug!("Created: {:?}", path);

        Ok(Box::new(ReceiverFsm {
            state: PhantomData::<Prepare>,
            serial,
            pacer,
            path,
            file,
            block: [0; PACKET_SIZE],
            sequence: 1,
            stats: ReceiverStats::default(),
            config,
        }))
    }
}

/// Receives into `path` until the sender closes the session with ETB.
pub fn receive_file(
    serial: Box<dyn SerialPort>,
    path: &Path,
    config: TransferConfig,
    pacer: Box<dyn Pacer>,
) -> Result<()> {
    let mut state = ReceiverFsm::new(serial, path.to_path_buf(), config, pacer)?;

    loop {
        match state.step() {
            Ok(next_state) => {
                state = next_state;
            }
            Err(Error::TransferComplete) => {
                return Ok(());
            }
            Err(e) => {
                return Err(e);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_pacer::RecordingPacer;
    use crate::sender::send_file;
    use crate::serial::{loopback_pair, MockSerialPort};
    use std::time::Duration;

    fn packet_responses(header: [u8; 3], data: &[u8; PACKET_SIZE], crc: u16) -> Vec<Option<u8>> {
        let mut responses: Vec<Option<u8>> = header.iter().map(|&b| Some(b)).collect();
        responses.extend(data.iter().map(|&b| Some(b)));
        responses.extend(crc.to_be_bytes().iter().map(|&b| Some(b)));
        responses
    }

    fn good_packet(sequence: u8, data: &[u8; PACKET_SIZE]) -> Vec<Option<u8>> {
        packet_responses([SOH, sequence, !sequence], data, calculate_crc(data))
    }

    fn block_of(fill: u8) -> [u8; PACKET_SIZE] {
        let mut block = [0u8; PACKET_SIZE];
        for (i, byte) in block.iter_mut().enumerate() {
            *byte = fill.wrapping_add(i as u8);
        }
        block
    }

    #[test]
    fn test_receive_valid_packet() {
        let mut data = [0u8; PACKET_SIZE];
        data[0] = 0xAB;

        let responses = packet_responses([SOH, 1, 0xFE], &data, 0x800C);
        let mut mock = MockSerialPort::new(responses, vec![ACK]).expect_write_calls(1);
        let mut pacer = RecordingPacer::default();
        let mut block = [0u8; PACKET_SIZE];

        let result = receive_packet(&mut mock, 1, &mut block, &TransferConfig::default(), &mut pacer);

        assert_eq!(result.unwrap(), Received::Block);
        assert_eq!(block, data);
        assert!(pacer.recorded().is_empty());
    }

    #[test]
    fn test_receive_zero_budget_still_reads_once() {
        let data = block_of(0x31);
        let config = TransferConfig { receiver_retries: 0, ..TransferConfig::default() };
        let mut block = [0u8; PACKET_SIZE];

        let mut mock = MockSerialPort::new(good_packet(1, &data), vec![ACK]);
        let result = receive_packet(&mut mock, 1, &mut block, &config, &mut RecordingPacer::default());
        assert_eq!(result.unwrap(), Received::Block);
        assert_eq!(block, data);

        let mut mock = MockSerialPort::new(packet_responses([SOH, 1, 0xFE], &data, 0), vec![NAK]);
        let mut pacer = RecordingPacer::default();
        match receive_packet(&mut mock, 1, &mut block, &config, &mut pacer) {
            Err(Error::Protocol(ProtocolError::CrcMismatch { received: 0, .. })) => {}
            other => panic!("Expected CRC mismatch, got {:?}", other),
        }
        assert_eq!(pacer.recorded(), vec![Duration::from_secs(1)]);
    }

    #[test]
    fn test_receive_crc_mismatch_exhausts_retries() {
        let mut data = [0u8; PACKET_SIZE];
        data[0] = 0xAB;

        let mut responses = Vec::new();
        for _ in 0..3 {
            responses.extend(packet_responses([SOH, 1, 0xFE], &data, 0x800D));
        }

        let mut mock = MockSerialPort::new(responses, vec![NAK, NAK, NAK]).expect_write_calls(3);
        let mut pacer = RecordingPacer::default();
        let mut block = [0u8; PACKET_SIZE];

        match receive_packet(&mut mock, 1, &mut block, &TransferConfig::default(), &mut pacer) {
            Err(Error::Protocol(ProtocolError::CrcMismatch { expected: 0x800C, received: 0x800D })) => {}
            other => panic!("Expected CRC mismatch, got {:?}", other),
        }
        assert_eq!(pacer.recorded(), vec![Duration::from_secs(1); 3]);
    }

    #[test]
    fn test_receive_header_mismatch_exhausts_retries() {
        let responses = vec![
            Some(SOH), Some(2), Some(0xFD),
            Some(SOH), Some(1), Some(0xFF),
            Some(SOH), Some(0), Some(0xFF),
        ];

        let mut mock = MockSerialPort::new(responses, vec![NAK, NAK, NAK]);
        let mut pacer = RecordingPacer::default();
        let mut block = [0u8; PACKET_SIZE];

        match receive_packet(&mut mock, 1, &mut block, &TransferConfig::default(), &mut pacer) {
            Err(Error::Protocol(ProtocolError::HeaderMismatch { expected: 1, sequence: 0, complement: 0xFF })) => {}
            other => panic!("Expected header mismatch, got {:?}", other),
        }
        assert_eq!(pacer.recorded().len(), 3);
    }

    #[test]
    fn test_receive_recovers_after_crc_error() {
        let data = block_of(0x10);

        let mut responses = packet_responses([SOH, 4, 0xFB], &data, calculate_crc(&data) ^ 0x0101);
        responses.extend(good_packet(4, &data));

        let mut mock = MockSerialPort::new(responses, vec![NAK, ACK]);
        let mut pacer = RecordingPacer::default();
        let mut block = [0u8; PACKET_SIZE];

        let result = receive_packet(&mut mock, 4, &mut block, &TransferConfig::default(), &mut pacer);

        assert_eq!(result.unwrap(), Received::Block);
        assert_eq!(block, data);
        assert_eq!(pacer.recorded().len(), 1);
    }

    #[test]
    fn test_receive_eot_then_etb() {
        let mut mock = MockSerialPort::new(vec![Some(EOT), Some(ETB)], vec![ACK, ACK]);
        let mut pacer = RecordingPacer::default();
        let mut block = [0u8; PACKET_SIZE];

        let result = receive_packet(&mut mock, 3, &mut block, &TransferConfig::default(), &mut pacer);

        assert_eq!(result.unwrap(), Received::Complete);
    }

    #[test]
    fn test_receive_eot_keeps_waiting() {
        let data = block_of(0x33);
        let mut responses = vec![Some(EOT)];
        responses.extend(good_packet(2, &data));

        let mut mock = MockSerialPort::new(responses, vec![ACK, ACK]);
        let mut pacer = RecordingPacer::default();
        let mut block = [0u8; PACKET_SIZE];

        let result = receive_packet(&mut mock, 2, &mut block, &TransferConfig::default(), &mut pacer);

        assert_eq!(result.unwrap(), Received::Block);
    }

    #[test]
    fn test_receive_cancel_and_invalid_control() {
        for control in [CAN, 0x02, ACK, b'C'] {
            let mut mock = MockSerialPort::new(vec![Some(control)], vec![]);
            let mut pacer = RecordingPacer::default();
            let mut block = [0u8; PACKET_SIZE];

            let result = receive_packet(&mut mock, 1, &mut block, &TransferConfig::default(), &mut pacer);

            assert_eq!(result.unwrap(), Received::Cancelled, "control 0x{:02X}", control);
        }
    }

    #[test]
    fn test_receive_file_after_sync_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("received.bin");

        let first = block_of(0);
        let second = block_of(128);

        let mut responses = vec![None];
        responses.extend(good_packet(1, &first));
        responses.extend(good_packet(2, &second));
        responses.push(Some(EOT));
        responses.push(Some(ETB));

        let expected_writes = vec![CRC_REQUEST, CRC_REQUEST, ACK, ACK, ACK, ACK];
        let mock = MockSerialPort::new(responses, expected_writes).expect_flushes(1);

        receive_file(Box::new(mock), &path, TransferConfig::default(), Box::new(RecordingPacer::default()))
            .expect("Transfer should complete");

        let content = std::fs::read(&path).unwrap();
        assert_eq!(content.len(), 256);
        assert_eq!(&content[..128], &first[..]);
        assert_eq!(&content[128..], &second[..]);
    }

    #[test]
    fn test_receive_file_restarts_after_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restart.bin");

        let aborted = block_of(0xA0);
        let retried = block_of(0x05);

        let mut responses = good_packet(1, &aborted);
        responses.push(Some(CAN));
        responses.extend(good_packet(1, &retried));
        responses.push(Some(EOT));
        responses.push(Some(ETB));

        let expected_writes = vec![CRC_REQUEST, ACK, CRC_REQUEST, ACK, ACK, ACK];
        let mock = MockSerialPort::new(responses, expected_writes).expect_flushes(2);
        let pacer = RecordingPacer::default();

        receive_file(Box::new(mock), &path, TransferConfig::default(), Box::new(pacer.clone()))
            .expect("Restarted transfer should complete");

        let content = std::fs::read(&path).unwrap();
        assert_eq!(content, retried.to_vec());
        assert_eq!(pacer.recorded(), vec![Duration::from_secs(1)]);
    }

    #[test]
    fn test_receive_file_cancel_during_handshake() {
        for control in [CAN, 0x02] {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("handshake.bin");

            let data = block_of(0x60);
            let mut responses = vec![Some(control)];
            responses.extend(good_packet(1, &data));
            responses.push(Some(EOT));
            responses.push(Some(ETB));

            let expected_writes = vec![CRC_REQUEST, CRC_REQUEST, ACK, ACK, ACK];
            let mock = MockSerialPort::new(responses, expected_writes).expect_flushes(2);
            let pacer = RecordingPacer::default();

            receive_file(Box::new(mock), &path, TransferConfig::default(), Box::new(pacer.clone()))
                .expect("Transfer should complete after the handshake restarts");

            assert_eq!(std::fs::read(&path).unwrap(), data.to_vec());
            assert_eq!(pacer.recorded(), vec![Duration::from_secs(1)]);
        }
    }

    #[test]
    fn test_receive_file_empty_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");

        let mock = MockSerialPort::new(vec![Some(EOT), Some(ETB)], vec![CRC_REQUEST, ACK, ACK]);

        receive_file(Box::new(mock), &path, TransferConfig::default(), Box::new(RecordingPacer::default()))
            .expect("Empty session should complete");

        assert!(std::fs::read(&path).unwrap().is_empty());
    }

    #[test]
    fn test_receive_file_propagates_retry_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.bin");

        let data = block_of(0x44);
        let mut responses = good_packet(1, &data);
        for _ in 0..3 {
            responses.extend(packet_responses([SOH, 2, 0xFD], &data, 0));
        }

        let expected_writes = vec![CRC_REQUEST, ACK, NAK, NAK, NAK];
        let mock = MockSerialPort::new(responses, expected_writes);

        match receive_file(Box::new(mock), &path, TransferConfig::default(), Box::new(RecordingPacer::default())) {
            Err(Error::Protocol(ProtocolError::CrcMismatch { .. })) => {}
            other => panic!("Expected CRC mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_receive_file_unwritable_destination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.bin");
        let mock = MockSerialPort::new(vec![], vec![]);

        match receive_file(Box::new(mock), &path, TransferConfig::default(), Box::new(RecordingPacer::default())) {
            Err(Error::File { path: p, .. }) => assert_eq!(p, path),
            other => panic!("Expected file error, got {:?}", other),
        }
    }

    #[test]
    fn test_end_to_end_over_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        let destination = dir.path().join("destination.bin");

        let content: Vec<u8> = (0..300).map(|i| (i * 7 % 251) as u8).collect();
        std::fs::write(&source, &content).unwrap();

        let (sender_port, receiver_port) = loopback_pair();

        let receiver = {
            let destination = destination.clone();
            std::thread::spawn(move || {
                receive_file(
                    Box::new(receiver_port),
                    &destination,
                    TransferConfig::default(),
                    Box::new(RecordingPacer::default()),
                )
            })
        };

        let sent = send_file(Box::new(sender_port), &source, TransferConfig::default());
        let received = receiver.join().expect("receiver thread panicked");

        sent.expect("send should succeed");
        received.expect("receive should succeed");

        // Three full blocks land on disk; the final 84 bytes are zero padding.
        let output = std::fs::read(&destination).unwrap();
        assert_eq!(output.len(), 3 * PACKET_SIZE);
        assert_eq!(&output[..300], &content[..]);
        assert!(output[300..].iter().all(|&b| b == PAD));
    }
}
