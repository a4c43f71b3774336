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
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use crate::config::TransferConfig;
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::*;
use crate::serial::SerialPort;

// ============================================================================
// Packet Transmission
// ============================================================================

/// Sends one data packet and waits for the receiver's verdict.
///
/// Header, payload and CRC go out as three separate writes, followed by a
/// single one-byte read. Only an ACK counts as success; a NAK or any other
/// byte is reported as a [`ProtocolError`] and retrying is left to the caller.
pub fn send_packet(serial: &mut dyn SerialPort, sequence: u8, payload: &[u8; PACKET_SIZE]) -> Result<()> {
    let packet = Packet::new(sequence, payload);
    debug!("Sending packet {} (CRC 0x{:04X})", sequence, packet.crc);

    serial.write_all(&packet.header.to_bytes())?;
    serial.write_all(packet.payload)?;
    serial.write_all(&packet.crc_bytes())?;

    match serial.read_byte()? {
        ACK => Ok(()),
        NAK => Err(ProtocolError::Nak { sequence }.into()),
        byte => Err(ProtocolError::UnexpectedResponse { sequence, byte }.into()),
    }
}

// ============================================================================
// States
// ============================================================================

pub struct AwaitSync;
pub struct PrepareBlock;
pub struct TransmitBlock;
pub struct EndOfTransmission;
pub struct EndOfBlock;

// ============================================================================
// FSM Structure
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct SenderStats {
    pub blocks: u64,
    pub bytes: u64,
    pub retransmissions: u64,
}

pub struct SenderFsm<State> {
    state: PhantomData<State>,
    serial: Box<dyn SerialPort>,
    path: PathBuf,
    file: File,
    block: [u8; PACKET_SIZE],
    sequence: u8,
    failures: u32,
    stats: SenderStats,
    config: TransferConfig,
}

// ============================================================================
// Trait
// ============================================================================

pub trait SenderState: Send {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>>;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S> SenderFsm<S> {
    fn transition<T>(self) -> Box<SenderFsm<T>> {
        Box::new(SenderFsm {
            state: PhantomData,
            serial: self.serial,
            path: self.path,
            file: self.file,
            block: self.block,
            sequence: self.sequence,
            failures: self.failures,
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

    fn expect_ack(&mut self, control: u8) -> Result<()> {
        self.serial.write_all(&[control]).map_err(|e| self.io_error(e))?;
        debug!("Sent: {}", control_name(control));

        let byte = self.serial.read_byte().map_err(|e| self.io_error(e))?;
        debug!("Received: {} (0x{:02X})", control_name(byte), byte);
        if byte != ACK {
            return Err(ProtocolError::NotAcknowledged {
                control: control_name(control),
                byte,
            }.into());
        }
        Ok(())
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl SenderState for SenderFsm<AwaitSync> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>> {
        let mut fsm = *self;

        let byte = fsm.serial.read_byte().map_err(|e| fsm.io_error(e))?;
        if byte == CRC_REQUEST {
            debug!("Received: 'C'");
        } else {
            // Not a gate: the transfer starts regardless.
            warn!("Receiver not ready: expected 'C', got 0x{:02X}", byte);
        }

        fsm.serial.flush().map_err(|e| fsm.io_error(e))?;
        let next = fsm.transition::<PrepareBlock>();
        Ok(next as Box<dyn SenderState>)
    }
}

impl SenderState for SenderFsm<PrepareBlock> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>> {
        let mut fsm = *self;

        let bytes_read = read_block(&mut fsm.file, &mut fsm.block)
            .map_err(|e| Error::file(&fsm.path, e))?;

        if bytes_read == 0 {
            let next = fsm.transition::<EndOfTransmission>();
            return Ok(next as Box<dyn SenderState>);
        }

        pad_block(&mut fsm.block, bytes_read);
        fsm.stats.bytes += bytes_read as u64;
        fsm.failures = 0;
        debug!("Prepared block {} ({} bytes)", fsm.sequence, bytes_read);

        let next = fsm.transition::<TransmitBlock>();
        Ok(next as Box<dyn SenderState>)
    }
}

impl SenderState for SenderFsm<TransmitBlock> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>> {
        let mut fsm = *self;

        match send_packet(fsm.serial.as_mut(), fsm.sequence, &fsm.block) {
            Ok(()) => {
                debug!("Packet {} acknowledged", fsm.sequence);
                fsm.stats.blocks += 1;
                fsm.sequence = fsm.sequence.wrapping_add(1);
                let next = fsm.transition::<PrepareBlock>();
                Ok(next as Box<dyn SenderState>)
            }
            Err(Error::Protocol(e)) => {
                fsm.failures += 1;
                if fsm.config.sender_retries.exhausted(fsm.failures) {
                    warn!("Giving up on packet {}: {}", fsm.sequence, e);
                    return Err(ProtocolError::RetriesExhausted { sequence: fsm.sequence }.into());
                }

                warn!("Error sending packet: {}; resending packet {}", e, fsm.sequence);
                fsm.stats.retransmissions += 1;
                fsm.serial.flush().map_err(|e| fsm.io_error(e))?;
                Ok(Box::new(fsm) as Box<dyn SenderState>)
            }
            Err(Error::Io(e)) => Err(fsm.io_error(e)),
            Err(e) => Err(e),
        }
    }
}

impl SenderState for SenderFsm<EndOfTransmission> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>> {
        let mut fsm = *self;
        fsm.expect_ack(EOT)?;
        let next = fsm.transition::<EndOfBlock>();
        Ok(next as Box<dyn SenderState>)
    }
}

impl SenderState for SenderFsm<EndOfBlock> {
    fn step(self: Box<Self>) -> Result<Box<dyn SenderState>> {
        let mut fsm = *self;
        fsm.expect_ack(ETB)?;

        info!(
            "Sent {} bytes in {} packets ({} retransmissions)",
            fsm.stats.bytes, fsm.stats.blocks, fsm.stats.retransmissions
        );
        Err(Error::TransferComplete)
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl SenderFsm<AwaitSync> {
    pub fn new(serial: Box<dyn SerialPort>, path: PathBuf, config: TransferConfig) -> Result<Box<dyn SenderState>> {
        let file = File::open(&path).map_err(|e| Error::file(&path, e))?;
        debug!("Opened: {:?}", path);

        Ok(Box::new(SenderFsm {
            state: PhantomData::<AwaitSync>,
            serial,
            path,
            file,
            block: [0; PACKET_SIZE],
            sequence: 1,
            failures: 0,
            stats: SenderStats::default(),
            config,
        }))
    }
}

/// Sends the file at `path` and returns once the receiver has acknowledged ETB.
pub fn send_file(serial: Box<dyn SerialPort>, path: &Path, config: TransferConfig) -> Result<()> {
    let mut state = SenderFsm::new(serial, path.to_path_buf(), config)?;

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
// Helper Functions
// ============================================================================

/// Reads until `block` is full or the file ends, returning the bytes read.
fn read_block(file: &mut File, block: &mut [u8; PACKET_SIZE]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < PACKET_SIZE {
        match file.read(&mut block[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ============================================================================
// Tests
// ============================================================================
