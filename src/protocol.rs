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

//! XMODEM-CRC protocol constants and packet framing

use crate::crc16::calculate_crc;

/// Start of header - begins a 128-byte data packet
pub const SOH: u8 = 0x01;

/// End of transmission - sender has no more data packets
pub const EOT: u8 = 0x04;

/// Acknowledge - packet or control byte accepted
pub const ACK: u8 = 0x06;

/// Negative acknowledge - receiver requests retransmission
pub const NAK: u8 = 0x15;

/// End of transmission block - closes the transfer after EOT
pub const ETB: u8 = 0x17;

/// Cancel - abort the current transfer
pub const CAN: u8 = 0x18;

/// Receiver ready, CRC mode requested
pub const CRC_REQUEST: u8 = b'C';

/// Payload bytes carried by every data packet
pub const PACKET_SIZE: usize = 128;

/// Filler for the unused tail of the final packet
pub const PAD: u8 = 0x00;

pub const HEADER_SIZE: usize = 3;

pub const CRC_SIZE: usize = 2;

/// Inverse sequence number carried in the third header byte.
pub fn complement(sequence: u8) -> u8 {
    !sequence
}

/// What a received header announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    Data,
    EndOfTransmission,
    EndOfBlock,
    /// CAN, or any control byte that is not part of the protocol.
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub control: u8,
    pub sequence: u8,
    pub complement: u8,
}

impl Header {
    pub fn data(sequence: u8) -> Self {
        Header {
            control: SOH,
            sequence,
            complement: complement(sequence),
        }
    }

    pub fn parse(bytes: [u8; HEADER_SIZE]) -> Self {
        Header {
            control: bytes[0],
            sequence: bytes[1],
            complement: bytes[2],
        }
    }

    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        [self.control, self.sequence, self.complement]
    }

    pub fn kind(&self) -> HeaderKind {
        match self.control {
            SOH => HeaderKind::Data,
            EOT => HeaderKind::EndOfTransmission,
            ETB => HeaderKind::EndOfBlock,
            _ => HeaderKind::Cancel,
        }
    }

    /// True when both the sequence and its complement name `expected`.
    pub fn matches(&self, expected: u8) -> bool {
        self.sequence == expected && self.complement == complement(expected)
    }
}

/// One outbound data packet, framed as header, payload and big-endian CRC.
pub struct Packet<'a> {
    pub header: Header,
    pub payload: &'a [u8; PACKET_SIZE],
    pub crc: u16,
}

impl<'a> Packet<'a> {
    pub fn new(sequence: u8, payload: &'a [u8; PACKET_SIZE]) -> Self {
        Packet {
            header: Header::data(sequence),
            payload,
            crc: calculate_crc(payload),
        }
    }

    pub fn crc_bytes(&self) -> [u8; CRC_SIZE] {
        self.crc.to_be_bytes()
    }
}

pub fn decode_crc(bytes: [u8; CRC_SIZE]) -> u16 {
    u16::from_be_bytes(bytes)
}

/// Fills everything after the first `len` bytes of `block` with padding.
pub fn pad_block(block: &mut [u8; PACKET_SIZE], len: usize) {
    for byte in block.iter_mut().skip(len) {
        *byte = PAD;
    }
}

pub fn control_name(byte: u8) -> &'static str {
    match byte {
        SOH => "SOH",
        EOT => "EOT",
        ACK => "ACK",
        NAK => "NAK",
        ETB => "ETB",
        CAN => "CAN",
        CRC_REQUEST => "'C'",
        _ => "unknown",
    }
}
