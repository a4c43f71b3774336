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

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot open serial port: {0}")]
    Transport(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{}: {}", .path.display(), .source)]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Transfer complete")]
    TransferComplete,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("NAK received for packet {sequence}")]
    Nak { sequence: u8 },

    #[error("unexpected response 0x{byte:02X} to packet {sequence}")]
    UnexpectedResponse { sequence: u8, byte: u8 },

    #[error("{control} not acknowledged (got 0x{byte:02X})")]
    NotAcknowledged { control: &'static str, byte: u8 },

    #[error("packet header mismatch after maximum retries: expected {expected}, got {sequence}/{complement}")]
    HeaderMismatch { expected: u8, sequence: u8, complement: u8 },

    #[error("CRC mismatch after maximum retries: expected 0x{expected:04X}, received 0x{received:04X}")]
    CrcMismatch { expected: u16, received: u16 },

    #[error("failed to transfer packet {sequence} after maximum retries")]
    RetriesExhausted { sequence: u8 },
}

impl Error {
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::File { path: path.into(), source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
