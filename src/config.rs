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

use std::time::Duration;
use serialport::{DataBits, Parity, StopBits};

// ============================================================================
// Serial Line Settings
// ============================================================================

#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl SerialSettings {
    /// 9600 baud, 8N1.
    pub fn new(port: impl Into<String>) -> Self {
        SerialSettings {
            port: port.into(),
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

pub fn parse_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(format!("Invalid data bits: {}. Must be 5, 6, 7, or 8", bits)),
    }
}

pub fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!("Invalid parity: {}. Must be 'none', 'odd', or 'even'", parity)),
    }
}

pub fn parse_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(format!("Invalid stop bits: {}. Must be 1 or 2", bits)),
    }
}

// ============================================================================
// Transfer Policy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    Unbounded,
    /// Failed sends allowed per packet; `Attempts(0)` behaves as `Attempts(1)`.
    Attempts(u32),
}

impl RetryLimit {
    /// True once `failures` retries have used up the limit.
    pub fn exhausted(&self, failures: u32) -> bool {
        match self {
            RetryLimit::Unbounded => false,
            RetryLimit::Attempts(max) => failures >= (*max).max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Retransmissions allowed per packet after a NAK or stray response.
    pub sender_retries: RetryLimit,
    /// Header or CRC failures tolerated per packet before the receiver gives up.
    pub receiver_retries: u32,
    /// Pause after each NAK sent by the receiver.
    pub retry_backoff: Duration,
    /// How long the receiver waits for data after each 'C'.
    pub sync_timeout: Duration,
    /// Pause between a cancelled session and the next handshake.
    pub cancel_pause: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            sender_retries: RetryLimit::Unbounded,
            receiver_retries: 3,
            retry_backoff: Duration::from_secs(1),
            sync_timeout: Duration::from_secs(3),
            cancel_pause: Duration::from_secs(1),
        }
    }
}

// ============================================================================
// Pacing
// ============================================================================

/// Source of the blocking delays between retries.
pub trait Pacer: Send {
    fn pause(&mut self, duration: Duration);
}

pub struct ThreadPacer;

impl Pacer for ThreadPacer {
    fn pause(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
