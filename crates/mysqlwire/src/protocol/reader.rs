//! MySQL packet reading utilities.
//!
//! A cursor over one packet payload. Every read returns `None` when the
//! payload is too short, leaving the caller to decide how to report it.

#![allow(clippy::cast_possible_truncation)]

use crate::protocol::{EofPacket, ErrPacket, OkPacket};

/// Marker for a NULL column value in a text row.
const NULL_MARKER: u8 = 0xFB;

/// A reader for MySQL protocol data.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    /// Create a new reader from a byte slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Get remaining bytes in the buffer.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Check if we've reached the end of the data.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Peek at the next byte without advancing.
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Option<u8> {
        let byte = self.data.get(self.pos)?;
        self.pos += 1;
        Some(*byte)
    }

    /// Read a u16 (little-endian).
    pub fn read_u16_le(&mut self) -> Option<u16> {
        let bytes = self.read_array::<2>()?;
        Some(u16::from_le_bytes(bytes))
    }

    /// Read a u24 (little-endian, 3 bytes).
    pub fn read_u24_le(&mut self) -> Option<u32> {
        let [b0, b1, b2] = self.read_array::<3>()?;
        Some(u32::from(b0) | (u32::from(b1) << 8) | (u32::from(b2) << 16))
    }

    /// Read a u32 (little-endian).
    pub fn read_u32_le(&mut self) -> Option<u32> {
        let bytes = self.read_array::<4>()?;
        Some(u32::from_le_bytes(bytes))
    }

    /// Read a u64 (little-endian).
    pub fn read_u64_le(&mut self) -> Option<u64> {
        let bytes = self.read_array::<8>()?;
        Some(u64::from_le_bytes(bytes))
    }

    fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Some(out)
    }

    /// Read a length-encoded integer.
    ///
    /// - 0x00-0xFA: 1-byte value
    /// - 0xFC: 2-byte value follows
    /// - 0xFD: 3-byte value follows
    /// - 0xFE: 8-byte value follows
    /// - 0xFB: NULL (only meaningful in rows), 0xFF: invalid
    pub fn read_lenenc_int(&mut self) -> Option<u64> {
        let first = self.read_u8()?;
        match first {
            0x00..=0xFA => Some(u64::from(first)),
            0xFC => self.read_u16_le().map(u64::from),
            0xFD => self.read_u24_le().map(u64::from),
            0xFE => self.read_u64_le(),
            0xFB | 0xFF => None,
        }
    }

    /// Read a length-encoded string.
    pub fn read_lenenc_string(&mut self) -> Option<String> {
        let len = self.read_lenenc_int()? as usize;
        self.read_string(len)
    }

    /// Read a length-encoded byte slice.
    pub fn read_lenenc_bytes(&mut self) -> Option<&'a [u8]> {
        let len = self.read_lenenc_int()? as usize;
        self.read_bytes(len)
    }

    /// Read one text-row value: `Some(None)` for SQL NULL.
    pub fn read_lenenc_value(&mut self) -> Option<Option<Vec<u8>>> {
        if self.peek() == Some(NULL_MARKER) {
            self.pos += 1;
            return Some(None);
        }
        self.read_lenenc_bytes().map(|b| Some(b.to_vec()))
    }

    /// Read a null-terminated byte string, without the terminator.
    ///
    /// A missing terminator consumes the rest of the payload.
    pub fn read_null_bytes(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        self.pos += end;
        // Skip the null terminator
        if self.pos < self.data.len() {
            self.pos += 1;
        }
        &rest[..end]
    }

    /// Read a null-terminated string.
    pub fn read_null_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_null_bytes()).into_owned()
    }

    /// Read a fixed-length string.
    pub fn read_string(&mut self, len: usize) -> Option<String> {
        let bytes = self.read_bytes(len)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Read remaining data as a string.
    pub fn read_rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_rest()).into_owned()
    }

    /// Read a fixed number of bytes.
    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(bytes)
    }

    /// Read remaining bytes.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }

    /// Skip a number of bytes.
    pub fn skip(&mut self, n: usize) -> bool {
        if self.remaining() >= n {
            self.pos += n;
            true
        } else {
            false
        }
    }

    /// Parse an OK packet.
    ///
    /// Protocol 4.1 layout:
    /// - 0x00 marker
    /// - affected_rows: lenenc int
    /// - last_insert_id: lenenc int
    /// - status_flags: 2 bytes
    /// - warnings: 2 bytes
    /// - info: rest of packet
    ///
    /// Older servers omit the warnings count and may omit the status flags.
    pub fn parse_ok_packet(&mut self, protocol41: bool) -> Option<OkPacket> {
        if self.peek() == Some(0x00) {
            self.skip(1);
        }

        let affected_rows = self.read_lenenc_int()?;
        let last_insert_id = self.read_lenenc_int()?;
        let (status_flags, warnings) = if protocol41 {
            (self.read_u16_le()?, self.read_u16_le()?)
        } else {
            (self.read_u16_le().unwrap_or(0), 0)
        };
        let info = self.read_rest_string();

        Some(OkPacket {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
        })
    }

    /// Parse an Error packet.
    ///
    /// - 0xFF marker
    /// - error_code: 2 bytes
    /// - protocol 4.1 only: '#' marker and 5-byte SQL state
    /// - error_message: rest of packet
    pub fn parse_err_packet(&mut self, protocol41: bool) -> Option<ErrPacket> {
        if self.peek() == Some(0xFF) {
            self.skip(1);
        }

        let error_code = self.read_u16_le()?;

        let sql_state = if protocol41 && self.peek() == Some(b'#') {
            self.skip(1);
            self.read_string(5)?
        } else {
            String::new()
        };

        let error_message = self.read_rest_string();

        Some(ErrPacket {
            error_code,
            sql_state,
            error_message,
        })
    }

    /// Parse an EOF packet.
    ///
    /// Protocol 4.1 carries warnings and status flags after the 0xFE marker;
    /// older servers send the marker alone.
    pub fn parse_eof_packet(&mut self, protocol41: bool) -> Option<EofPacket> {
        if self.peek() == Some(0xFE) {
            self.skip(1);
        }

        if !protocol41 {
            return Some(EofPacket::default());
        }

        let warnings = self.read_u16_le()?;
        let status_flags = self.read_u16_le()?;

        Some(EofPacket {
            warnings,
            status_flags,
        })
    }
}
