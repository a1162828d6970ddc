//! MySQL packet writing.
//!
//! `PacketWriter` accumulates one or more framed packets for a single send.
//! It owns the outgoing sequence number: callers advance it with
//! [`PacketWriter::increment_packet_number`] between logically distinct
//! packets, and [`PacketWriter::reset`] zeroes it at the start of every
//! command.

#![allow(clippy::cast_possible_truncation)]

use std::borrow::Cow;

use crate::protocol::{MAX_PACKET_SIZE, PacketHeader, charset};

/// How text is turned into bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextEncoding {
    /// UTF-8, used for the utf8 and utf8mb4 collations
    #[default]
    Utf8,
    /// 7-bit ASCII; other characters become `?`
    Ascii,
}

impl TextEncoding {
    /// The encoding for a MySQL charset number, if supported.
    pub fn for_charset(code: u8) -> Option<Self> {
        match code {
            charset::UTF8_GENERAL_CI
            | charset::UTF8MB4_GENERAL_CI
            | charset::UTF8MB4_UNICODE_CI
            | charset::UTF8MB4_0900_AI_CI => Some(TextEncoding::Utf8),
            charset::ASCII_GENERAL_CI => Some(TextEncoding::Ascii),
            _ => None,
        }
    }

    /// Encode `s` in this encoding.
    pub fn encode(self, s: &str) -> Cow<'_, [u8]> {
        match self {
            TextEncoding::Utf8 => Cow::Borrowed(s.as_bytes()),
            TextEncoding::Ascii if s.is_ascii() => Cow::Borrowed(s.as_bytes()),
            TextEncoding::Ascii => Cow::Owned(
                s.chars()
                    .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                    .collect(),
            ),
        }
    }
}

/// A writer for outgoing MySQL packets.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buffer: Vec<u8>,
    sequence_id: u8,
    encoding: TextEncoding,
    /// Offset of the reserved header of the packet being built
    packet_start: Option<usize>,
}

impl PacketWriter {
    /// Create a writer with the given text encoding.
    pub fn new(encoding: TextEncoding) -> Self {
        Self {
            buffer: Vec::with_capacity(256),
            sequence_id: 0,
            encoding,
            packet_start: None,
        }
    }

    /// Clear the output and restart the sequence at 0.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.sequence_id = 0;
        self.packet_start = None;
    }

    /// Sequence number the next header will carry.
    pub fn sequence_number(&self) -> u8 {
        self.sequence_id
    }

    /// Advance the sequence number (wraps at 255).
    pub fn increment_packet_number(&mut self) {
        self.sequence_id = self.sequence_id.wrapping_add(1);
    }

    /// Continue an exchange the server started, e.g. answer its packet `n`
    /// with `n + 1`.
    pub fn set_sequence_number(&mut self, sequence_id: u8) {
        self.sequence_id = sequence_id;
    }

    /// Text encoding in use.
    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    /// Get the current buffer length.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// The framed bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// The framed bytes, ready for the send path.
    pub fn to_array(&self) -> Vec<u8> {
        self.buffer.clone()
    }

    /// Write a 4-byte header for a payload of `payload_len` bytes using the
    /// current sequence number.
    pub fn write_packet_header(&mut self, payload_len: usize) {
        let header = PacketHeader {
            payload_length: payload_len as u32,
            sequence_id: self.sequence_id,
        };
        self.buffer.extend_from_slice(&header.to_bytes());
    }

    /// Reserve a header; the payload follows until [`finish_packet`].
    ///
    /// [`finish_packet`]: PacketWriter::finish_packet
    pub fn begin_packet(&mut self) {
        self.packet_start = Some(self.buffer.len());
        self.buffer.extend_from_slice(&[0; PacketHeader::SIZE]);
    }

    /// Back-fill the header reserved by [`begin_packet`].
    ///
    /// Payloads of `MAX_PACKET_SIZE` bytes or more are re-framed as
    /// continuation chunks with consecutive sequence numbers, ending with a
    /// short (possibly empty) chunk. The sequence number is left on the last
    /// chunk written.
    ///
    /// [`begin_packet`]: PacketWriter::begin_packet
    pub fn finish_packet(&mut self) {
        let Some(start) = self.packet_start.take() else {
            return;
        };
        let payload_start = start + PacketHeader::SIZE;
        let payload_len = self.buffer.len() - payload_start;

        if payload_len < MAX_PACKET_SIZE {
            let header = PacketHeader {
                payload_length: payload_len as u32,
                sequence_id: self.sequence_id,
            };
            self.buffer[start..payload_start].copy_from_slice(&header.to_bytes());
            return;
        }

        let payload = self.buffer.split_off(payload_start);
        self.buffer.truncate(start);
        self.buffer
            .reserve(payload.len() + (payload.len() / MAX_PACKET_SIZE + 1) * PacketHeader::SIZE);

        let mut chunks = payload.chunks(MAX_PACKET_SIZE).peekable();
        while let Some(chunk) = chunks.next() {
            self.write_packet_header(chunk.len());
            self.buffer.extend_from_slice(chunk);
            if chunks.peek().is_some() || chunk.len() == MAX_PACKET_SIZE {
                self.increment_packet_number();
            }
        }
        if payload.len() % MAX_PACKET_SIZE == 0 {
            // Terminating empty chunk
            self.write_packet_header(0);
        }
    }

    /// Write a single byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Write a u16 (little-endian).
    pub fn write_u16_le(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a u24 (little-endian, 3 bytes).
    pub fn write_u24_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes()[..3]);
    }

    /// Write a u32 (little-endian).
    pub fn write_u32_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a u64 (little-endian).
    pub fn write_u64_le(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a length-encoded integer.
    ///
    /// - 0x00-0xFA: 1-byte value
    /// - 0xFC + 2 bytes: values up to 2^16
    /// - 0xFD + 3 bytes: values up to 2^24
    /// - 0xFE + 8 bytes: values up to 2^64
    pub fn write_lenenc_int(&mut self, value: u64) {
        if value < 251 {
            self.write_u8(value as u8);
        } else if value < 0x10000 {
            self.write_u8(0xFC);
            self.write_u16_le(value as u16);
        } else if value < 0x0100_0000 {
            self.write_u8(0xFD);
            self.write_u24_le(value as u32);
        } else {
            self.write_u8(0xFE);
            self.write_u64_le(value);
        }
    }

    /// Write a length-encoded byte slice.
    pub fn write_lenenc_bytes(&mut self, data: &[u8]) {
        self.write_lenenc_int(data.len() as u64);
        self.buffer.extend_from_slice(data);
    }

    /// Write a length-encoded string in the connection encoding.
    pub fn write_lenenc_string(&mut self, s: &str) {
        let encoding = self.encoding;
        self.write_lenenc_bytes(&encoding.encode(s));
    }

    /// Write a null-terminated string in the connection encoding.
    pub fn write_null_string(&mut self, s: &str) {
        let encoding = self.encoding;
        self.buffer.extend_from_slice(&encoding.encode(s));
        self.buffer.push(0);
    }

    /// Write a string in the connection encoding, without terminator.
    pub fn write_string(&mut self, s: &str) {
        let encoding = self.encoding;
        self.buffer.extend_from_slice(&encoding.encode(s));
    }

    /// Write raw bytes.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Write zeros (filler).
    pub fn write_zeros(&mut self, count: usize) {
        self.buffer.resize(self.buffer.len() + count, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketReader;

    fn utf8_writer() -> PacketWriter {
        PacketWriter::new(TextEncoding::Utf8)
    }

    #[test]
    fn test_write_fixed_width_integers() {
        let mut writer = utf8_writer();
        writer.write_u8(0x42);
        writer.write_u16_le(0x1234);
        writer.write_u24_le(0x0012_3456);
        writer.write_u32_le(0x1234_5678);
        assert_eq!(
            writer.as_bytes(),
            &[0x42, 0x34, 0x12, 0x56, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12]
        );

        let mut writer = utf8_writer();
        writer.write_u64_le(0x0807_0605_0403_0201);
        assert_eq!(
            writer.as_bytes(),
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
        );
    }

    #[test]
    fn test_write_lenenc_int() {
        let cases: [(u64, &[u8]); 4] = [
            (0x42, &[0x42]),
            (0x1234, &[0xFC, 0x34, 0x12]),
            (0x0012_3456, &[0xFD, 0x56, 0x34, 0x12]),
            (
                0x0807_0605_0403_0201,
                &[0xFE, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08],
            ),
        ];
        for (value, expected) in cases {
            let mut writer = utf8_writer();
            writer.write_lenenc_int(value);
            assert_eq!(writer.as_bytes(), expected, "value {value:#x}");
        }
    }

    #[test]
    fn test_write_strings() {
        let mut writer = utf8_writer();
        writer.write_null_string("hello");
        writer.write_lenenc_string("héllo");
        assert_eq!(&writer.as_bytes()[..6], b"hello\0");
        assert_eq!(writer.as_bytes()[6], 6);
        assert_eq!(&writer.as_bytes()[7..], "héllo".as_bytes());
    }

    #[test]
    fn test_ascii_encoding_replaces_non_ascii() {
        let mut writer = PacketWriter::new(TextEncoding::Ascii);
        writer.write_null_string("héllo");
        assert_eq!(writer.as_bytes(), b"h?llo\0");
    }

    #[test]
    fn test_encoding_for_charset() {
        assert_eq!(
            TextEncoding::for_charset(charset::UTF8_GENERAL_CI),
            Some(TextEncoding::Utf8)
        );
        assert_eq!(
            TextEncoding::for_charset(charset::UTF8MB4_0900_AI_CI),
            Some(TextEncoding::Utf8)
        );
        assert_eq!(
            TextEncoding::for_charset(charset::ASCII_GENERAL_CI),
            Some(TextEncoding::Ascii)
        );
        assert_eq!(TextEncoding::for_charset(charset::LATIN1_SWEDISH_CI), None);
    }

    #[test]
    fn test_write_packet_header_uses_sequence_number() {
        let mut writer = utf8_writer();
        writer.increment_packet_number();
        writer.write_packet_header(5);
        writer.write_bytes(b"hello");
        assert_eq!(&writer.as_bytes()[..4], &[0x05, 0x00, 0x00, 0x01]);
        assert_eq!(&writer.as_bytes()[4..], b"hello");
    }

    #[test]
    fn test_begin_finish_backfills_header() {
        let mut writer = utf8_writer();
        writer.begin_packet();
        writer.write_u8(0x03);
        writer.write_string("SELECT 1");
        writer.finish_packet();

        let packet = writer.to_array();
        assert_eq!(&packet[..4], &[0x09, 0x00, 0x00, 0x00]);
        assert_eq!(packet[4], 0x03);
        assert_eq!(&packet[5..], b"SELECT 1");
        assert_eq!(writer.sequence_number(), 0);
    }

    #[test]
    fn test_two_packets_in_one_send() {
        let mut writer = utf8_writer();
        writer.begin_packet();
        writer.write_u8(0x0e);
        writer.finish_packet();
        writer.increment_packet_number();
        writer.begin_packet();
        writer.write_u8(0x01);
        writer.finish_packet();

        assert_eq!(
            writer.as_bytes(),
            &[0x01, 0x00, 0x00, 0x00, 0x0e, 0x01, 0x00, 0x00, 0x01, 0x01]
        );
    }

    #[test]
    fn test_reset() {
        let mut writer = utf8_writer();
        writer.increment_packet_number();
        writer.write_u8(1);
        writer.reset();
        assert!(writer.is_empty());
        assert_eq!(writer.sequence_number(), 0);
    }

    #[test]
    fn test_large_payload_is_split() {
        let mut writer = utf8_writer();
        writer.begin_packet();
        writer.write_zeros(MAX_PACKET_SIZE + 10);
        writer.finish_packet();

        let bytes = writer.as_bytes();
        let mut reader = PacketReader::new(bytes);
        assert_eq!(reader.read_u24_le(), Some(MAX_PACKET_SIZE as u32));
        assert_eq!(reader.read_u8(), Some(0));
        assert!(reader.skip(MAX_PACKET_SIZE));
        assert_eq!(reader.read_u24_le(), Some(10));
        assert_eq!(reader.read_u8(), Some(1));
        assert!(reader.skip(10));
        assert!(reader.is_empty());
        assert_eq!(writer.sequence_number(), 1);
    }

    #[test]
    fn test_exact_max_payload_gets_empty_terminator() {
        let mut writer = utf8_writer();
        writer.begin_packet();
        writer.write_zeros(MAX_PACKET_SIZE);
        writer.finish_packet();

        let bytes = writer.as_bytes();
        assert_eq!(bytes.len(), MAX_PACKET_SIZE + 2 * PacketHeader::SIZE);
        assert_eq!(&bytes[..4], &[0xFF, 0xFF, 0xFF, 0x00]);
        assert_eq!(&bytes[bytes.len() - 4..], &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(writer.sequence_number(), 1);
    }
}
