//! Handshake and result-set packet layouts.
//!
//! Decoders take the payload of one logical packet (header already
//! stripped) and return a protocol error when it is too short or malformed.

#![allow(clippy::cast_possible_truncation)]

use mysqlwire_core::Error;
use mysqlwire_core::error::ProtocolError;

use crate::protocol::{PacketReader, PacketWriter, capabilities};

/// The only handshake protocol version this client speaks.
pub const HANDSHAKE_PROTOCOL_VERSION: u8 = 10;

/// Length of the first scramble part in the greeting.
const SCRAMBLE_PART1_LEN: usize = 8;

/// Minimum length of the second scramble part, including its NUL.
const SCRAMBLE_PART2_MIN_LEN: usize = 13;

/// Second scramble part without the NUL.
const SCRAMBLE_PART2_LEN: usize = 12;

fn malformed(message: &str, payload: &[u8]) -> Error {
    Error::Protocol(ProtocolError {
        message: message.to_string(),
        raw_data: Some(payload.to_vec()),
        source: None,
    })
}

/// The server's initial handshake packet (protocol version 10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeGreeting {
    pub protocol_version: u8,
    pub server_version: String,
    /// Connection (thread) id assigned by the server
    pub thread_id: u32,
    pub scramble_part1: Vec<u8>,
    pub capabilities: u32,
    pub charset: u8,
    pub status_flags: u16,
    /// Second scramble part with its trailing NUL stripped
    pub scramble_part2: Vec<u8>,
    pub auth_plugin: Option<String>,
}

impl HandshakeGreeting {
    /// Decode a greeting payload.
    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let mut reader = PacketReader::new(payload);

        let protocol_version = reader
            .read_u8()
            .ok_or_else(|| malformed("Missing protocol version", payload))?;
        if protocol_version != HANDSHAKE_PROTOCOL_VERSION {
            return Err(malformed(
                &format!("Unsupported protocol version: {}", protocol_version),
                payload,
            ));
        }

        let server_version = reader.read_null_string();

        let thread_id = reader
            .read_u32_le()
            .ok_or_else(|| malformed("Missing connection ID", payload))?;

        let scramble_part1 = reader
            .read_bytes(SCRAMBLE_PART1_LEN)
            .ok_or_else(|| malformed("Missing auth data", payload))?
            .to_vec();

        // Filler
        reader.skip(1);

        let caps_lower = reader
            .read_u16_le()
            .ok_or_else(|| malformed("Missing capability flags", payload))?;

        let mut greeting = Self {
            protocol_version,
            server_version,
            thread_id,
            scramble_part1,
            capabilities: u32::from(caps_lower),
            charset: 0,
            status_flags: 0,
            scramble_part2: Vec::new(),
            auth_plugin: None,
        };

        // Pre-4.1 servers may stop here
        if reader.is_empty() {
            return Ok(greeting);
        }

        let (Some(charset), Some(status_flags), Some(caps_upper), Some(auth_data_len)) = (
            reader.read_u8(),
            reader.read_u16_le(),
            reader.read_u16_le(),
            reader.read_u8(),
        ) else {
            return Err(malformed("Truncated server status block", payload));
        };
        greeting.charset = charset;
        greeting.status_flags = status_flags;
        greeting.capabilities |= u32::from(caps_upper) << 16;

        if !reader.skip(10) {
            return Err(malformed("Truncated reserved bytes", payload));
        }

        if greeting.capabilities & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            if reader.remaining() < SCRAMBLE_PART2_LEN {
                return Err(malformed("Missing second auth data part", payload));
            }
            // Some servers leave out the trailing NUL the length counts.
            let len = usize::from(auth_data_len)
                .saturating_sub(SCRAMBLE_PART1_LEN)
                .max(SCRAMBLE_PART2_MIN_LEN)
                .min(reader.remaining());
            let part2 = reader
                .read_bytes(len)
                .ok_or_else(|| malformed("Missing second auth data part", payload))?;
            let part2 = part2.strip_suffix(&[0]).unwrap_or(part2);
            greeting.scramble_part2 = part2.to_vec();
        }

        if greeting.capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 && !reader.is_empty() {
            greeting.auth_plugin = Some(reader.read_null_string());
        }

        Ok(greeting)
    }

    /// Does the server speak protocol 4.1?
    pub fn protocol41(&self) -> bool {
        self.capabilities & capabilities::CLIENT_PROTOCOL_41 != 0
    }

    /// Full scramble: part 1 followed by part 2.
    pub fn scramble(&self) -> Vec<u8> {
        let mut scramble = Vec::with_capacity(self.scramble_part1.len() + self.scramble_part2.len());
        scramble.extend_from_slice(&self.scramble_part1);
        scramble.extend_from_slice(&self.scramble_part2);
        scramble
    }
}

/// The client's reply to the greeting, carrying credentials.
#[derive(Debug, Clone)]
pub struct HandshakeResponse<'a> {
    pub client_flags: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub user: &'a str,
    pub token: &'a [u8],
    pub database: &'a str,
    pub protocol41: bool,
}

impl HandshakeResponse<'_> {
    /// Write the payload into `writer`. Framing is the caller's job.
    pub fn write_payload(&self, writer: &mut PacketWriter) {
        if self.protocol41 {
            writer.write_u32_le(self.client_flags);
            writer.write_u32_le(self.max_packet_size);
            writer.write_u8(self.charset);
            writer.write_zeros(23);
            writer.write_null_string(self.user);
            writer.write_lenenc_bytes(self.token);
            writer.write_null_string(self.database);
        } else {
            writer.write_u16_le((self.client_flags & 0xFFFF) as u16);
            writer.write_u24_le(self.max_packet_size.min(0xFF_FFFF));
            writer.write_null_string(self.user);
            writer.write_bytes(self.token);
            if !self.database.is_empty() {
                writer.write_u8(0);
                writer.write_null_string(self.database);
            }
        }
    }
}

/// Field count announcing a text result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultSetHeader {
    pub column_count: u64,
}

impl ResultSetHeader {
    /// Decode the field-count packet.
    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let column_count = PacketReader::new(payload)
            .read_lenenc_int()
            .ok_or_else(|| malformed("Invalid result set header", payload))?;
        Ok(Self { column_count })
    }
}

/// One column of a result set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub charset: u16,
    pub column_length: u32,
    pub column_type: u8,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDefinition {
    /// Decode a column definition packet.
    pub fn decode(payload: &[u8], protocol41: bool) -> Result<Self, Error> {
        let mut reader = PacketReader::new(payload);
        let column = if protocol41 {
            Self::decode_41(&mut reader)
        } else {
            Self::decode_legacy(&mut reader)
        };
        column.ok_or_else(|| malformed("Invalid column definition", payload))
    }

    fn decode_41(reader: &mut PacketReader<'_>) -> Option<Self> {
        let _catalog = reader.read_lenenc_bytes()?;
        let schema = reader.read_lenenc_string()?;
        let table = reader.read_lenenc_string()?;
        let _org_table = reader.read_lenenc_bytes()?;
        let name = reader.read_lenenc_string()?;
        let _org_name = reader.read_lenenc_bytes()?;
        // Length of the fixed fields (always 0x0c)
        let _fixed_len = reader.read_lenenc_int()?;
        Some(Self {
            schema,
            table,
            name,
            charset: reader.read_u16_le()?,
            column_length: reader.read_u32_le()?,
            column_type: reader.read_u8()?,
            flags: reader.read_u16_le()?,
            decimals: reader.read_u8()?,
        })
    }

    fn decode_legacy(reader: &mut PacketReader<'_>) -> Option<Self> {
        let table = reader.read_lenenc_string()?;
        let name = reader.read_lenenc_string()?;

        let length = reader.read_lenenc_bytes()?;
        let mut column_length = 0u32;
        for (i, b) in length.iter().take(4).enumerate() {
            column_length |= u32::from(*b) << (8 * i);
        }

        let column_type = *reader.read_lenenc_bytes()?.first()?;

        // Flags (1 or 2 bytes) followed by the decimals byte
        let rest = reader.read_lenenc_bytes()?;
        let (flags, decimals) = match rest {
            [f0, f1, d, ..] => (u16::from_le_bytes([*f0, *f1]), *d),
            [f0, d] => (u16::from(*f0), *d),
            _ => return None,
        };

        Some(Self {
            schema: String::new(),
            table,
            name,
            charset: 0,
            column_length,
            column_type,
            flags,
            decimals,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::TextEncoding;

    /// A protocol 4.1 greeting payload as a 5.7 server sends it.
    pub(crate) fn greeting_payload(thread_id: u32, scramble: &[u8; 20], capabilities: u32) -> Vec<u8> {
        let mut payload = vec![HANDSHAKE_PROTOCOL_VERSION];
        payload.extend_from_slice(b"5.7.44-log\0");
        payload.extend_from_slice(&thread_id.to_le_bytes());
        payload.extend_from_slice(&scramble[..8]);
        payload.push(0);
        payload.extend_from_slice(&((capabilities & 0xFFFF) as u16).to_le_bytes());
        payload.push(33);
        payload.extend_from_slice(&0x0002u16.to_le_bytes());
        payload.extend_from_slice(&((capabilities >> 16) as u16).to_le_bytes());
        payload.push(21);
        payload.extend_from_slice(&[0; 10]);
        payload.extend_from_slice(&scramble[8..]);
        payload.push(0);
        payload.extend_from_slice(b"mysql_native_password\0");
        payload
    }

    pub(crate) const SERVER_CAPS: u32 = 0x807F_F7FF;

    #[test]
    fn test_decode_greeting() {
        let scramble = *b"ABCD1234efgh5678ijkl";
        let payload = greeting_payload(7, &scramble, SERVER_CAPS);
        let greeting = HandshakeGreeting::decode(&payload).unwrap();

        assert_eq!(greeting.protocol_version, 10);
        assert_eq!(greeting.server_version, "5.7.44-log");
        assert_eq!(greeting.thread_id, 7);
        assert_eq!(greeting.scramble_part1, b"ABCD1234");
        assert_eq!(greeting.scramble_part2, b"efgh5678ijkl");
        assert_eq!(greeting.scramble(), scramble);
        assert_eq!(greeting.charset, 33);
        assert_eq!(greeting.status_flags, 2);
        assert_eq!(greeting.capabilities, SERVER_CAPS);
        assert!(greeting.protocol41());
        assert_eq!(greeting.auth_plugin.as_deref(), Some("mysql_native_password"));
    }

    #[test]
    fn test_decode_greeting_rejects_other_protocols() {
        let mut payload = greeting_payload(1, b"ABCD1234efgh5678ijkl", SERVER_CAPS);
        payload[0] = 9;
        let err = HandshakeGreeting::decode(&payload).unwrap_err();
        assert!(err.to_string().contains("Unsupported protocol version"));
    }

    #[test]
    fn test_decode_truncated_greeting() {
        let payload = greeting_payload(1, b"ABCD1234efgh5678ijkl", SERVER_CAPS);
        let err = HandshakeGreeting::decode(&payload[..12]).unwrap_err();
        match err {
            Error::Protocol(p) => assert_eq!(p.raw_data.as_deref(), Some(&payload[..12])),
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_greeting_cut_in_reserved_bytes() {
        let payload = greeting_payload(7, b"ABCD1234efgh5678ijkl", SERVER_CAPS);
        // 1 + 11 + 4 + 8 + 1 + 2 + 1 + 2 + 2 + 1 bytes precede the reserved block.
        let cut = &payload[..33 + 3];
        let err = HandshakeGreeting::decode(cut).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err:?}");
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn test_decode_greeting_with_short_second_scramble_part() {
        let payload = greeting_payload(7, b"ABCD1234efgh5678ijkl", SERVER_CAPS);
        // Reserved block intact, only 5 bytes of the second part left.
        let cut = &payload[..43 + 5];
        let err = HandshakeGreeting::decode(cut).unwrap_err();
        assert!(err.to_string().contains("second auth data part"));
    }

    #[test]
    fn test_decode_minimal_legacy_greeting() {
        let mut payload = vec![10];
        payload.extend_from_slice(b"3.23.58\0");
        payload.extend_from_slice(&5u32.to_le_bytes());
        payload.extend_from_slice(b"abcdefgh\0");
        payload.extend_from_slice(&0x002Cu16.to_le_bytes());

        let greeting = HandshakeGreeting::decode(&payload).unwrap();
        assert_eq!(greeting.thread_id, 5);
        assert!(!greeting.protocol41());
        assert_eq!(greeting.scramble(), b"abcdefgh");
    }

    #[test]
    fn test_handshake_response_protocol41_layout() {
        let token = [0xAAu8; 20];
        let response = HandshakeResponse {
            client_flags: 0x0002_A20F,
            max_packet_size: 1 << 24,
            charset: 33,
            user: "root",
            token: &token,
            database: "app",
            protocol41: true,
        };
        let mut writer = PacketWriter::new(TextEncoding::Utf8);
        response.write_payload(&mut writer);
        let bytes = writer.as_bytes();

        assert_eq!(&bytes[..4], &0x0002_A20Fu32.to_le_bytes());
        assert_eq!(&bytes[4..8], &(1u32 << 24).to_le_bytes());
        assert_eq!(bytes[8], 33);
        assert!(bytes[9..32].iter().all(|&b| b == 0));
        assert_eq!(&bytes[32..37], b"root\0");
        assert_eq!(bytes[37], 20);
        assert_eq!(&bytes[38..58], &token);
        assert_eq!(&bytes[58..], b"app\0");
    }

    #[test]
    fn test_handshake_response_legacy_layout() {
        let token = [0x11u8; 20];
        let response = HandshakeResponse {
            client_flags: 0x0002_A20F,
            max_packet_size: 1 << 24,
            charset: 33,
            user: "bob",
            token: &token,
            database: "shop",
            protocol41: false,
        };
        let mut writer = PacketWriter::new(TextEncoding::Utf8);
        response.write_payload(&mut writer);
        let bytes = writer.as_bytes();

        assert_eq!(&bytes[..2], &[0x0F, 0xA2]);
        assert_eq!(&bytes[2..5], &[0xFF, 0xFF, 0xFF]);
        assert_eq!(&bytes[5..9], b"bob\0");
        assert_eq!(&bytes[9..29], &token);
        assert_eq!(bytes[29], 0);
        assert_eq!(&bytes[30..], b"shop\0");

        let no_db = HandshakeResponse {
            database: "",
            ..response
        };
        let mut writer = PacketWriter::new(TextEncoding::Utf8);
        no_db.write_payload(&mut writer);
        assert_eq!(writer.len(), 29);
    }

    pub(crate) fn column_payload(name: &str) -> Vec<u8> {
        let mut writer = PacketWriter::new(TextEncoding::Utf8);
        writer.write_lenenc_string("def");
        writer.write_lenenc_string("app");
        writer.write_lenenc_string("users");
        writer.write_lenenc_string("users");
        writer.write_lenenc_string(name);
        writer.write_lenenc_string(name);
        writer.write_lenenc_int(0x0c);
        writer.write_u16_le(33);
        writer.write_u32_le(255);
        writer.write_u8(0xFD);
        writer.write_u16_le(0x0001);
        writer.write_u8(0);
        writer.write_zeros(2);
        writer.to_array()
    }

    #[test]
    fn test_decode_column_definition() {
        let column = ColumnDefinition::decode(&column_payload("email"), true).unwrap();
        assert_eq!(column.schema, "app");
        assert_eq!(column.table, "users");
        assert_eq!(column.name, "email");
        assert_eq!(column.charset, 33);
        assert_eq!(column.column_length, 255);
        assert_eq!(column.column_type, 0xFD);
        assert_eq!(column.flags, 1);
        assert_eq!(column.decimals, 0);
    }

    #[test]
    fn test_decode_legacy_column_definition() {
        let mut payload = Vec::new();
        payload.push(5);
        payload.extend_from_slice(b"users");
        payload.push(2);
        payload.extend_from_slice(b"id");
        payload.extend_from_slice(&[3, 11, 0, 0]);
        payload.extend_from_slice(&[1, 3]);
        payload.extend_from_slice(&[3, 0x03, 0x42, 0]);

        let column = ColumnDefinition::decode(&payload, false).unwrap();
        assert_eq!(column.table, "users");
        assert_eq!(column.name, "id");
        assert_eq!(column.column_length, 11);
        assert_eq!(column.column_type, 3);
        assert_eq!(column.flags, 0x4203);
        assert_eq!(column.decimals, 0);
    }

    #[test]
    fn test_result_set_header() {
        assert_eq!(
            ResultSetHeader::decode(&[0x03]).unwrap(),
            ResultSetHeader { column_count: 3 }
        );
        assert!(ResultSetHeader::decode(&[]).is_err());
    }
}
