//! Incremental packet parser.
//!
//! Bytes arrive from the socket in arbitrary pieces. [`PacketParser`]
//! buffers them, cuts them into packets, stitches continuation chunks back
//! into one logical packet and decodes it according to the current
//! [`ParserPhase`]. At most one decoded result is held at a time; further
//! bytes stay buffered until the result is taken and [`PacketParser::advance`]
//! is called.

use std::ops::Range;

use mysqlwire_core::Error;
use mysqlwire_core::error::ProgrammingErrorKind;

use crate::protocol::packets::{ColumnDefinition, HandshakeGreeting, ResultSetHeader};
use crate::protocol::{EofPacket, ErrPacket, OkPacket, PacketHeader, PacketReader, PacketType};

/// What kind of packet the connection expects next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParserPhase {
    /// Server greeting (initial phase)
    #[default]
    AwaitingHandshake,
    /// OK, ERR, EOF, local infile request or a result set header
    AwaitingResult,
    /// Column definitions, their EOF, then rows until EOF or ERR
    AwaitingRows { column_count: u64 },
}

/// One decoded logical packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    HandshakeGreeting(HandshakeGreeting),
    Ok(OkPacket),
    Error(ErrPacket),
    /// Local infile request; carries the file name bytes
    GenericResult(Vec<u8>),
    ResultSetHeader(ResultSetHeader),
    ColumnDefinition(ColumnDefinition),
    /// Raw text values, `None` for SQL NULL
    Row(Vec<Option<Vec<u8>>>),
    Eof(EofPacket),
}

impl ParseResult {
    /// Short name for logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            ParseResult::HandshakeGreeting(_) => "handshake greeting",
            ParseResult::Ok(_) => "OK",
            ParseResult::Error(_) => "ERR",
            ParseResult::GenericResult(_) => "local infile request",
            ParseResult::ResultSetHeader(_) => "result set header",
            ParseResult::ColumnDefinition(_) => "column definition",
            ParseResult::Row(_) => "row",
            ParseResult::Eof(_) => "EOF",
        }
    }
}

/// Phase-dependent decoding state.
#[derive(Debug, Default)]
struct Decoder {
    phase: ParserPhase,
    protocol41: bool,
    columns_read: u64,
    columns_terminated: bool,
}

impl Decoder {
    fn decode(&mut self, payload: &[u8]) -> Result<ParseResult, Error> {
        match self.phase {
            ParserPhase::AwaitingHandshake => self.decode_handshake(payload),
            ParserPhase::AwaitingResult => self.decode_result(payload),
            ParserPhase::AwaitingRows { column_count } => self.decode_rows(payload, column_count),
        }
    }

    fn decode_handshake(&mut self, payload: &[u8]) -> Result<ParseResult, Error> {
        if payload.first() == Some(&0xFF) {
            // Pre-handshake errors never carry a SQL state
            return decode_err(payload, false);
        }
        let greeting = HandshakeGreeting::decode(payload)?;
        self.protocol41 = greeting.protocol41();
        Ok(ParseResult::HandshakeGreeting(greeting))
    }

    fn decode_result(&self, payload: &[u8]) -> Result<ParseResult, Error> {
        let first = *payload
            .first()
            .ok_or_else(|| Error::protocol("Empty result packet"))?;

        match PacketType::from_first_byte(first, payload.len()) {
            PacketType::Ok => PacketReader::new(payload)
                .parse_ok_packet(self.protocol41)
                .map(ParseResult::Ok)
                .ok_or_else(|| Error::protocol("Invalid OK packet")),
            PacketType::Error => decode_err(payload, self.protocol41),
            PacketType::Eof => self.decode_eof(payload),
            PacketType::LocalInfile => Ok(ParseResult::GenericResult(payload[1..].to_vec())),
            PacketType::Data => ResultSetHeader::decode(payload).map(ParseResult::ResultSetHeader),
        }
    }

    fn decode_rows(&mut self, payload: &[u8], column_count: u64) -> Result<ParseResult, Error> {
        let first = *payload
            .first()
            .ok_or_else(|| Error::protocol("Empty result set packet"))?;
        let packet_type = PacketType::from_first_byte(first, payload.len());

        if packet_type == PacketType::Error {
            return decode_err(payload, self.protocol41);
        }

        if self.columns_read < column_count {
            self.columns_read += 1;
            return ColumnDefinition::decode(payload, self.protocol41)
                .map(ParseResult::ColumnDefinition);
        }

        if !self.columns_terminated {
            if packet_type != PacketType::Eof {
                return Err(Error::protocol(format!(
                    "Expected EOF after {} column definitions",
                    column_count
                )));
            }
            self.columns_terminated = true;
            return self.decode_eof(payload);
        }

        if packet_type == PacketType::Eof {
            return self.decode_eof(payload);
        }

        let mut reader = PacketReader::new(payload);
        let mut values = Vec::new();
        for _ in 0..column_count {
            let value = reader
                .read_lenenc_value()
                .ok_or_else(|| Error::protocol("Truncated row packet"))?;
            values.push(value);
        }
        Ok(ParseResult::Row(values))
    }

    fn decode_eof(&self, payload: &[u8]) -> Result<ParseResult, Error> {
        PacketReader::new(payload)
            .parse_eof_packet(self.protocol41)
            .map(ParseResult::Eof)
            .ok_or_else(|| Error::protocol("Invalid EOF packet"))
    }
}

fn decode_err(payload: &[u8], protocol41: bool) -> Result<ParseResult, Error> {
    PacketReader::new(payload)
        .parse_err_packet(protocol41)
        .map(ParseResult::Error)
        .ok_or_else(|| Error::protocol("Invalid error packet"))
}

/// Reassembles packets from a byte stream and decodes them by phase.
#[derive(Debug, Default)]
pub struct PacketParser {
    decoder: Decoder,
    /// Received bytes; `pos` marks the first one not yet cut into a packet
    buffer: Vec<u8>,
    pos: usize,
    /// Continuation chunks of the logical packet being assembled
    assembling: Vec<u8>,
    last_sequence_id: Option<u8>,
    ready: Option<ParseResult>,
}

impl PacketParser {
    /// Create a parser in [`ParserPhase::AwaitingHandshake`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    pub fn phase(&self) -> ParserPhase {
        self.decoder.phase
    }

    /// Whether OK/ERR/EOF packets are decoded with the 4.1 layout.
    pub fn protocol41(&self) -> bool {
        self.decoder.protocol41
    }

    /// Override the protocol 4.1 flag (normally taken from the greeting).
    pub fn set_protocol41(&mut self, protocol41: bool) {
        self.decoder.protocol41 = protocol41;
    }

    /// Sequence number of the last packet cut from the stream.
    pub fn last_sequence_id(&self) -> Option<u8> {
        self.last_sequence_id
    }

    /// Are continuation chunks of an unfinished logical packet held?
    pub fn is_mid_packet(&self) -> bool {
        !self.assembling.is_empty()
    }

    /// Number of received bytes not yet cut into packets.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() - self.pos
    }

    /// Switch to another phase.
    ///
    /// Refused while a logical packet is half assembled: its remaining
    /// chunks belong to the phase that started it.
    pub fn transition(&mut self, phase: ParserPhase) -> Result<(), Error> {
        if self.is_mid_packet() {
            return Err(Error::programming(
                ProgrammingErrorKind::MidPacketTransition,
                format!(
                    "cannot switch parser from {:?} to {:?} in the middle of a packet",
                    self.decoder.phase, phase
                ),
            ));
        }
        tracing::trace!(from = ?self.decoder.phase, to = ?phase, "Parser transition");
        self.decoder.phase = phase;
        self.decoder.columns_read = 0;
        self.decoder.columns_terminated = false;
        Ok(())
    }

    /// Feed received bytes and decode the next packet if the slot is free.
    pub fn parse_data(&mut self, data: &[u8]) -> Result<(), Error> {
        self.compact();
        self.buffer.extend_from_slice(data);
        self.advance()
    }

    /// The decoded result waiting to be taken, if any.
    pub fn ready(&self) -> Option<&ParseResult> {
        self.ready.as_ref()
    }

    /// Take the decoded result. Does not decode the next packet.
    pub fn take_result(&mut self) -> Option<ParseResult> {
        self.ready.take()
    }

    /// Decode the next complete buffered packet into the free slot.
    ///
    /// A decoding error consumes the offending packet.
    pub fn advance(&mut self) -> Result<(), Error> {
        while self.ready.is_none() {
            let Some((header, range)) = self.next_chunk() else {
                break;
            };
            self.last_sequence_id = Some(header.sequence_id);

            if header.is_continued() {
                self.assembling.extend_from_slice(&self.buffer[range]);
                tracing::trace!(
                    assembled = self.assembling.len(),
                    "Buffered continuation chunk"
                );
                continue;
            }

            let decoded = if self.assembling.is_empty() {
                self.decoder.decode(&self.buffer[range])
            } else {
                let mut payload = std::mem::take(&mut self.assembling);
                payload.extend_from_slice(&self.buffer[range]);
                self.decoder.decode(&payload)
            };
            let result = decoded?;

            tracing::trace!(
                kind = result.kind(),
                sequence_id = header.sequence_id,
                "Decoded packet"
            );
            self.ready = Some(result);
        }
        Ok(())
    }

    /// Drop everything buffered, keeping the phase.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.pos = 0;
        self.assembling.clear();
        self.ready = None;
    }

    /// Cut the next complete physical packet from the buffer.
    fn next_chunk(&mut self) -> Option<(PacketHeader, Range<usize>)> {
        let available = &self.buffer[self.pos..];
        let header_bytes: [u8; PacketHeader::SIZE] =
            available.get(..PacketHeader::SIZE)?.try_into().ok()?;
        let header = PacketHeader::from_bytes(&header_bytes);
        let end = PacketHeader::SIZE + header.payload_length as usize;
        if available.len() < end {
            return None;
        }
        let range = self.pos + PacketHeader::SIZE..self.pos + end;
        self.pos += end;
        Some((header, range))
    }

    fn compact(&mut self) {
        if self.pos == self.buffer.len() {
            self.buffer.clear();
            self.pos = 0;
        } else if self.pos > 0 && self.pos >= self.buffer.len() / 2 {
            self.buffer.drain(..self.pos);
            self.pos = 0;
        }
    }
}
