//! A MySQL client connection.
//!
//! [`Connection`] ties the buffered socket, the packet writer and the
//! parser together. It performs the handshake and offers the small command
//! surface the chain steps and higher layers build on. Every operation takes
//! `&mut self`, so at most one exchange with the server is in flight.

use std::fmt;

use asupersync::net::TcpStream;
use asupersync::{Cx, Outcome};

use mysqlwire_core::Error;
use mysqlwire_core::error::{
    ConnectionError, ConnectionErrorKind, ProgrammingErrorKind, ServerError,
};

use crate::auth;
use crate::config::ConnectionConfig;
use crate::io::{RecvEvent, SendEvent, SocketIo, Transport};
use crate::protocol::{
    ColumnDefinition, Command, ErrPacket, HandshakeGreeting, HandshakeResponse, OkPacket,
    PacketParser, PacketWriter, ParseResult, ParserPhase, capabilities, server_status,
};

/// Propagate anything but `Outcome::Ok`.
macro_rules! try_outcome {
    ($outcome:expr) => {
        match $outcome {
            Outcome::Ok(value) => value,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
            Outcome::Panicked(payload) => return Outcome::Panicked(payload),
        }
    };
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Socket open, waiting for the greeting
    Connecting,
    /// Credentials sent, waiting for the verdict
    Authenticating,
    /// Authenticated; commands may be sent
    Ready,
    /// The last connect attempt failed
    Failed,
    /// Quit was sent and the socket released
    Closed,
}

/// Column metadata and raw text rows of one result set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub columns: Vec<ColumnDefinition>,
    /// Raw text values, `None` for SQL NULL
    pub rows: Vec<Vec<Option<Vec<u8>>>>,
}

impl ResultSet {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Value of `column` in row `row` as UTF-8, `None` for NULL or out of range.
    pub fn text(&self, row: usize, column: usize) -> Option<&str> {
        let value = self.rows.get(row)?.get(column)?.as_deref()?;
        std::str::from_utf8(value).ok()
    }
}

/// What a text query returned. Values are not decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResult {
    /// A statement without a result set
    Ok(OkPacket),
    ResultSet(ResultSet),
}

impl QueryResult {
    pub fn into_result_set(self) -> Option<ResultSet> {
        match self {
            QueryResult::ResultSet(rs) => Some(rs),
            QueryResult::Ok(_) => None,
        }
    }

    pub fn affected_rows(&self) -> u64 {
        match self {
            QueryResult::Ok(ok) => ok.affected_rows,
            QueryResult::ResultSet(_) => 0,
        }
    }
}

/// One client connection over a stream `S`.
pub struct Connection<S = TcpStream> {
    config: ConnectionConfig,
    socket: SocketIo<S>,
    writer: PacketWriter,
    parser: PacketParser,
    state: ConnectionState,
    thread_id: u32,
    protocol41: bool,
    connected_success: bool,
    server_version: Option<String>,
    server_capabilities: u32,
    status_flags: u16,
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("thread_id", &self.thread_id)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("database", &self.config.database)
            .finish_non_exhaustive()
    }
}

impl<S: Transport> Connection<S> {
    /// Create an unconnected connection; [`connect`](Self::connect) dials.
    pub fn new(config: ConnectionConfig) -> Result<Self, Error> {
        config.validate()?;
        let encoding = config.text_encoding()?;
        Ok(Self {
            socket: SocketIo::new(config.recv_buffer_size, config.send_buffer_size),
            writer: PacketWriter::new(encoding),
            parser: PacketParser::new(),
            state: ConnectionState::Disconnected,
            thread_id: 0,
            protocol41: false,
            connected_success: false,
            server_version: None,
            server_capabilities: 0,
            status_flags: 0,
            config,
        })
    }

    /// Create a connection over a stream that is already open.
    /// [`connect`](Self::connect) then skips dialing.
    pub fn with_stream(config: ConnectionConfig, stream: S) -> Result<Self, Error> {
        let mut conn = Self::new(config)?;
        conn.socket.bind(stream);
        Ok(conn)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Ready for commands?
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// Did the last [`connect`](Self::connect) authenticate?
    pub fn connected_success(&self) -> bool {
        self.connected_success
    }

    /// Server thread id from the greeting.
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// Whether the server speaks protocol 4.1.
    pub fn protocol41(&self) -> bool {
        self.protocol41
    }

    pub fn server_version(&self) -> Option<&str> {
        self.server_version.as_deref()
    }

    pub fn server_capabilities(&self) -> u32 {
        self.server_capabilities
    }

    /// Status flags from the last OK or EOF packet.
    pub fn status_flags(&self) -> u16 {
        self.status_flags
    }

    /// Sequence number the writer will put on its next packet.
    pub fn sequence_number(&self) -> u8 {
        self.writer.sequence_number()
    }

    /// Direct access to the writer for collaborators framing their own
    /// packets. Send the result with [`start_send`](Self::start_send).
    pub fn packet_writer_mut(&mut self) -> &mut PacketWriter {
        &mut self.writer
    }

    pub fn parser_phase(&self) -> ParserPhase {
        self.parser.phase()
    }

    /// Tell the parser what to expect next.
    pub fn set_parser_phase(&mut self, phase: ParserPhase) -> Result<(), Error> {
        self.parser.transition(phase)
    }

    /// Open the socket (unless a stream was supplied), read the greeting
    /// and authenticate.
    ///
    /// On failure the connection is left in [`ConnectionState::Failed`]
    /// with `connected_success() == false`; the socket is released.
    #[tracing::instrument(
        level = "debug",
        skip(self, cx),
        fields(addr = %self.config.socket_addr(), user = %self.config.user)
    )]
    pub async fn connect(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Authenticating | ConnectionState::Ready
        ) {
            return Outcome::Err(Error::programming(
                ProgrammingErrorKind::AlreadyConnected,
                "connect called on a connection that is already connected",
            ));
        }
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }

        self.connected_success = false;
        self.state = ConnectionState::Connecting;
        self.parser = PacketParser::new();
        self.writer.reset();

        if !self.socket.is_bound() {
            let addr = self.config.socket_addr();
            match S::dial(&addr, self.config.connect_timeout).await {
                Ok(stream) => self.socket.bind(stream),
                Err(e) => {
                    self.state = ConnectionState::Failed;
                    let kind = if e.kind() == std::io::ErrorKind::ConnectionRefused {
                        ConnectionErrorKind::Refused
                    } else {
                        ConnectionErrorKind::Connect
                    };
                    return Outcome::Err(Error::Connection(ConnectionError {
                        kind,
                        message: format!("Failed to connect to {}: {}", addr, e),
                        source: Some(Box::new(e)),
                    }));
                }
            }
        }

        let outcome = self.handshake(cx).await;
        match &outcome {
            Outcome::Ok(()) => {
                self.state = ConnectionState::Ready;
                self.connected_success = true;
                tracing::debug!(
                    thread_id = self.thread_id,
                    server_version = self.server_version.as_deref().unwrap_or(""),
                    "Connected"
                );
            }
            _ => {
                self.state = ConnectionState::Failed;
                self.socket.shutdown().await;
                self.parser.clear();
            }
        }
        outcome
    }

    async fn handshake(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let greeting = match try_outcome!(self.receive_packet(cx).await) {
            ParseResult::HandshakeGreeting(greeting) => greeting,
            ParseResult::Error(err) => {
                return Outcome::Err(Error::connection(
                    ConnectionErrorKind::Connect,
                    format!("Server refused the connection: {}", err.error_message),
                ));
            }
            other => {
                return Outcome::Err(Error::protocol(format!(
                    "Expected handshake greeting, got {}",
                    other.kind()
                )));
            }
        };
        tracing::debug!(
            thread_id = greeting.thread_id,
            server_version = %greeting.server_version,
            protocol41 = greeting.protocol41(),
            "Received greeting"
        );

        self.thread_id = greeting.thread_id;
        self.protocol41 = greeting.protocol41();
        self.server_version = Some(greeting.server_version.clone());
        self.server_capabilities = greeting.capabilities;
        self.status_flags = greeting.status_flags;
        self.state = ConnectionState::Authenticating;

        if let Err(e) = self.write_credentials(&greeting) {
            return Outcome::Err(e);
        }
        try_outcome!(self.flush_writer().await);

        if let Err(e) = self.parser.transition(ParserPhase::AwaitingResult) {
            return Outcome::Err(e);
        }
        let verdict = try_outcome!(self.receive_packet(cx).await);
        self.writer.reset();

        match verdict {
            ParseResult::Ok(ok) => {
                self.status_flags = ok.status_flags;
                Outcome::Ok(())
            }
            ParseResult::Error(err) => {
                let message = if err.is_access_denied() {
                    format!("Access denied: {}", err.error_message)
                } else {
                    format!("Authentication failed: {}", err.error_message)
                };
                Outcome::Err(Error::connection(ConnectionErrorKind::Authentication, message))
            }
            other => Outcome::Err(Error::connection(
                ConnectionErrorKind::Authentication,
                format!("Unexpected {} after sending credentials", other.kind()),
            )),
        }
    }

    fn write_credentials(&mut self, greeting: &HandshakeGreeting) -> Result<(), Error> {
        if greeting.capabilities & capabilities::CLIENT_SECURE_CONNECTION == 0
            && !self.config.insecure_auth
        {
            return Err(Error::connection(
                ConnectionErrorKind::Authentication,
                "Server only offers pre-4.1 password authentication; enable insecure_auth to allow it",
            ));
        }
        if let Some(plugin) = greeting.auth_plugin.as_deref() {
            if plugin != auth::plugins::MYSQL_NATIVE_PASSWORD {
                tracing::warn!(
                    plugin,
                    "Server default auth plugin differs, sending a native password token"
                );
            }
        }

        let password = self.config.password.as_deref().unwrap_or("");
        let token = auth::make_token(password.as_bytes(), &greeting.scramble());
        let response = HandshakeResponse {
            client_flags: self.config.capability_flags() & greeting.capabilities,
            max_packet_size: self.config.max_packet_size,
            charset: self.config.charset,
            user: &self.config.user,
            token: &token,
            database: self.config.database.as_deref().unwrap_or(""),
            protocol41: self.protocol41,
        };

        self.writer.reset();
        self.writer.increment_packet_number();
        self.writer.begin_packet();
        response.write_payload(&mut self.writer);
        self.writer.finish_packet();
        tracing::trace!(bytes = self.writer.len(), "Framed credentials");
        Ok(())
    }

    /// Send quit and release the socket. Failures while quitting are only
    /// logged.
    pub async fn disconnect(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.state == ConnectionState::Closed {
            return Outcome::Ok(());
        }
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }

        if self.state == ConnectionState::Ready && self.socket.is_bound() {
            self.writer.reset();
            self.writer.begin_packet();
            self.writer.write_u8(Command::Quit as u8);
            self.writer.finish_packet();
            if let Outcome::Err(e) = self.flush_writer().await {
                tracing::warn!(error = %e, "Failed to send quit");
            }
        }
        self.socket.shutdown().await;
        self.parser = PacketParser::new();
        self.writer.reset();
        self.state = ConnectionState::Closed;
        tracing::debug!(thread_id = self.thread_id, "Disconnected");
        Outcome::Ok(())
    }

    /// Send raw, already framed bytes.
    pub async fn start_send(&mut self, cx: &Cx, bytes: &[u8]) -> Outcome<(), Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        if let Err(e) = self.socket.enqueue_send(bytes) {
            return Outcome::Err(e);
        }
        self.send_enqueued().await
    }

    /// Receive until the parser has a result for the current phase.
    pub async fn start_receive(&mut self, cx: &Cx) -> Outcome<ParseResult, Error> {
        self.receive_packet(cx).await
    }

    /// Frame `command` + `payload` as a fresh exchange and send it.
    ///
    /// The parser is put in [`ParserPhase::AwaitingResult`].
    pub async fn send_command(
        &mut self,
        cx: &Cx,
        command: Command,
        payload: &[u8],
    ) -> Outcome<(), Error> {
        if let Err(e) = self.require_ready() {
            return Outcome::Err(e);
        }
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        if let Err(e) = self.parser.transition(ParserPhase::AwaitingResult) {
            return Outcome::Err(e);
        }

        self.writer.reset();
        self.writer.begin_packet();
        self.writer.write_u8(command as u8);
        self.writer.write_bytes(payload);
        self.writer.finish_packet();
        tracing::trace!(?command, bytes = payload.len(), "Sending command");
        self.flush_writer().await
    }

    /// Round-trip a ping.
    pub async fn ping(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_outcome!(self.send_command(cx, Command::Ping, &[]).await);
        self.expect_ok(cx, None).await.map(|_| ())
    }

    /// Switch the default database.
    pub async fn init_db(&mut self, cx: &Cx, database: &str) -> Outcome<(), Error> {
        let payload = self.writer.encoding().encode(database);
        try_outcome!(self.send_command(cx, Command::InitDb, &payload).await);
        self.expect_ok(cx, None).await.map(|_| ())
    }

    /// Run a text query and return its first result.
    pub async fn query(&mut self, cx: &Cx, sql: &str) -> Outcome<QueryResult, Error> {
        let results = try_outcome!(self.query_all(cx, sql).await);
        match results.into_iter().next() {
            Some(first) => Outcome::Ok(first),
            None => Outcome::Err(Error::protocol("Query produced no result")),
        }
    }

    /// Run a text query and return every result it produced (several when
    /// multiple statements are enabled).
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn query_all(&mut self, cx: &Cx, sql: &str) -> Outcome<Vec<QueryResult>, Error> {
        let payload = self.writer.encoding().encode(sql);
        try_outcome!(self.send_command(cx, Command::Query, &payload).await);

        let mut results = Vec::new();
        loop {
            results.push(try_outcome!(self.read_query_result(cx, sql).await));
            if self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS == 0 {
                break;
            }
        }
        tracing::debug!(results = results.len(), "Query complete");
        Outcome::Ok(results)
    }

    /// Discard whatever the server already sent and nobody read, up to the
    /// configured drain limit. Never waits for more input.
    pub async fn clear_remaining_input(&mut self) -> Outcome<usize, Error> {
        let buffered = self.parser.buffered_len();
        self.parser.clear();
        match self.socket.drain_available(self.config.drain_limit).await {
            Ok(drained) => {
                if buffered + drained > 0 {
                    tracing::debug!(buffered, drained, "Discarded unread input");
                }
                Outcome::Ok(buffered + drained)
            }
            Err(e) => {
                self.state = ConnectionState::Failed;
                Outcome::Err(e)
            }
        }
    }

    fn require_ready(&self) -> Result<(), Error> {
        if self.state == ConnectionState::Ready {
            Ok(())
        } else {
            Err(Error::programming(
                ProgrammingErrorKind::NotConnected,
                format!("connection is {:?}, not ready for commands", self.state),
            ))
        }
    }

    async fn expect_ok(&mut self, cx: &Cx, sql: Option<&str>) -> Outcome<OkPacket, Error> {
        match try_outcome!(self.receive_packet(cx).await) {
            ParseResult::Ok(ok) => {
                self.status_flags = ok.status_flags;
                Outcome::Ok(ok)
            }
            ParseResult::Error(err) => Outcome::Err(server_error(err, sql)),
            other => Outcome::Err(Error::protocol(format!("Expected OK, got {}", other.kind()))),
        }
    }

    async fn read_query_result(&mut self, cx: &Cx, sql: &str) -> Outcome<QueryResult, Error> {
        if let Err(e) = self.parser.transition(ParserPhase::AwaitingResult) {
            return Outcome::Err(e);
        }
        let column_count = match try_outcome!(self.receive_packet(cx).await) {
            ParseResult::Ok(ok) => {
                self.status_flags = ok.status_flags;
                return Outcome::Ok(QueryResult::Ok(ok));
            }
            ParseResult::Error(err) => return Outcome::Err(server_error(err, Some(sql))),
            ParseResult::ResultSetHeader(header) => header.column_count,
            ParseResult::GenericResult(file_name) => {
                return self.decline_local_infile(cx, &file_name).await;
            }
            other => {
                return Outcome::Err(Error::protocol(format!(
                    "Expected query result, got {}",
                    other.kind()
                )));
            }
        };

        if let Err(e) = self.parser.transition(ParserPhase::AwaitingRows { column_count }) {
            return Outcome::Err(e);
        }
        let mut result_set = ResultSet::default();
        let mut columns_done = false;
        loop {
            match try_outcome!(self.receive_packet(cx).await) {
                ParseResult::ColumnDefinition(column) => result_set.columns.push(column),
                ParseResult::Eof(eof) if !columns_done => {
                    columns_done = true;
                    self.status_flags = eof.status_flags;
                }
                ParseResult::Eof(eof) => {
                    self.status_flags = eof.status_flags;
                    break;
                }
                ParseResult::Row(row) => result_set.rows.push(row),
                ParseResult::Error(err) => {
                    self.status_flags = 0;
                    if let Err(e) = self.parser.transition(ParserPhase::AwaitingResult) {
                        tracing::debug!(error = %e, "Parser left in row phase after server error");
                    }
                    return Outcome::Err(server_error(err, Some(sql)));
                }
                other => {
                    return Outcome::Err(Error::protocol(format!(
                        "Unexpected {} inside a result set",
                        other.kind()
                    )));
                }
            }
        }

        tracing::trace!(
            columns = result_set.columns.len(),
            rows = result_set.rows.len(),
            "Read result set"
        );
        if let Err(e) = self.parser.transition(ParserPhase::AwaitingResult) {
            return Outcome::Err(e);
        }
        Outcome::Ok(QueryResult::ResultSet(result_set))
    }

    /// Answer a `LOCAL INFILE` request with an empty file, read the
    /// server's reply and report the request as unsupported.
    async fn decline_local_infile(
        &mut self,
        cx: &Cx,
        file_name: &[u8],
    ) -> Outcome<QueryResult, Error> {
        let file_name = String::from_utf8_lossy(file_name).into_owned();
        tracing::warn!(file = %file_name, "Declining LOCAL INFILE request");

        let next_seq = self
            .parser
            .last_sequence_id()
            .map_or(0, |seq| seq.wrapping_add(1));
        self.writer.reset();
        self.writer.set_sequence_number(next_seq);
        self.writer.begin_packet();
        self.writer.finish_packet();
        try_outcome!(self.flush_writer().await);

        match try_outcome!(self.receive_packet(cx).await) {
            ParseResult::Ok(ok) => self.status_flags = ok.status_flags,
            ParseResult::Error(_) => self.status_flags = 0,
            other => {
                return Outcome::Err(Error::protocol(format!(
                    "Expected reply to empty LOCAL INFILE, got {}",
                    other.kind()
                )));
            }
        }
        Outcome::Err(Error::protocol(format!(
            "LOCAL INFILE of '{}' is not supported",
            file_name
        )))
    }

    /// Decode buffered bytes first; read from the socket only when the
    /// parser has nothing complete.
    async fn receive_packet(&mut self, cx: &Cx) -> Outcome<ParseResult, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        loop {
            if let Err(e) = self.parser.advance() {
                return Outcome::Err(e);
            }
            if let Some(result) = self.parser.take_result() {
                return Outcome::Ok(result);
            }

            match self.socket.start_receive().await {
                Ok(RecvEvent::HasData(_)) => {
                    if let Err(e) = self.parser.parse_data(self.socket.received()) {
                        return Outcome::Err(e);
                    }
                }
                Ok(RecvEvent::NoMoreData) => {
                    self.state = ConnectionState::Failed;
                    return Outcome::Err(Error::connection(
                        ConnectionErrorKind::Disconnected,
                        "Connection closed by server",
                    ));
                }
                Ok(RecvEvent::SocketError(e)) => {
                    self.state = ConnectionState::Failed;
                    return Outcome::Err(Error::Connection(ConnectionError {
                        kind: ConnectionErrorKind::Disconnected,
                        message: format!("Failed to receive: {}", e),
                        source: Some(Box::new(e)),
                    }));
                }
                Err(e) => return Outcome::Err(e),
            }
        }
    }

    async fn flush_writer(&mut self) -> Outcome<(), Error> {
        if let Err(e) = self.socket.enqueue_send(self.writer.as_bytes()) {
            return Outcome::Err(e);
        }
        self.send_enqueued().await
    }

    async fn send_enqueued(&mut self) -> Outcome<(), Error> {
        match self.socket.start_send().await {
            Ok(SendEvent::Complete) => Outcome::Ok(()),
            Ok(SendEvent::SocketError(e)) => {
                self.state = ConnectionState::Failed;
                Outcome::Err(Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Disconnected,
                    message: format!("Failed to send: {}", e),
                    source: Some(Box::new(e)),
                }))
            }
            Err(e) => Outcome::Err(e),
        }
    }
}

fn server_error(err: ErrPacket, sql: Option<&str>) -> Error {
    Error::Server(ServerError {
        code: err.error_code,
        sqlstate: (!err.sql_state.is_empty()).then_some(err.sql_state),
        message: err.error_message,
        sql: sql.map(str::to_string),
    })
}
