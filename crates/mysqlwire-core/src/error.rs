//! Error types for mysqlwire operations.

use std::fmt;

/// The primary error type for all mysqlwire operations.
#[derive(Debug)]
pub enum Error {
    /// Transport and authentication failures (connect, disconnect, auth)
    Connection(ConnectionError),
    /// Unexpected packet content (wire-level)
    Protocol(ProtocolError),
    /// The server answered a command with an ERR packet
    Server(ServerError),
    /// API misuse: re-entered steps, concurrent I/O, bad transitions
    Programming(ProgrammingError),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors
    Io(std::io::Error),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection refused by the peer
    Refused,
    /// Socket failed or was closed during an operation; the socket is unbound
    Disconnected,
    /// Server rejected the credentials
    Authentication,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// An ERR packet returned for a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code: u16,
    /// Five-character SQL state; absent before protocol 4.1
    pub sqlstate: Option<String>,
    pub message: String,
    /// The statement that failed, when there was one
    pub sql: Option<String>,
}

/// A defect in how the caller drives the connection or chain.
///
/// These are not recoverable faults: retrying the same call sequence fails
/// the same way.
#[derive(Debug)]
pub struct ProgrammingError {
    pub kind: ProgrammingErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgrammingErrorKind {
    /// A task was started after it already ran (or while running)
    TaskReentered,
    /// A receive was started while another one is outstanding
    ConcurrentReceive,
    /// A send was started while another one is outstanding
    ConcurrentSend,
    /// The parser phase was replaced while a packet was half assembled
    MidPacketTransition,
    /// `connect` on a connection that is already connected
    AlreadyConnected,
    /// An operation that needs a bound socket ran without one
    NotConnected,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Build a protocol error from a message.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError {
            message: message.into(),
            raw_data: None,
            source: None,
        })
    }

    /// Build a programming error.
    pub fn programming(kind: ProgrammingErrorKind, message: impl Into<String>) -> Self {
        Error::Programming(ProgrammingError {
            kind,
            message: message.into(),
        })
    }

    /// Build a connection error without an underlying source.
    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// Build a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }

    /// Is this a connection error that leaves the socket unusable?
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(c) => matches!(
                c.kind,
                ConnectionErrorKind::Connect
                    | ConnectionErrorKind::Refused
                    | ConnectionErrorKind::Disconnected
            ),
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Did the server reject the credentials?
    pub fn is_authentication_error(&self) -> bool {
        matches!(
            self,
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Authentication,
                ..
            })
        )
    }

    /// Is this caller misuse rather than a runtime fault?
    pub fn is_programming_error(&self) -> bool {
        matches!(self, Error::Programming(_))
    }

    /// The programming error kind, if this is one.
    pub fn programming_kind(&self) -> Option<ProgrammingErrorKind> {
        match self {
            Error::Programming(p) => Some(p.kind),
            _ => None,
        }
    }

    /// The server error code, if the server reported one.
    pub fn server_code(&self) -> Option<u16> {
        match self {
            Error::Server(e) => Some(e.code),
            _ => None,
        }
    }

    /// The connection error kind, if this is one.
    pub fn connection_kind(&self) -> Option<ConnectionErrorKind> {
        match self {
            Error::Connection(c) => Some(c.kind),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Server(e) => write!(f, "Server error {}: {}", e.code, e.message),
            Error::Programming(e) => write!(f, "Programming error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            Error::Server(_) | Error::Programming(_) => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sqlstate {
            Some(state) => write!(f, "({}) [{}] {}", self.code, state, self.message),
            None => write!(f, "({}) {}", self.code, self.message),
        }
    }
}

impl fmt::Display for ProgrammingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}

impl From<ProgrammingError> for Error {
    fn from(err: ProgrammingError) -> Self {
        Error::Programming(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}
