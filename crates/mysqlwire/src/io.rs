//! Buffered socket I/O.
//!
//! [`SocketIo`] owns one duplex stream plus a fixed receive window and a send
//! window. It knows nothing about packets: a receive reads whatever the
//! stream has into the window, a send writes whatever was enqueued. Each
//! direction allows one outstanding operation; a socket failure unbinds the
//! stream for good.

use std::future::{Future, poll_fn};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::pin::Pin;
use std::task::Poll;
use std::time::Duration;

use asupersync::io::{AsyncRead, AsyncWrite, ReadBuf};
use asupersync::net::TcpStream;

use mysqlwire_core::Error;
use mysqlwire_core::error::{ConnectionError, ConnectionErrorKind, ProgrammingErrorKind};

/// A stream the connection can dial on its own.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Sized {
    /// Open a stream to `addr` (`host:port`) within `timeout`.
    fn dial(addr: &str, timeout: Duration) -> impl Future<Output = io::Result<Self>>;
}

impl Transport for TcpStream {
    async fn dial(addr: &str, timeout: Duration) -> io::Result<Self> {
        let socket_addr = resolve(addr)?;
        let stream = TcpStream::connect_timeout(socket_addr, timeout).await?;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }
}

fn resolve(addr: &str) -> io::Result<SocketAddr> {
    if let Ok(parsed) = addr.parse() {
        return Ok(parsed);
    }
    addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no socket addresses found for {addr}"),
        )
    })
}

/// How a receive completed.
#[derive(Debug)]
pub enum RecvEvent {
    /// `n` bytes are available through [`SocketIo::received`]
    HasData(usize),
    /// The peer closed its side
    NoMoreData,
    /// The read failed; the stream has been unbound
    SocketError(io::Error),
}

/// How a send completed.
#[derive(Debug)]
pub enum SendEvent {
    /// Every enqueued byte was written and flushed
    Complete,
    /// The write failed; the stream has been unbound
    SocketError(io::Error),
}

/// One stream with a receive window and a send window.
#[derive(Debug)]
pub struct SocketIo<S> {
    stream: Option<S>,
    /// Set once a bound stream was lost to an error or shutdown
    lost: bool,
    recv_window: Vec<u8>,
    received: usize,
    send_pending: Vec<u8>,
    send_window: usize,
    recv_armed: bool,
    send_armed: bool,
}

impl<S> SocketIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create an unbound socket with the given window sizes.
    pub fn new(recv_buffer_size: usize, send_buffer_size: usize) -> Self {
        Self {
            stream: None,
            lost: false,
            recv_window: vec![0; recv_buffer_size.max(1)],
            received: 0,
            send_pending: Vec::with_capacity(send_buffer_size),
            send_window: send_buffer_size.max(1),
            recv_armed: false,
            send_armed: false,
        }
    }

    /// Attach a connected stream.
    pub fn bind(&mut self, stream: S) {
        self.stream = Some(stream);
        self.lost = false;
        self.received = 0;
        self.send_pending.clear();
        self.recv_armed = false;
        self.send_armed = false;
    }

    /// Is a stream attached?
    pub fn is_bound(&self) -> bool {
        self.stream.is_some()
    }

    /// Detach and return the stream.
    pub fn unbind(&mut self) -> Option<S> {
        self.send_pending.clear();
        self.stream.take()
    }

    /// Size of the receive window.
    pub fn recv_window_size(&self) -> usize {
        self.recv_window.len()
    }

    /// Bytes delivered by the last [`RecvEvent::HasData`].
    pub fn received(&self) -> &[u8] {
        &self.recv_window[..self.received]
    }

    /// Bytes enqueued and not yet sent.
    pub fn pending_send(&self) -> usize {
        self.send_pending.len()
    }

    fn not_bound(&self) -> Error {
        if self.lost {
            Error::connection(
                ConnectionErrorKind::Disconnected,
                "socket was closed after an earlier failure",
            )
        } else {
            Error::programming(ProgrammingErrorKind::NotConnected, "socket is not connected")
        }
    }

    fn lose_stream(&mut self) {
        self.stream = None;
        self.lost = true;
        self.send_pending.clear();
    }

    /// Read once into the receive window.
    pub async fn start_receive(&mut self) -> Result<RecvEvent, Error> {
        if self.recv_armed {
            return Err(Error::programming(
                ProgrammingErrorKind::ConcurrentReceive,
                "a receive is already outstanding",
            ));
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(self.not_bound());
        };

        self.recv_armed = true;
        self.received = 0;
        let mut read_buf = ReadBuf::new(&mut self.recv_window);
        let result = poll_fn(|cx| Pin::new(&mut *stream).poll_read(cx, &mut read_buf)).await;
        let n = read_buf.filled().len();
        self.recv_armed = false;

        match result {
            Ok(()) if n == 0 => Ok(RecvEvent::NoMoreData),
            Ok(()) => {
                self.received = n;
                tracing::trace!(bytes = n, "Received data");
                Ok(RecvEvent::HasData(n))
            }
            Err(e) => {
                tracing::debug!(error = %e, "Receive failed, unbinding socket");
                self.lose_stream();
                Ok(RecvEvent::SocketError(e))
            }
        }
    }

    /// Copy `bytes` into the send window.
    ///
    /// Fails if earlier data has not been sent yet.
    pub fn enqueue_send(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if self.send_armed || !self.send_pending.is_empty() {
            return Err(Error::programming(
                ProgrammingErrorKind::ConcurrentSend,
                "earlier data is still waiting to be sent",
            ));
        }
        self.send_pending.extend_from_slice(bytes);
        Ok(())
    }

    /// Write the enqueued bytes, at most one window at a time, then flush.
    pub async fn start_send(&mut self) -> Result<SendEvent, Error> {
        if self.send_armed {
            return Err(Error::programming(
                ProgrammingErrorKind::ConcurrentSend,
                "a send is already outstanding",
            ));
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(self.not_bound());
        };

        self.send_armed = true;
        let result = write_windowed(stream, &self.send_pending, self.send_window).await;
        self.send_armed = false;

        match result {
            Ok(()) => {
                tracing::trace!(bytes = self.send_pending.len(), "Sent data");
                self.send_pending.clear();
                Ok(SendEvent::Complete)
            }
            Err(e) => {
                tracing::debug!(error = %e, "Send failed, unbinding socket");
                self.lose_stream();
                Ok(SendEvent::SocketError(e))
            }
        }
    }

    /// Discard bytes that are already readable, up to `limit`, without
    /// waiting for more. Returns the number of bytes discarded.
    pub async fn drain_available(&mut self, limit: usize) -> Result<usize, Error> {
        if self.recv_armed {
            return Err(Error::programming(
                ProgrammingErrorKind::ConcurrentReceive,
                "a receive is already outstanding",
            ));
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(self.not_bound());
        };

        let mut drained = 0;
        let mut failure = None;
        while drained < limit {
            let want = (limit - drained).min(self.recv_window.len());
            let mut read_buf = ReadBuf::new(&mut self.recv_window[..want]);
            let polled = poll_fn(|cx| match Pin::new(&mut *stream).poll_read(cx, &mut read_buf) {
                Poll::Pending => Poll::Ready(None),
                Poll::Ready(r) => Poll::Ready(Some(r)),
            })
            .await;

            match polled {
                None => break,
                Some(Ok(())) => {
                    let n = read_buf.filled().len();
                    if n == 0 {
                        break;
                    }
                    drained += n;
                }
                Some(Err(e)) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        self.received = 0;

        if let Some(e) = failure {
            self.lose_stream();
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Disconnected,
                message: format!("Failed while discarding input: {}", e),
                source: Some(Box::new(e)),
            }));
        }
        if drained >= limit {
            tracing::warn!(limit, "Drain limit reached, input may remain");
        }
        Ok(drained)
    }

    /// Best-effort shutdown, then unbind.
    pub async fn shutdown(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };
        if let Err(e) = poll_fn(|cx| Pin::new(&mut stream).poll_shutdown(cx)).await {
            tracing::debug!(error = %e, "Socket shutdown failed");
        }
        self.lost = true;
        self.send_pending.clear();
    }
}

async fn write_windowed<S>(stream: &mut S, data: &[u8], window: usize) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    for chunk in data.chunks(window) {
        let mut written = 0;
        while written < chunk.len() {
            let n = poll_fn(|cx| Pin::new(&mut *stream).poll_write(cx, &chunk[written..])).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "connection closed while writing",
                ));
            }
            written += n;
        }
    }
    poll_fn(|cx| Pin::new(&mut *stream).poll_flush(cx)).await
}
