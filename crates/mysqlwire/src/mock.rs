//! In-memory stream for unit tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use asupersync::io::{AsyncRead, AsyncWrite, ReadBuf};
use asupersync::runtime::RuntimeBuilder;

use crate::io::Transport;

/// What the client did to a [`MockStream`].
#[derive(Debug, Default)]
pub(crate) struct MockLog {
    pub written: Vec<u8>,
    pub write_calls: Vec<usize>,
    pub flushes: usize,
    pub shut_down: bool,
}

/// Scripted stream: each read hands out (part of) the next incoming chunk.
#[derive(Debug)]
pub(crate) struct MockStream {
    incoming: VecDeque<Vec<u8>>,
    pending_when_empty: bool,
    read_error: Option<io::ErrorKind>,
    write_error: Option<io::ErrorKind>,
    log: Rc<RefCell<MockLog>>,
}

impl MockStream {
    pub(crate) fn new() -> Self {
        Self {
            incoming: VecDeque::new(),
            pending_when_empty: false,
            read_error: None,
            write_error: None,
            log: Rc::new(RefCell::new(MockLog::default())),
        }
    }

    pub(crate) fn with_incoming(mut self, bytes: &[u8]) -> Self {
        self.incoming.push_back(bytes.to_vec());
        self
    }

    /// Reads on an exhausted script stay pending instead of reporting EOF.
    pub(crate) fn pending_when_empty(mut self) -> Self {
        self.pending_when_empty = true;
        self
    }

    pub(crate) fn fail_reads(mut self, kind: io::ErrorKind) -> Self {
        self.read_error = Some(kind);
        self
    }

    pub(crate) fn fail_writes(mut self, kind: io::ErrorKind) -> Self {
        self.write_error = Some(kind);
        self
    }

    pub(crate) fn handle(&self) -> Rc<RefCell<MockLog>> {
        Rc::clone(&self.log)
    }
}

impl AsyncRead for MockStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(kind) = self.read_error {
            return Poll::Ready(Err(io::Error::new(kind, "scripted read failure")));
        }
        let Some(chunk) = self.incoming.front_mut() else {
            if self.pending_when_empty {
                return Poll::Pending;
            }
            return Poll::Ready(Ok(()));
        };
        let n = chunk.len().min(buf.remaining());
        buf.put_slice(&chunk[..n]);
        chunk.drain(..n);
        if chunk.is_empty() {
            self.incoming.pop_front();
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Some(kind) = self.write_error {
            return Poll::Ready(Err(io::Error::new(kind, "scripted write failure")));
        }
        let mut log = self.log.borrow_mut();
        log.written.extend_from_slice(data);
        log.write_calls.push(data.len());
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.log.borrow_mut().flushes += 1;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.log.borrow_mut().shut_down = true;
        Poll::Ready(Ok(()))
    }
}

impl Transport for MockStream {
    async fn dial(addr: &str, _timeout: Duration) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("nothing listens on {addr}"),
        ))
    }
}

pub(crate) fn block_on<F: Future>(future: F) -> F::Output {
    RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime")
        .block_on(future)
}
