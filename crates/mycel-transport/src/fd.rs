//! Readiness-driven stream over a raw non-blocking socket.
//!
//! Used for address families tokio has no native type for.

use socket2::{SockAddr, Socket};
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, Interest, ReadBuf};

/// Connected non-blocking socket
pub(crate) struct FdStream {
    fd: AsyncFd<Socket>,
}

impl FdStream {
    /// Connect `socket` to `addr` without blocking the runtime
    pub(crate) async fn connect(socket: Socket, addr: &SockAddr) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        match socket.connect(addr) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(e),
        }
        let fd = AsyncFd::with_interest(socket, Interest::READABLE | Interest::WRITABLE)?;
        let mut guard = fd.writable().await?;
        guard.clear_ready();
        drop(guard);
        if let Some(e) = fd.get_ref().take_error()? {
            return Err(e);
        }
        Ok(Self { fd })
    }

    pub(crate) fn from_accepted(socket: Socket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            fd: AsyncFd::with_interest(socket, Interest::READABLE | Interest::WRITABLE)?,
        })
    }

    pub(crate) fn socket(&self) -> &Socket {
        self.fd.get_ref()
    }
}

impl AsyncRead for FdStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| inner.get_ref().read(unfilled)) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for FdStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.fd.poll_write_ready(cx))?;
            match guard.try_io(|inner| inner.get_ref().write(buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.fd.get_ref().shutdown(std::net::Shutdown::Write))
    }
}

/// Listening non-blocking socket
pub(crate) struct FdListener {
    fd: AsyncFd<Socket>,
}

impl FdListener {
    pub(crate) fn new(socket: Socket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            fd: AsyncFd::with_interest(socket, Interest::READABLE)?,
        })
    }

    pub(crate) async fn accept(&self) -> io::Result<(Socket, SockAddr)> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| inner.get_ref().accept()) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    pub(crate) fn socket(&self) -> &Socket {
        self.fd.get_ref()
    }
}
