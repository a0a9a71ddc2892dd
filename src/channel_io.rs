//! The I/O seam between the relay logic and its sockets, introduced to facilitate
//!  mocking the network away for testing.
//!
//! A channel exposes readiness-based access: the server suspends on [`RelayChannel::readable`]
//!  through the timer wheel, then drains with [`RelayChannel::try_read`] without blocking the
//!  task. Writes suspend on backpressure but always deliver the whole buffer.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::io;
use tokio::net::TcpStream;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait RelayChannel: Send + Sync {
    /// waits until the socket is (probably) readable
    async fn readable(&self) -> io::Result<()>;

    /// nonblocking read; `WouldBlock` on spurious readiness
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// sends the whole buffer, suspending on backpressure
    async fn send(&self, buf: &[u8]) -> io::Result<()>;
}

#[async_trait]
impl RelayChannel for TcpStream {
    async fn readable(&self) -> io::Result<()> {
        TcpStream::readable(self).await
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    async fn send(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            self.writable().await?;
            match self.try_write(buf) {
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
