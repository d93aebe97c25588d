use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes};
use edge_core::strng::Strng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

use super::{ProxyError, peek};

/// Outbound dial family. Always plain "tcp": IPv4-only web properties cause
/// connect timeouts when an incoming v6 connection forces a "tcp6" dial, so
/// v4/v6 selection is left to the resolver.
pub const FAMILY_TCP: &str = "tcp";

/// A classified inbound connection. The prefix consumed while extracting the
/// HTTP Host / TLS SNI is replayed on the first reads, so downstream
/// consumers (TLS acceptor, relay destination) observe the byte stream
/// intact. Once `peeked` drains the wrapper is a plain pass-through.
pub struct ProxyConn {
	hostname: Strng,
	port: u16,
	family: &'static str,
	peer: SocketAddr,
	peeked: Bytes,
	inner: TcpStream,
}

impl ProxyConn {
	/// Classify an accepted connection. `peer` is the true client address,
	/// which differs from the socket's when a PROXY header was stripped.
	pub async fn new(
		mut stream: TcpStream,
		peer: SocketAddr,
		read_timeout: Duration,
	) -> Result<ProxyConn, ProxyError> {
		let local = stream.local_addr().map_err(ProxyError::LocalAddr)?;
		let (peeked, host, sni) = peek::classify(&mut stream, read_timeout).await;
		let hostname = match (host, sni) {
			(Some(host), _) => host,
			(None, Some(sni)) => sni,
			(None, None) => {
				debug!(local = %local, peer = %peer, "host/sni missing");
				Strng::default()
			},
		};
		Ok(ProxyConn {
			hostname,
			port: local.port(),
			family: FAMILY_TCP,
			peer,
			peeked,
			inner: stream,
		})
	}

	/// The upstream name to relay to: HTTP Host if present, else TLS SNI,
	/// else empty.
	pub fn hostname(&self) -> &Strng {
		&self.hostname
	}

	/// The local listening port, reused for the outbound dial.
	pub fn port(&self) -> u16 {
		self.port
	}

	pub fn family(&self) -> &'static str {
		self.family
	}

	/// The true client address (post PROXY-protocol strip).
	pub fn peer(&self) -> SocketAddr {
		self.peer
	}

	/// Unwrap into the replay prefix and the raw socket. The prefix must be
	/// delivered to whoever consumes the socket next, exactly once, before
	/// any byte read from the socket.
	pub fn into_parts(self) -> (Bytes, TcpStream) {
		(self.peeked, self.inner)
	}

	#[cfg(test)]
	pub(crate) fn peeked_len(&self) -> usize {
		self.peeked.len()
	}
}

impl AsyncRead for ProxyConn {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		if !this.peeked.is_empty() {
			let n = this.peeked.len().min(buf.remaining());
			buf.put_slice(&this.peeked[..n]);
			this.peeked.advance(n);
			return Poll::Ready(Ok(()));
		}
		Pin::new(&mut this.inner).poll_read(cx, buf)
	}
}

impl AsyncWrite for ProxyConn {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().inner).poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
	}
}

#[cfg(test)]
#[path = "conn_tests.rs"]
mod tests;
