use std::net::{IpAddr, SocketAddr};

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use super::ProxyError;

const V2_SIGNATURE: &[u8; 12] = b"\r\n\r\n\0\r\nQUIT\n";
const V1_SIGNATURE: &[u8; 6] = b"PROXY ";
// v1 headers are at most 107 bytes including CRLF.
const V1_MAX: usize = 107;

/// Strip a PROXY v1/v2 header from the front of an accepted connection and
/// return the advertised source address. Tolerant of absence: the signature
/// probe uses MSG_PEEK and consumes nothing when no header is present, so a
/// plain client on a PROXY-wrapped port still works. A positive signature
/// match followed by garbage is an error.
pub async fn strip(stream: &mut TcpStream) -> Result<Option<SocketAddr>, ProxyError> {
	let mut sig = [0u8; 12];
	let n = peek_signature(stream, &mut sig).await;
	if n >= V2_SIGNATURE.len() && sig == *V2_SIGNATURE {
		return strip_v2(stream).await;
	}
	if n >= V1_SIGNATURE.len() && sig[..V1_SIGNATURE.len()] == *V1_SIGNATURE {
		return strip_v1(stream).await;
	}
	Ok(None)
}

/// Peek until the buffer can be told apart from both signatures, or is full.
/// Short first segments resolve as soon as the prefix mismatches. A peek
/// cannot wait for "more than what is buffered", so the undecided case
/// re-polls briefly; PROXY senders emit the whole header in one write and
/// settle this on the first pass.
async fn peek_signature(stream: &mut TcpStream, sig: &mut [u8; 12]) -> usize {
	for _ in 0..100 {
		let n = match stream.peek(sig).await {
			Ok(n) => n,
			Err(_) => return 0,
		};
		if n == 0 {
			return 0;
		}
		let v2_prefix = sig[..n.min(V2_SIGNATURE.len())] == V2_SIGNATURE[..n.min(V2_SIGNATURE.len())];
		let v1_prefix = sig[..n.min(V1_SIGNATURE.len())] == V1_SIGNATURE[..n.min(V1_SIGNATURE.len())];
		if n == sig.len() || (!v2_prefix && !v1_prefix) {
			return n;
		}
		if v1_prefix && n >= V1_SIGNATURE.len() {
			return n;
		}
		tokio::time::sleep(std::time::Duration::from_millis(10)).await;
	}
	0
}

async fn strip_v1(stream: &mut TcpStream) -> Result<Option<SocketAddr>, ProxyError> {
	let mut header = Vec::with_capacity(V1_MAX);
	loop {
		let b = stream
			.read_u8()
			.await
			.map_err(|e| ProxyError::ProxyHeader(format!("v1 read: {e}")))?;
		header.push(b);
		if header.ends_with(b"\r\n") {
			break;
		}
		if header.len() >= V1_MAX {
			return Err(ProxyError::ProxyHeader("v1 header too long".into()));
		}
	}
	let parsed = ppp::v1::Header::try_from(header.as_slice())
		.map_err(|e| ProxyError::ProxyHeader(format!("v1 parse: {e:?}")))?;
	Ok(match parsed.addresses {
		ppp::v1::Addresses::Tcp4(a) => Some(SocketAddr::new(
			IpAddr::V4(a.source_address),
			a.source_port,
		)),
		ppp::v1::Addresses::Tcp6(a) => Some(SocketAddr::new(
			IpAddr::V6(a.source_address),
			a.source_port,
		)),
		// "PROXY UNKNOWN": header consumed, no address advertised.
		ppp::v1::Addresses::Unknown => None,
	})
}

async fn strip_v2(stream: &mut TcpStream) -> Result<Option<SocketAddr>, ProxyError> {
	let mut fixed = [0u8; 16];
	stream
		.read_exact(&mut fixed)
		.await
		.map_err(|e| ProxyError::ProxyHeader(format!("v2 read: {e}")))?;
	let len = u16::from_be_bytes([fixed[14], fixed[15]]) as usize;
	let mut header = fixed.to_vec();
	header.resize(16 + len, 0);
	stream
		.read_exact(&mut header[16..])
		.await
		.map_err(|e| ProxyError::ProxyHeader(format!("v2 read: {e}")))?;
	let parsed = ppp::v2::Header::try_from(header.as_slice())
		.map_err(|e| ProxyError::ProxyHeader(format!("v2 parse: {e:?}")))?;
	Ok(match parsed.addresses {
		ppp::v2::Addresses::IPv4(a) => Some(SocketAddr::new(
			IpAddr::V4(a.source_address),
			a.source_port,
		)),
		ppp::v2::Addresses::IPv6(a) => Some(SocketAddr::new(
			IpAddr::V6(a.source_address),
			a.source_port,
		)),
		// LOCAL commands (health checks) and unix sockets carry no usable
		// inet address; the header is still consumed.
		ppp::v2::Addresses::Unix(_) | ppp::v2::Addresses::Unspecified => None,
	})
}

#[cfg(test)]
#[path = "proxyproto_tests.rs"]
mod tests;
