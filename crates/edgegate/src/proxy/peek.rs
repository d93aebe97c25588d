use std::io::Cursor;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use edge_core::strng::{self, Strng};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Classification never reads past this; a ClientHello with a hostname fits
/// in a single TLS record, which is capped at 16KiB.
const MAX_PEEK_WINDOW: usize = 16 * 1024;

const HTTP_METHODS: [&[u8]; 9] = [
	b"GET ",
	b"POST ",
	b"HEAD ",
	b"PUT ",
	b"DELETE ",
	b"OPTIONS ",
	b"PATCH ",
	b"TRACE ",
	b"CONNECT ",
];

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Attempt<T> {
	/// The prefix was fully recognized.
	Match(T),
	/// The prefix is consistent with this protocol but incomplete.
	Partial,
	/// The prefix can never be this protocol.
	No,
}

/// Read the head of the stream into a buffered window and run both
/// classification attempts over it. The window is returned so the consumer
/// can replay it; the HTTP Host wins over the TLS SNI when both are present.
pub(crate) async fn classify<S>(
	stream: &mut S,
	read_timeout: Duration,
) -> (Bytes, Option<Strng>, Option<Strng>)
where
	S: AsyncRead + Unpin,
{
	let mut buf = BytesMut::with_capacity(2048);
	loop {
		match tokio::time::timeout(read_timeout, stream.read_buf(&mut buf)).await {
			Ok(Ok(n)) if n > 0 => {},
			// EOF, read error, or a client that never finishes its hello:
			// classify whatever we have.
			_ => break,
		}
		match http_host_header(&buf) {
			Attempt::Match(host) => return (buf.freeze(), Some(host), None),
			Attempt::Partial => continue,
			Attempt::No => {},
		}
		match client_hello_server_name(&buf) {
			Attempt::Match(sni) => return (buf.freeze(), None, sni),
			Attempt::Partial => {},
			Attempt::No => break,
		}
		if buf.len() >= MAX_PEEK_WINDOW {
			break;
		}
	}
	(buf.freeze(), None, None)
}

/// Extract the Host header from an HTTP/1.x request head, lower-cased and
/// with any port stripped. Only a minimal request-line + headers parse; the
/// real request is replayed to whoever consumes the connection.
pub(crate) fn http_host_header(buf: &[u8]) -> Attempt<Strng> {
	if buf.is_empty() {
		return Attempt::Partial;
	}
	let method_prefix = HTTP_METHODS.iter().any(|m| {
		let n = m.len().min(buf.len());
		buf[..n] == m[..n]
	});
	if !method_prefix {
		return Attempt::No;
	}
	let Some(end) = find(buf, b"\r\n\r\n") else {
		return if buf.len() >= MAX_PEEK_WINDOW {
			Attempt::No
		} else {
			Attempt::Partial
		};
	};
	let head = &buf[..end];
	let mut lines = head.split(|&b| b == b'\n').map(|l| l.strip_suffix(b"\r").unwrap_or(l));
	match lines.next() {
		Some(request_line) if find(request_line, b" HTTP/1.").is_some() => {},
		_ => return Attempt::No,
	}
	for line in lines {
		let Some(colon) = line.iter().position(|&b| b == b':') else {
			continue;
		};
		if !line[..colon].eq_ignore_ascii_case(b"host") {
			continue;
		}
		let Ok(value) = std::str::from_utf8(&line[colon + 1..]) else {
			return Attempt::No;
		};
		let host = strip_port(value.trim());
		if host.is_empty() {
			return Attempt::No;
		}
		return Attempt::Match(strng::new(host.to_ascii_lowercase()));
	}
	Attempt::No
}

/// Extract the server_name from a TLS ClientHello by driving a server-side
/// rustls acceptor over the buffered bytes. The acceptor only ever reads, so
/// the handshake is abandoned untouched once the hello has been seen.
pub(crate) fn client_hello_server_name(buf: &[u8]) -> Attempt<Option<Strng>> {
	if buf.is_empty() {
		return Attempt::Partial;
	}
	// 0x16: TLS handshake record.
	if buf[0] != 0x16 {
		return Attempt::No;
	}
	let mut acceptor = rustls::server::Acceptor::default();
	let mut cursor = Cursor::new(buf);
	loop {
		match acceptor.read_tls(&mut cursor) {
			Ok(0) => return Attempt::Partial,
			Ok(_) => {},
			Err(_) => return Attempt::No,
		}
		match acceptor.accept() {
			Ok(Some(accepted)) => {
				return Attempt::Match(accepted.client_hello().server_name().map(strng::new));
			},
			Ok(None) => {},
			Err(_) => return Attempt::No,
		}
	}
}

/// Drop a trailing :port, tolerating bracketed IPv6 literals and bare IPv6
/// addresses (which contain colons but no port).
fn strip_port(host: &str) -> &str {
	if let Some(rest) = host.strip_prefix('[') {
		return match rest.find(']') {
			Some(end) => &rest[..end],
			None => host,
		};
	}
	match host.rfind(':') {
		Some(i)
			if !host[i + 1..].is_empty()
				&& host[i + 1..].bytes().all(|b| b.is_ascii_digit())
				&& !host[..i].contains(':') =>
		{
			&host[..i]
		},
		_ => host,
	}
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
	haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
#[path = "peek_tests.rs"]
mod tests;
