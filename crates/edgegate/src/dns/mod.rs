use std::time::Duration;

use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use http::{Method, Request, Response, StatusCode, header};
use http_body_util::{BodyExt, Full, Limited};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::Config;

pub const DNS_MESSAGE: &str = "application/dns-message";

const UPSTREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const UPSTREAM_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
// A DNS message over TCP is at most 64KiB; anything bigger is not a query.
const MAX_DOH_BODY: usize = 64 * 1024;

pub type Body = Full<Bytes>;

/// DNS stub resolver over an upstream DoH endpoint. One instance is shared
/// by every DoT and DoH listener; the reqwest client pools and re-uses
/// upstream connections internally.
pub struct DohStub {
	url: String,
	client: reqwest::Client,
	inflight: Semaphore,
}

impl DohStub {
	pub fn new(cfg: &Config) -> anyhow::Result<DohStub> {
		let client = reqwest::Client::builder()
			.pool_idle_timeout(UPSTREAM_IDLE_TIMEOUT)
			.timeout(UPSTREAM_RESPONSE_TIMEOUT)
			.build()?;
		Ok(DohStub {
			url: cfg.upstream_doh.clone(),
			client,
			inflight: Semaphore::new(cfg.max_inflight_dns),
		})
	}

	/// Forward a raw wire-format query upstream. Every failure mode
	/// collapses to None; callers translate that into SERVFAIL (DoT) or 403
	/// (DoH). The transaction ID passes through both ways.
	pub async fn dodoh(&self, wire: Bytes) -> Option<Bytes> {
		let res = self
			.client
			.post(&self.url)
			.header(header::ACCEPT, DNS_MESSAGE)
			.header(header::CONTENT_TYPE, DNS_MESSAGE)
			.body(wire)
			.send()
			.await
			.ok()?;
		if !res.status().is_success() {
			warn!(status = %res.status(), "doh upstream");
			return None;
		}
		let body = res.bytes().await.ok()?;
		// Parsed only to prove the body is DNS and to log it; the bytes on
		// the wire are what the client gets.
		let msg = Message::from_bytes(&body).ok()?;
		debug!(q0 = %querystr(&msg), a0 = %ansstr(&msg), answers = msg.answers().len(), "doh");
		Some(body)
	}

	/// Serve one DNS-over-TCP-framed query (RFC 7858 framing: 2-byte length
	/// prefix). Shared by TLS-terminated DoT and its cleartext variant. The
	/// reply defaults to SERVFAIL and is written unconditionally; the
	/// connection closes after one exchange.
	pub async fn serve_dns_stream<S>(&self, mut stream: S)
	where
		S: AsyncRead + AsyncWrite + Unpin,
	{
		let Ok(len) = stream.read_u16().await else {
			return;
		};
		if len == 0 {
			return;
		}
		let mut wire = vec![0u8; len as usize];
		if stream.read_exact(&mut wire).await.is_err() {
			return;
		}
		let Ok(query) = Message::from_bytes(&wire) else {
			debug!("dot: unparseable query");
			return;
		};
		let Ok(_permit) = self.inflight.acquire().await else {
			return;
		};
		let reply = match self.dodoh(Bytes::from(wire)).await {
			Some(bytes) => bytes,
			None => {
				let Ok(servfail) = error_response(&query, ResponseCode::ServFail).to_bytes() else {
					return;
				};
				Bytes::from(servfail)
			},
		};
		let Ok(len) = u16::try_from(reply.len()) else {
			return;
		};
		let mut framed = Vec::with_capacity(2 + reply.len());
		framed.extend_from_slice(&len.to_be_bytes());
		framed.extend_from_slice(&reply);
		let _ = stream.write_all(&framed).await;
		let _ = stream.shutdown().await;
	}

	/// The DoH surface: GET with a base64url `dns` parameter, or POST with
	/// the wire query as the body.
	pub async fn serve_http<B>(&self, req: Request<B>) -> Response<Body>
	where
		B: http_body::Body,
		B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
	{
		match req.method().clone() {
			Method::GET => {
				let Some(b64) = query_param(req.uri().query(), "dns") else {
					return plain(StatusCode::BAD_REQUEST, "query missing");
				};
				use base64::Engine;
				match base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(b64) {
					Ok(wire) => self.answer(Bytes::from(wire)).await,
					Err(_) => plain(StatusCode::BAD_REQUEST, "bad dns query encoding"),
				}
			},
			Method::POST => match Limited::new(req.into_body(), MAX_DOH_BODY).collect().await {
				Ok(collected) => self.answer(collected.to_bytes()).await,
				Err(_) => plain(StatusCode::BAD_REQUEST, "unreadable body"),
			},
			_ => plain(StatusCode::METHOD_NOT_ALLOWED, "GET or POST only"),
		}
	}

	async fn answer(&self, wire: Bytes) -> Response<Body> {
		if Message::from_bytes(&wire).is_err() {
			return plain(StatusCode::BAD_REQUEST, "malformed dns query");
		}
		match self.dodoh(wire).await {
			// A nil answer from the upstream means "drop": blank forbidden.
			None => empty(StatusCode::FORBIDDEN),
			Some(ans) => {
				// TODO: pad the answer per rfc8467/rfc7830
				Response::builder()
					.status(StatusCode::OK)
					.header(header::CONTENT_TYPE, DNS_MESSAGE)
					.body(Full::new(ans))
					.expect("response with known parts must build")
			},
		}
	}
}

fn error_response(query: &Message, code: ResponseCode) -> Message {
	let mut msg = Message::new();
	msg
		.set_id(query.id())
		.set_op_code(query.op_code())
		.set_message_type(MessageType::Response)
		.set_response_code(code)
		.add_queries(query.queries().to_vec());
	msg
}

fn query_param<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
	query?.split('&').find_map(|kv| {
		let (k, v) = kv.split_once('=')?;
		(k == key && !v.is_empty()).then_some(v)
	})
}

fn querystr(m: &Message) -> String {
	m.queries()
		.first()
		.map(|q| q.to_string())
		.unwrap_or_else(|| "no-query".to_string())
}

fn ansstr(m: &Message) -> String {
	m.answers()
		.first()
		.map(|r| r.to_string())
		.unwrap_or_else(|| "no-ans".to_string())
}

fn plain(status: StatusCode, msg: &'static str) -> Response<Body> {
	Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(Full::new(Bytes::from_static(msg.as_bytes())))
		.expect("response with known parts must build")
}

fn empty(status: StatusCode) -> Response<Body> {
	Response::builder()
		.status(status)
		.body(Full::new(Bytes::new()))
		.expect("response with known parts must build")
}

#[cfg(test)]
#[path = "stub_tests.rs"]
mod tests;
