use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use http::{Response, StatusCode, header};
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};

use crate::config::Config;

/// A routable-looking client address for policy checks; tests never dial it.
pub fn fake_public_peer() -> SocketAddr {
	"203.0.113.9:4242".parse().expect("addr")
}

pub async fn local_pair() -> (TcpStream, TcpStream) {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let addr = listener.local_addr().expect("addr");
	let client = TcpStream::connect(addr).await.expect("connect");
	let (server, _) = listener.accept().await.expect("accept");
	(client, server)
}

pub fn test_config(upstream: &str) -> Config {
	let upstream = upstream.to_string();
	Config::from_lookup(|key| match key {
		"UPSTREAM_DOH" => Some(upstream.clone()),
		"CONN_TIMEOUT_SEC" => Some("2".to_string()),
		_ => None,
	})
}

/// A real ClientHello, produced by rustls itself.
pub fn client_hello(sni: &str) -> Vec<u8> {
	crate::tls::install_crypto_provider();
	let config = rustls::ClientConfig::builder()
		.with_root_certificates(rustls::RootCertStore::empty())
		.with_no_client_auth();
	let server_name = rustls_pki_types::ServerName::try_from(sni.to_string()).expect("server name");
	let mut conn =
		rustls::ClientConnection::new(Arc::new(config), server_name).expect("client connection");
	let mut out = Vec::new();
	while conn.wants_write() {
		conn.write_tls(&mut out).expect("write hello");
	}
	out
}

pub fn build_query(name: &str) -> Vec<u8> {
	let mut msg = Message::new();
	msg
		.set_id(0x2b2b)
		.set_message_type(MessageType::Query)
		.set_op_code(OpCode::Query)
		.set_recursion_desired(true)
		.add_query(Query::query(
			Name::from_ascii(name).expect("name"),
			RecordType::A,
		));
	msg.to_bytes().expect("pack query")
}

/// What the mock upstream answers: NOERROR with one A record, echoing the
/// query's ID and question.
pub fn canned_answer(query_wire: &[u8]) -> Vec<u8> {
	let query = Message::from_bytes(query_wire).expect("parse query");
	let mut msg = Message::new();
	msg
		.set_id(query.id())
		.set_message_type(MessageType::Response)
		.set_op_code(query.op_code())
		.set_response_code(ResponseCode::NoError)
		.add_queries(query.queries().to_vec());
	if let Some(q) = query.queries().first() {
		msg.add_answer(Record::from_rdata(
			q.name().clone(),
			60,
			RData::A(Ipv4Addr::new(93, 184, 216, 34).into()),
		));
	}
	msg.to_bytes().expect("pack answer")
}

/// A loopback DoH upstream. 200 answers with `canned_answer`; anything else
/// answers with an empty body and that status.
pub async fn spawn_doh_upstream(status: StatusCode) -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
	let addr = listener.local_addr().expect("addr");
	tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else {
				break;
			};
			tokio::spawn(async move {
				let service = service_fn(move |req: http::Request<hyper::body::Incoming>| {
					async move {
						let body = req.into_body().collect().await.expect("body").to_bytes();
						let resp = if status == StatusCode::OK {
							Response::builder()
								.status(StatusCode::OK)
								.header(header::CONTENT_TYPE, "application/dns-message")
								.body(Full::new(Bytes::from(canned_answer(&body))))
								.expect("response")
						} else {
							Response::builder()
								.status(status)
								.body(Full::new(Bytes::new()))
								.expect("response")
						};
						Ok::<_, std::convert::Infallible>(resp)
					}
				});
				let _ = auto::Builder::new(TokioExecutor::new())
					.serve_connection(TokioIo::new(stream), service)
					.await;
			});
		}
	});
	addr
}

pub fn upstream_url(addr: SocketAddr) -> String {
	format!("http://{addr}/dns-query")
}

/// Terminating settings for a throwaway self-signed cert covering `names`.
pub fn test_tls_settings(names: &[&str]) -> crate::tls::TlsSettings {
	use base64::Engine;
	use base64::engine::general_purpose::STANDARD_NO_PAD;

	let kp = rcgen::KeyPair::generate().expect("generate key");
	let params =
		rcgen::CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
			.expect("cert params");
	let cert = params.self_signed(&kp).expect("self sign");
	let bundle = format!(
		"CRT={}\nKEY={}",
		STANDARD_NO_PAD.encode(cert.pem()),
		STANDARD_NO_PAD.encode(kp.serialize_pem()),
	);
	crate::tls::load(&|key| match key {
		"TLS_CERTKEY" => Some(bundle.clone()),
		_ => None,
	})
	.expect("tls settings")
}

/// Certificate checks disabled: the gateway under test presents a
/// throwaway self-signed cert.
#[derive(Debug)]
pub struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
	fn verify_server_cert(
		&self,
		_end_entity: &rustls_pki_types::CertificateDer<'_>,
		_intermediates: &[rustls_pki_types::CertificateDer<'_>],
		_server_name: &rustls_pki_types::ServerName<'_>,
		_ocsp_response: &[u8],
		_now: rustls_pki_types::UnixTime,
	) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
		Ok(rustls::client::danger::ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &rustls_pki_types::CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &rustls_pki_types::CertificateDer<'_>,
		_dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
		rustls::crypto::aws_lc_rs::default_provider()
			.signature_verification_algorithms
			.supported_schemes()
	}
}

pub fn insecure_tls_client() -> rustls::ClientConfig {
	crate::tls::install_crypto_provider();
	rustls::ClientConfig::builder()
		.dangerous()
		.with_custom_certificate_verifier(Arc::new(NoVerify))
		.with_no_client_auth()
}
