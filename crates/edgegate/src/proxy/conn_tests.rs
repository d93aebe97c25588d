use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::*;
use crate::test_helpers::{client_hello, fake_public_peer, local_pair};

#[tokio::test]
async fn peek_fidelity_http() {
	let (mut client, server) = local_pair().await;
	let head = b"GET / HTTP/1.1\r\nHost: backend.example\r\n\r\n";
	client.write_all(head).await.expect("write head");

	let conn = ProxyConn::new(server, fake_public_peer(), Duration::from_secs(1))
		.await
		.expect("proxy conn");
	assert_eq!(conn.hostname(), "backend.example");
	assert_eq!(conn.peeked_len(), head.len());

	// Everything sent after classification flows through untouched.
	client.write_all(b"BODY").await.expect("write body");
	client.shutdown().await.expect("shutdown");

	let mut seen = Vec::new();
	let mut conn = conn;
	conn.read_to_end(&mut seen).await.expect("read");
	let mut want = head.to_vec();
	want.extend_from_slice(b"BODY");
	assert_eq!(seen, want);
}

#[tokio::test]
async fn peek_fidelity_tls() {
	let (mut client, server) = local_pair().await;
	let hello = client_hello("dns.gw.example");
	client.write_all(&hello).await.expect("write hello");

	let conn = ProxyConn::new(server, fake_public_peer(), Duration::from_secs(1))
		.await
		.expect("proxy conn");
	assert_eq!(conn.hostname(), "dns.gw.example");
	// No TLS handshake was performed: the ClientHello is intact.
	client.shutdown().await.expect("shutdown");
	let mut seen = Vec::new();
	let mut conn = conn;
	conn.read_to_end(&mut seen).await.expect("read");
	assert_eq!(seen, hello);
}

#[tokio::test]
async fn hostless_conn_has_empty_hostname() {
	let (mut client, server) = local_pair().await;
	client.write_all(b"\x00\x01garbage").await.expect("write");
	client.shutdown().await.expect("shutdown");

	let conn = ProxyConn::new(server, fake_public_peer(), Duration::from_secs(1))
		.await
		.expect("proxy conn");
	assert!(conn.hostname().is_empty());
}

#[tokio::test]
async fn port_and_family_reflect_listener() {
	let (mut client, server) = local_pair().await;
	let local_port = server.local_addr().expect("local").port();
	client
		.write_all(b"GET / HTTP/1.1\r\nHost: x.example\r\n\r\n")
		.await
		.expect("write");
	let conn = ProxyConn::new(server, fake_public_peer(), Duration::from_secs(1))
		.await
		.expect("proxy conn");
	assert_eq!(conn.port(), local_port);
	assert_eq!(conn.family(), FAMILY_TCP);
	assert_eq!(conn.peer(), fake_public_peer());
}

#[tokio::test]
async fn writes_pass_through() {
	let (mut client, server) = local_pair().await;
	client
		.write_all(b"GET / HTTP/1.1\r\nHost: x.example\r\n\r\n")
		.await
		.expect("write");
	let mut conn = ProxyConn::new(server, fake_public_peer(), Duration::from_secs(1))
		.await
		.expect("proxy conn");
	conn.write_all(b"pong").await.expect("write back");
	conn.shutdown().await.expect("shutdown");

	let mut seen = [0u8; 4];
	client.read_exact(&mut seen).await.expect("read");
	assert_eq!(&seen, b"pong");
}
