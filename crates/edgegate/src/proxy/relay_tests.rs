use std::net::IpAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::*;
use crate::test_helpers::{fake_public_peer, local_pair, test_config};

fn ip(s: &str) -> IpAddr {
	s.parse().expect("ip")
}

#[test]
fn route_allowlist() {
	for blocked in [
		"10.0.0.1",
		"192.168.1.1",
		"172.16.3.4",
		"127.0.0.1",
		"0.0.0.0",
		"224.0.0.1",
		"169.254.1.1",
		"::",
		"::1",
		"fe80::1",
		"fc00::1",
		"fd12::a",
		"ff02::1",
	] {
		assert!(!route_allowed(ip(blocked)), "{blocked} must be refused");
	}
	for allowed in ["93.184.216.34", "1.1.1.1", "2606:4700::1111"] {
		assert!(route_allowed(ip(allowed)), "{allowed} must be reachable");
	}
}

async fn conn_with_request(head: &[u8]) -> ProxyConn {
	let (mut client, server) = local_pair().await;
	client.write_all(head).await.expect("write head");
	ProxyConn::new(server, fake_public_peer(), Duration::from_secs(1))
		.await
		.expect("proxy conn")
}

#[tokio::test]
async fn empty_hostname_sleeps_penalty_then_closes() {
	let mut cfg = test_config("http://127.0.0.1:9/dns-query");
	cfg.noproxy_timeout = Duration::from_millis(200);

	let (mut client, server) = local_pair().await;
	client.write_all(b"\x00no protocol here").await.expect("write");
	let conn = ProxyConn::new(server, fake_public_peer(), Duration::from_millis(100))
		.await
		.expect("proxy conn");
	assert!(conn.hostname().is_empty());

	let start = Instant::now();
	forward(conn, &cfg).await;
	assert!(start.elapsed() >= Duration::from_millis(200));

	// the gateway side is gone
	let mut buf = [0u8; 1];
	assert_eq!(client.read(&mut buf).await.expect("read eof"), 0);
}

#[tokio::test]
async fn disallowed_ip_literal_is_never_dialed() {
	// A backend listening on loopback must never see the connection even
	// though the advertised hostname points straight at it.
	let backend = TcpListener::bind("127.0.0.1:0").await.expect("bind backend");
	let backend_addr = backend.local_addr().expect("addr");

	let mut cfg = test_config("http://127.0.0.1:9/dns-query");
	cfg.noproxy_timeout = Duration::from_millis(100);

	let (mut client, server) = local_pair().await;
	let head = format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", backend_addr.ip());
	client.write_all(head.as_bytes()).await.expect("write");
	let conn = ProxyConn::new(server, fake_public_peer(), Duration::from_secs(1))
		.await
		.expect("proxy conn");

	forward(conn, &cfg).await;

	let accepted = tokio::time::timeout(Duration::from_millis(100), backend.accept()).await;
	assert!(accepted.is_err(), "no outbound dial may reach the backend");
}

#[tokio::test]
async fn self_loop_hostname_is_refused() {
	let mut cfg = test_config("http://127.0.0.1:9/dns-query");
	cfg.noproxy_timeout = Duration::from_millis(50);
	cfg.fly_app_name = Some(edge_core::strng::new("gw"));

	let conn = conn_with_request(b"GET / HTTP/1.1\r\nHost: gw.fly.dev\r\n\r\n").await;
	let start = Instant::now();
	forward(conn, &cfg).await;
	assert!(start.elapsed() >= Duration::from_millis(50));
}

#[tokio::test]
async fn splice_delivers_prefix_before_body() {
	let backend = TcpListener::bind("127.0.0.1:0").await.expect("bind backend");
	let backend_addr = backend.local_addr().expect("addr");

	let head = b"GET / HTTP/1.1\r\nHost: backend.example\r\n\r\n";
	let (mut client, server) = local_pair().await;
	client.write_all(head).await.expect("write head");
	let conn = ProxyConn::new(server, fake_public_peer(), Duration::from_secs(1))
		.await
		.expect("proxy conn");

	let dst = TcpStream::connect(backend_addr).await.expect("dial backend");
	let splice_task = tokio::spawn(async move { splice(conn, dst).await });

	let (mut backend_conn, _) = backend.accept().await.expect("accept");

	// Client keeps talking after the peeked window was snapshotted.
	client.write_all(b"BODY").await.expect("write body");
	client.shutdown().await.expect("shutdown");

	let mut upstream_seen = Vec::new();
	backend_conn
		.read_to_end(&mut upstream_seen)
		.await
		.expect("backend read");
	let mut want = head.to_vec();
	want.extend_from_slice(b"BODY");
	assert_eq!(upstream_seen, want, "prefix exactly once, then the body");

	backend_conn.write_all(b"RESPONSE").await.expect("write resp");
	backend_conn.shutdown().await.expect("backend shutdown");

	let mut reply = Vec::new();
	client.read_to_end(&mut reply).await.expect("client read");
	assert_eq!(reply, b"RESPONSE");

	splice_task
		.await
		.expect("join")
		.expect("splice completes cleanly");
}
