use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::proxy::proxyproto;

/// Reachability probe over UDP: a pool of workers shares one packet socket
/// and each reflects the payload plus the sender's address back. With more
/// than one worker there is no per-sender ordering, which is fine for a
/// probe.
pub async fn serve_udp(socket: Arc<UdpSocket>, mtu: usize, workers: usize) {
	let mut js = JoinSet::new();
	for _ in 0..workers {
		let socket = socket.clone();
		js.spawn(process_udp(socket, mtu));
	}
	while js.join_next().await.is_some() {}
}

async fn process_udp(socket: Arc<UdpSocket>, mtu: usize) {
	let mut packet = vec![0u8; mtu];
	loop {
		match socket.recv_from(&mut packet).await {
			Ok((n, raddr)) => {
				debug!(n, from = %raddr, msg = %String::from_utf8_lossy(&packet[..n]), "umsg");
				let _ = socket.send_to(&packet[..n], raddr).await;
				let _ = socket.send_to(raddr.to_string().as_bytes(), raddr).await;
			},
			Err(err) => {
				warn!(%err, "udp echo recv");
				if matches!(
					err.kind(),
					io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe
				) {
					return;
				}
			},
		}
	}
}

pub async fn serve_tcp(listener: TcpListener) {
	loop {
		match listener.accept().await {
			Ok((stream, peer)) => {
				tokio::spawn(process_tcp(stream, peer));
			},
			Err(err) => warn!(%err, "tcp echo accept"),
		}
	}
}

/// Same probe behind the PROXY-protocol edge: the echoed address is the one
/// the header advertises.
pub async fn serve_proxy_proto(listener: TcpListener) {
	loop {
		match listener.accept().await {
			Ok((mut stream, peer)) => {
				tokio::spawn(async move {
					match proxyproto::strip(&mut stream).await {
						Ok(advertised) => process_tcp(stream, advertised.unwrap_or(peer)).await,
						Err(err) => debug!(%err, "pp echo header"),
					}
				});
			},
			Err(err) => warn!(%err, "pp echo accept"),
		}
	}
}

async fn process_tcp(stream: TcpStream, peer: SocketAddr) {
	let (read, mut write) = stream.into_split();
	let mut line = String::new();
	let _ = BufReader::new(read).read_line(&mut line).await;
	debug!(len = line.len(), from = %peer, "tmsg");
	let _ = write.write_all(line.as_bytes()).await;
	let _ = write.write_all(peer.to_string().as_bytes()).await;
}

#[cfg(test)]
#[path = "echo_tests.rs"]
mod tests;
