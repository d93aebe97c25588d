use std::io;
use std::net::IpAddr;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::{ProxyConn, ProxyError};
use crate::config::Config;

/// Relay the classified connection to `hostname:local-port`. Connections
/// without a usable destination, or with one the gateway refuses to reach,
/// are held for the penalty timeout before closing; health-check storms from
/// the edge otherwise turn into reconnect storms.
pub async fn forward(src: ProxyConn, cfg: &Config) {
	if disallowed(&src, cfg) {
		tokio::time::sleep(cfg.noproxy_timeout).await;
		return;
	}

	info!(
		family = src.family(),
		from = %src.peer(),
		to = %src.hostname(),
		port = src.port(),
		"relay",
	);
	let dst = match dial(&src, cfg).await {
		Ok(dst) => dst,
		Err(err) => {
			warn!(%err, to = %src.hostname(), "relay: dial");
			return;
		},
	};

	// The dial resolved the hostname; what it resolved to gets the same
	// scrutiny as the literal form.
	match dst.peer_addr() {
		Ok(peer) if !route_allowed(peer.ip()) => {
			info!(dst = %peer, "relay: drop conn to disallowed destination");
			tokio::time::sleep(cfg.noproxy_timeout).await;
			return;
		},
		Ok(_) => {},
		Err(_) => return,
	}

	if let Err(err) = splice(src, dst).await {
		debug!(%err, "relay: copy ended");
	}
}

async fn dial(src: &ProxyConn, cfg: &Config) -> Result<TcpStream, ProxyError> {
	let target = (src.hostname().as_str(), src.port());
	match tokio::time::timeout(cfg.conn_timeout, TcpStream::connect(target)).await {
		Ok(Ok(dst)) => Ok(dst),
		Ok(Err(err)) => Err(ProxyError::Dial(err)),
		Err(_) => Err(ProxyError::DialTimeout),
	}
}

/// Deliver the peeked prefix to the destination, then hand both raw sockets
/// to the runtime's bidirectional copy so kernel zero-copy can engage. Both
/// directions are joined; both sockets close on return.
pub(crate) async fn splice(src: ProxyConn, mut dst: TcpStream) -> io::Result<()> {
	let (peeked, mut src) = src.into_parts();
	if !peeked.is_empty() {
		dst.write_all(&peeked).await?;
	}
	let (tx, rx) = tokio::io::copy_bidirectional(&mut src, &mut dst).await?;
	debug!(tx, rx, "relay: done");
	Ok(())
}

fn disallowed(src: &ProxyConn, cfg: &Config) -> bool {
	let hostname = src.hostname();
	if hostname.is_empty() {
		// Conns without host/sni: often health checks from the L4 edge.
		return true;
	}
	if let Some(app) = &cfg.fly_app_name {
		if hostname.contains(&format!("{app}.fly.dev")) {
			// Relaying to ourselves would loop forever.
			return true;
		}
	}
	if !route_allowed(src.peer().ip()) {
		return true;
	}
	// A destination that is already a disallowed IP literal is never dialed.
	if let Ok(ip) = hostname.parse::<IpAddr>() {
		if !route_allowed(ip) {
			return true;
		}
	}
	false
}

/// Destinations the relay may reach: anything that is not loopback,
/// multicast, link-local, private, or unspecified.
pub(crate) fn route_allowed(ip: IpAddr) -> bool {
	if ip.is_unspecified() || ip.is_loopback() || ip.is_multicast() {
		return false;
	}
	match ip {
		IpAddr::V4(v4) => !v4.is_private() && !v4.is_link_local(),
		IpAddr::V6(v6) => {
			let seg = v6.segments()[0];
			// fc00::/7 unique-local, fe80::/10 link-local.
			(seg & 0xfe00) != 0xfc00 && (seg & 0xffc0) != 0xfe80
		},
	}
}

#[cfg(test)]
#[path = "relay_tests.rs"]
mod tests;
