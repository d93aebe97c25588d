use std::convert::Infallible;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::{ProxyConn, ProxyError, proxyproto, relay};
use crate::config::Config;
use crate::dns::DohStub;
use crate::echo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindProtocol {
	Relay,
	RelayDoh,
	RelayDot,
	DohCleartext,
	DotCleartext,
	Echo,
	EchoProxyProto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bind {
	pub protocol: BindProtocol,
	pub port: u16,
}

/// Binds every listener and runs them to completion. Each port gets one
/// long-running accept task; each accepted connection gets its own task.
pub struct Gateway {
	cfg: Arc<Config>,
	resolver: Arc<DohStub>,
}

impl Gateway {
	pub fn new(cfg: Arc<Config>, resolver: Arc<DohStub>) -> Gateway {
		Gateway { cfg, resolver }
	}

	pub fn binds(cfg: &Config) -> Vec<Bind> {
		let ports = cfg.ports;
		vec![
			Bind {
				protocol: BindProtocol::Relay,
				port: ports.relay,
			},
			Bind {
				protocol: BindProtocol::RelayDoh,
				port: ports.doh,
			},
			Bind {
				protocol: BindProtocol::RelayDot,
				port: ports.dot,
			},
			Bind {
				protocol: BindProtocol::DohCleartext,
				port: ports.doh_cleartext,
			},
			Bind {
				protocol: BindProtocol::DotCleartext,
				port: ports.dot_cleartext,
			},
			Bind {
				protocol: BindProtocol::Echo,
				port: ports.echo,
			},
			Bind {
				protocol: BindProtocol::EchoProxyProto,
				port: ports.echo_proxy_proto,
			},
		]
	}

	/// Bind failures here are fatal; once up, the gateway stays alive while
	/// any listener task runs.
	pub async fn run(self) -> anyhow::Result<()> {
		let mut js: JoinSet<()> = JoinSet::new();
		for bind in Self::binds(&self.cfg) {
			let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, bind.port))
				.await
				.map_err(|err| ProxyError::Bind(bind.port, err))?;
			js.spawn(Self::run_bind(
				self.cfg.clone(),
				self.resolver.clone(),
				bind,
				listener,
			));
		}

		let udp = bind_echo_udp(self.cfg.ports.echo)
			.await
			.map_err(|err| ProxyError::Bind(self.cfg.ports.echo, err))?;
		let (mtu, workers) = (self.cfg.mtu, self.cfg.udp_workers);
		js.spawn(async move { echo::serve_udp(Arc::new(udp), mtu, workers).await });

		info!("started {} listeners", js.len());
		while let Some(res) = js.join_next().await {
			match res {
				Ok(()) => info!("listener exited"),
				Err(err) => warn!(%err, "listener task aborted"),
			}
		}
		Ok(())
	}

	pub async fn run_bind(
		cfg: Arc<Config>,
		resolver: Arc<DohStub>,
		bind: Bind,
		listener: TcpListener,
	) {
		let protocol = effective_protocol(bind.protocol, cfg.tls.is_some());
		match protocol {
			BindProtocol::Relay => {
				if bind.protocol == BindProtocol::Relay {
					info!(port = bind.port, "mode: relay");
				} else {
					info!(port = bind.port, "mode: relay only");
				}
				serve_relay(cfg, listener).await
			},
			BindProtocol::RelayDoh => {
				info!(port = bind.port, "mode: relay + DoH");
				serve_relay_dns(cfg, resolver, listener, DnsMode::Doh).await
			},
			BindProtocol::RelayDot => {
				info!(port = bind.port, "mode: relay + DoT");
				serve_relay_dns(cfg, resolver, listener, DnsMode::Dot).await
			},
			BindProtocol::DohCleartext => {
				info!(port = bind.port, "mode: DoH cleartext");
				serve_doh_cleartext(cfg, resolver, listener).await
			},
			BindProtocol::DotCleartext => {
				info!(port = bind.port, "mode: DoT cleartext");
				serve_dot_cleartext(resolver, listener).await
			},
			BindProtocol::Echo => {
				info!(port = bind.port, "mode: echo");
				echo::serve_tcp(listener).await
			},
			BindProtocol::EchoProxyProto => {
				info!(port = bind.port, "mode: echo + proxy-proto");
				echo::serve_proxy_proto(listener).await
			},
		}
	}
}

/// With no terminating certificate a relay+DNS port cannot host its DNS
/// half; it keeps relaying instead of refusing to start.
pub fn effective_protocol(protocol: BindProtocol, has_tls: bool) -> BindProtocol {
	match protocol {
		BindProtocol::RelayDoh | BindProtocol::RelayDot if !has_tls => BindProtocol::Relay,
		p => p,
	}
}

/// Does the advertised hostname designate the gateway's own DNS service?
/// Substring containment tolerates sub-domain variants of the cert names.
fn is_self(cfg: &Config, hostname: &str) -> bool {
	match &cfg.tls {
		Some(tls) => tls.names.iter().any(|name| hostname.contains(name.as_str())),
		None => false,
	}
}

/// PROXY-strip then classify. None means the connection was consumed by an
/// error path and is already logged.
async fn accept_conn(cfg: &Config, mut stream: TcpStream, peer: SocketAddr) -> Option<ProxyConn> {
	let peer = match proxyproto::strip(&mut stream).await {
		Ok(advertised) => advertised.unwrap_or(peer),
		Err(err) => {
			debug!(%err, "proxy header");
			return None;
		},
	};
	match ProxyConn::new(stream, peer, cfg.conn_timeout).await {
		Ok(conn) => Some(conn),
		Err(err) => {
			debug!(%err, "classify");
			None
		},
	}
}

async fn serve_relay(cfg: Arc<Config>, listener: TcpListener) {
	loop {
		match listener.accept().await {
			Ok((stream, peer)) => {
				let cfg = cfg.clone();
				tokio::spawn(async move {
					let Some(conn) = accept_conn(&cfg, stream, peer).await else {
						return;
					};
					if is_self(&cfg, conn.hostname()) {
						// dns hostname on a port with no dns service
						debug!(hostname = %conn.hostname(), "cannot accept conn");
						return;
					}
					relay::forward(conn, &cfg).await;
				});
			},
			Err(err) => warn!(%err, "relay accept"),
		}
	}
}

#[derive(Clone, Copy)]
enum DnsMode {
	Doh,
	Dot,
}

async fn serve_relay_dns(
	cfg: Arc<Config>,
	resolver: Arc<DohStub>,
	listener: TcpListener,
	mode: DnsMode,
) {
	// run_bind only routes here with a certificate configured
	let Some(tls) = cfg.tls.clone() else {
		return;
	};
	let acceptor = TlsAcceptor::from(tls.server_config.clone());
	loop {
		match listener.accept().await {
			Ok((stream, peer)) => {
				let (cfg, resolver, acceptor) = (cfg.clone(), resolver.clone(), acceptor.clone());
				tokio::spawn(async move {
					let Some(conn) = accept_conn(&cfg, stream, peer).await else {
						return;
					};
					if !is_self(&cfg, conn.hostname()) {
						relay::forward(conn, &cfg).await;
						return;
					}
					// The ClientHello replays out of the peeked window.
					let stream = match acceptor.accept(conn).await {
						Ok(stream) => stream,
						Err(err) => {
							debug!(%err, "tls termination");
							return;
						},
					};
					match mode {
						DnsMode::Doh => serve_doh_conn(&cfg, resolver, stream).await,
						DnsMode::Dot => resolver.serve_dns_stream(stream).await,
					}
				});
			},
			Err(err) => warn!(%err, "relay+dns accept"),
		}
	}
}

async fn serve_doh_cleartext(cfg: Arc<Config>, resolver: Arc<DohStub>, listener: TcpListener) {
	loop {
		match listener.accept().await {
			Ok((mut stream, _peer)) => {
				let (cfg, resolver) = (cfg.clone(), resolver.clone());
				tokio::spawn(async move {
					if let Err(err) = proxyproto::strip(&mut stream).await {
						debug!(%err, "proxy header");
						return;
					}
					let server = auto_server(&cfg);
					let service = service_fn(move |req| {
						let resolver = resolver.clone();
						async move {
							if req.uri().path() == "/h/w" {
								return Ok::<_, Infallible>(hello(&req));
							}
							Ok(resolver.serve_http(req).await)
						}
					});
					let serve = server.serve_connection_with_upgrades(TokioIo::new(stream), service);
					if let Err(err) = serve.await {
						debug!(%err, "doh cleartext connection");
					}
				});
			},
			Err(err) => warn!(%err, "doh cleartext accept"),
		}
	}
}

async fn serve_dot_cleartext(resolver: Arc<DohStub>, listener: TcpListener) {
	loop {
		match listener.accept().await {
			Ok((mut stream, _peer)) => {
				let resolver = resolver.clone();
				tokio::spawn(async move {
					if let Err(err) = proxyproto::strip(&mut stream).await {
						debug!(%err, "proxy header");
						return;
					}
					resolver.serve_dns_stream(stream).await;
				});
			},
			Err(err) => warn!(%err, "dot cleartext accept"),
		}
	}
}

async fn serve_doh_conn<S>(cfg: &Config, resolver: Arc<DohStub>, stream: S)
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let server = auto_server(cfg);
	let service = service_fn(move |req| {
		let resolver = resolver.clone();
		async move { Ok::<_, Infallible>(resolver.serve_http(req).await) }
	});
	let serve = server.serve_connection_with_upgrades(TokioIo::new(stream), service);
	if let Err(err) = serve.await {
		debug!(%err, "doh connection");
	}
}

/// One connection server for both HTTP/1.1 and HTTP/2; on cleartext ports
/// the h2 preface selects HTTP/2 (h2c prior knowledge).
fn auto_server(cfg: &Config) -> auto::Builder<TokioExecutor> {
	let mut b = auto::Builder::new(TokioExecutor::new());
	b.http1()
		.timer(TokioTimer::new())
		.header_read_timeout(cfg.conn_timeout);
	b.http2().timer(TokioTimer::new());
	b
}

fn hello<B>(req: &Request<B>) -> Response<crate::dns::Body> {
	Response::new(Full::new(Bytes::from(format!(
		"Hello, {}, http: true",
		req.uri().path()
	))))
}

async fn bind_echo_udp(port: u16) -> io::Result<UdpSocket> {
	// fly steers global UDP through a dedicated address; everywhere else
	// falls back to the wildcard.
	match UdpSocket::bind(("fly-global-services", port)).await {
		Ok(socket) => Ok(socket),
		Err(_) => UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await,
	}
}

#[cfg(test)]
#[path = "gateway_tests.rs"]
mod tests;
