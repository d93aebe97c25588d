use std::io;

mod conn;
pub mod gateway;
mod peek;
pub mod proxyproto;
pub mod relay;

pub use conn::ProxyConn;
pub use gateway::{Bind, BindProtocol, Gateway};

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("bind :{0} failed: {1}")]
	Bind(u16, #[source] io::Error),
	#[error("invalid local address: {0}")]
	LocalAddr(#[source] io::Error),
	#[error("malformed proxy-protocol header: {0}")]
	ProxyHeader(String),
	#[error("dial timed out")]
	DialTimeout,
	#[error("dial failed: {0}")]
	Dial(#[source] io::Error),
}
