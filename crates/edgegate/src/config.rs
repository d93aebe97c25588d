use std::time::Duration;

use edge_core::strng::{self, Strng};

use crate::tls::{self, TlsSettings};

pub const DEFAULT_UPSTREAM_DOH: &str = "https://dns.google/dns-query";
/// MTU on fly's network is 1420.
pub const ECHO_MTU: usize = 1420;
pub const UDP_ECHO_WORKERS: usize = 4;

/// Process-wide snapshot, built once during bring-up and passed around
/// explicitly. Nothing mutates it afterwards.
#[derive(Debug)]
pub struct Config {
	pub conn_timeout: Duration,
	pub noproxy_timeout: Duration,
	pub max_inflight_dns: usize,
	pub upstream_doh: String,
	pub fly_app_name: Option<Strng>,
	pub mtu: usize,
	pub udp_workers: usize,
	pub ports: Ports,
	pub tls: Option<TlsSettings>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ports {
	pub relay: u16,
	pub doh: u16,
	pub dot: u16,
	pub doh_cleartext: u16,
	pub dot_cleartext: u16,
	pub echo: u16,
	pub echo_proxy_proto: u16,
}

impl Ports {
	pub fn rootful() -> Ports {
		Ports {
			relay: 80,
			doh: 443,
			dot: 853,
			doh_cleartext: 1443,
			dot_cleartext: 1853,
			echo: 5000,
			echo_proxy_proto: 5001,
		}
	}

	/// High-port substitutes for the privileged listeners.
	pub fn rootless() -> Ports {
		Ports {
			relay: 8080,
			doh: 8443,
			dot: 8853,
			..Ports::rootful()
		}
	}

	pub fn for_current_user() -> Ports {
		if is_root() {
			Ports::rootful()
		} else {
			Ports::rootless()
		}
	}
}

impl Config {
	pub fn from_env() -> Config {
		Self::from_lookup(|key| std::env::var(key).ok())
	}

	/// Build the snapshot through a lookup function so tests can feed an
	/// environment without mutating the process one.
	pub fn from_lookup<F>(lookup: F) -> Config
	where
		F: Fn(&str) -> Option<String>,
	{
		Config {
			conn_timeout: Duration::from_secs(int_env(&lookup, "CONN_TIMEOUT_SEC", 5)),
			noproxy_timeout: Duration::from_secs(int_env(&lookup, "NOPROXY_TIMEOUT_SEC", 20)),
			max_inflight_dns: int_env(&lookup, "MAX_INFLIGHT_DNS_QUERIES", 512) as usize,
			upstream_doh: str_env(&lookup, "UPSTREAM_DOH", DEFAULT_UPSTREAM_DOH),
			fly_app_name: lookup("FLY_APP_NAME")
				.filter(|v| !v.is_empty())
				.map(strng::new),
			mtu: ECHO_MTU,
			udp_workers: UDP_ECHO_WORKERS,
			ports: Ports::for_current_user(),
			tls: tls::load(&lookup),
		}
	}
}

fn int_env<F>(lookup: &F, key: &str, default: u64) -> u64
where
	F: Fn(&str) -> Option<String>,
{
	lookup(key)
		.and_then(|v| v.parse().ok())
		.unwrap_or(default)
}

fn str_env<F>(lookup: &F, key: &str, default: &str) -> String
where
	F: Fn(&str) -> Option<String>,
{
	lookup(key)
		.filter(|v| !v.is_empty())
		.unwrap_or_else(|| default.to_string())
}

fn is_root() -> bool {
	// SAFETY: geteuid has no failure modes and touches no memory.
	unsafe { libc::geteuid() == 0 }
}

#[cfg(test)]
mod tests {
	use super::*;

	fn none(_: &str) -> Option<String> {
		None
	}

	#[test]
	fn defaults() {
		let cfg = Config::from_lookup(none);
		assert_eq!(cfg.conn_timeout, Duration::from_secs(5));
		assert_eq!(cfg.noproxy_timeout, Duration::from_secs(20));
		assert_eq!(cfg.max_inflight_dns, 512);
		assert_eq!(cfg.upstream_doh, DEFAULT_UPSTREAM_DOH);
		assert_eq!(cfg.fly_app_name, None);
		assert!(cfg.tls.is_none());
	}

	#[test]
	fn overrides() {
		let cfg = Config::from_lookup(|key| match key {
			"CONN_TIMEOUT_SEC" => Some("1".to_string()),
			"NOPROXY_TIMEOUT_SEC" => Some("2".to_string()),
			"MAX_INFLIGHT_DNS_QUERIES" => Some("7".to_string()),
			"UPSTREAM_DOH" => Some("https://doh.example/dns-query".to_string()),
			"FLY_APP_NAME" => Some("gw".to_string()),
			_ => None,
		});
		assert_eq!(cfg.conn_timeout, Duration::from_secs(1));
		assert_eq!(cfg.noproxy_timeout, Duration::from_secs(2));
		assert_eq!(cfg.max_inflight_dns, 7);
		assert_eq!(cfg.upstream_doh, "https://doh.example/dns-query");
		assert_eq!(cfg.fly_app_name.as_deref(), Some("gw"));
	}

	#[test]
	fn garbage_numbers_fall_back() {
		let cfg = Config::from_lookup(|key| match key {
			"CONN_TIMEOUT_SEC" => Some("soon".to_string()),
			_ => None,
		});
		assert_eq!(cfg.conn_timeout, Duration::from_secs(5));
	}

	#[test]
	fn rootless_ports_swap_privileged_only() {
		let p = Ports::rootless();
		assert_eq!(p.relay, 8080);
		assert_eq!(p.doh, 8443);
		assert_eq!(p.dot, 8853);
		assert_eq!(p.doh_cleartext, 1443);
		assert_eq!(p.echo, 5000);
	}
}
