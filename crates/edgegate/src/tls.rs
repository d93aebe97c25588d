use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use edge_core::strng::{self, Strng};
use rustls::ServerConfig;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tracing::{debug, info, warn};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

const DEFAULT_CERT_FILE: &str = "./test/certs/server.crt";
const DEFAULT_KEY_FILE: &str = "./test/certs/server.key";

/// The terminating certificate plus the DNS names it answers for. The name
/// set decides which inbound connections are the gateway's own DNS service
/// rather than relay traffic.
#[derive(Clone)]
pub struct TlsSettings {
	pub server_config: Arc<ServerConfig>,
	pub names: Vec<Strng>,
}

impl fmt::Debug for TlsSettings {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TlsSettings").field("names", &self.names).finish()
	}
}

/// Pin the process-wide rustls crypto provider so config builders never
/// depend on what feature unification happened to enable. Idempotent.
pub fn install_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Load certificates from the env-embedded PEM bundle first, then from PEM
/// files. Returning None is not an error: relay+DNS ports degrade to
/// relay-only without a certificate.
pub fn load<F>(lookup: &F) -> Option<TlsSettings>
where
	F: Fn(&str) -> Option<String>,
{
	install_crypto_provider();
	let (cert_pem, key_pem) = match certkey_pem_env(lookup) {
		Some(pair) => {
			info!("tls w key/crt PEM");
			pair
		},
		None => {
			let pair = certkey_pem_files(lookup)?;
			info!("tls w key/crt FILE");
			pair
		},
	};
	build(&cert_pem, &key_pem)
}

/// `TLS_CERTKEY` carries `KEY=<b64>` / `CRT=<b64>` lines. Splitting on "="
/// ate the base64 padding upstream of us, hence the no-pad alphabet.
fn certkey_pem_env<F>(lookup: &F) -> Option<(Vec<u8>, Vec<u8>)>
where
	F: Fn(&str) -> Option<String>,
{
	let bundle = lookup("TLS_CERTKEY").filter(|v| !v.is_empty())?;
	let mut key = None;
	let mut cert = None;
	for line in bundle.lines() {
		let Some((k, v)) = line.split_once('=') else {
			continue;
		};
		match k.to_ascii_uppercase().as_str() {
			"KEY" => key = STANDARD_NO_PAD.decode(v.trim_end_matches('=')).ok(),
			"CRT" => cert = STANDARD_NO_PAD.decode(v.trim_end_matches('=')).ok(),
			_ => {},
		}
		if let (Some(c), Some(k)) = (&cert, &key) {
			return Some((c.clone(), k.clone()));
		}
	}
	debug!("no usable pem in env bundle");
	None
}

fn certkey_pem_files<F>(lookup: &F) -> Option<(Vec<u8>, Vec<u8>)>
where
	F: Fn(&str) -> Option<String>,
{
	let cert_path = lookup("TLS_CERT_PATH").unwrap_or_else(|| DEFAULT_CERT_FILE.to_string());
	let key_path = lookup("TLS_KEY_PATH").unwrap_or_else(|| DEFAULT_KEY_FILE.to_string());
	let cert = std::fs::read(&cert_path).ok()?;
	let key = std::fs::read(&key_path).ok()?;
	Some((cert, key))
}

fn build(cert_pem: &[u8], key_pem: &[u8]) -> Option<TlsSettings> {
	install_crypto_provider();
	let certs = CertificateDer::pem_slice_iter(cert_pem)
		.collect::<Result<Vec<_>, _>>()
		.ok()?;
	if certs.is_empty() {
		return None;
	}
	let key = PrivateKeyDer::from_pem_slice(key_pem).ok()?;
	let names = dns_names(&certs[0]);
	let mut config = match ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(certs, key)
	{
		Ok(config) => config,
		Err(err) => {
			warn!(%err, "unusable tls cert/key pair");
			return None;
		},
	};
	config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
	info!(?names, "tls terminating for");
	Some(TlsSettings {
		server_config: Arc::new(config),
		names,
	})
}

/// The names this certificate answers for: subject CN plus SAN DNS names.
/// Empty names are dropped; a stray empty CN would otherwise substring-match
/// every hostname.
fn dns_names(cert: &CertificateDer) -> Vec<Strng> {
	let Ok((_, parsed)) = X509Certificate::from_der(cert) else {
		return Vec::new();
	};
	let mut names = Vec::new();
	if let Some(cn) = parsed
		.subject()
		.iter_common_name()
		.next()
		.and_then(|attr| attr.as_str().ok())
	{
		names.push(cn);
	}
	if let Ok(Some(san)) = parsed.subject_alternative_name() {
		for name in &san.value.general_names {
			if let GeneralName::DNSName(dns) = name {
				names.push(*dns);
			}
		}
	}
	names
		.into_iter()
		.filter(|n| !n.is_empty())
		.map(strng::new)
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn self_signed(names: &[&str]) -> (String, String) {
		let kp = rcgen::KeyPair::generate().expect("generate key");
		let params = rcgen::CertificateParams::new(
			names.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
		)
		.expect("cert params");
		let cert = params.self_signed(&kp).expect("self sign");
		(cert.pem(), kp.serialize_pem())
	}

	#[test]
	fn pem_files_round_trip_names() {
		let (cert_pem, key_pem) = self_signed(&["dns.gw.example", "alt.gw.example"]);
		let settings = build(cert_pem.as_bytes(), key_pem.as_bytes()).expect("build settings");
		assert!(settings.names.iter().any(|n| n == "dns.gw.example"));
		assert!(settings.names.iter().any(|n| n == "alt.gw.example"));
		assert_eq!(
			settings.server_config.alpn_protocols,
			vec![b"h2".to_vec(), b"http/1.1".to_vec()]
		);
	}

	#[test]
	fn env_bundle_wins_over_files() {
		let (cert_pem, key_pem) = self_signed(&["bundle.gw.example"]);
		let bundle = format!(
			"CRT={}\nKEY={}",
			STANDARD_NO_PAD.encode(cert_pem.as_bytes()),
			STANDARD_NO_PAD.encode(key_pem.as_bytes()),
		);
		let settings = load(&|key| match key {
			"TLS_CERTKEY" => Some(bundle.clone()),
			_ => None,
		})
		.expect("load from bundle");
		assert!(settings.names.iter().any(|n| n == "bundle.gw.example"));
	}

	#[test]
	fn missing_everything_is_none() {
		assert!(load(&|_| None).is_none());
	}

	#[test]
	fn broken_bundle_is_none() {
		let settings = load(&|key| match key {
			"TLS_CERTKEY" => Some("KEY=!!!\nCRT=!!!".to_string()),
			_ => None,
		});
		assert!(settings.is_none());
	}
}
