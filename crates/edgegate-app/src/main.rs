use std::sync::Arc;

use anyhow::Context;
use edgegate::config::Config;
use edgegate::dns::DohStub;
use edgegate::proxy::Gateway;
use tracing::info;

fn main() -> anyhow::Result<()> {
	edge_core::telemetry::setup_logging();
	edgegate::tls::install_crypto_provider();
	info!("edgegate {}", edge_core::version::BuildInfo::new());

	let cfg = Arc::new(Config::from_env());
	let runtime = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.context("build runtime")?;
	runtime.block_on(async move {
		let resolver = Arc::new(DohStub::new(&cfg).context("doh upstream client")?);
		Gateway::new(cfg, resolver).run().await
	})
}
