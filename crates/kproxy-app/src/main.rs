use std::path::PathBuf;

use clap::Parser;
use kproxy::config::Config;

#[derive(Parser)]
#[command(name = "kproxy", about = "Network-edge filtering proxy for home networks")]
struct Args {
	/// Path to the YAML configuration file.
	#[arg(short, long)]
	config: Option<PathBuf>,
	/// Validate the configuration and exit.
	#[arg(long)]
	check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	let cfg = Config::load(args.config.as_deref())?;
	if args.check {
		println!("configuration ok");
		return Ok(());
	}

	kproxy::telemetry::init_tracing(&cfg.logging);
	rustls::crypto::aws_lc_rs::default_provider()
		.install_default()
		.expect("failed to install rustls crypto provider");

	kproxy::app::run(cfg).await
}
