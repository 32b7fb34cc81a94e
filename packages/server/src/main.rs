use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

mod commands;

#[derive(Parser)]
#[command(name = "flywheel-server", version, about = "Flywheel run engine server")]
struct Cli {
	#[command(subcommand)]
	command: commands::SubCommand,

	/// Path to a config file; may be passed multiple times, later files
	/// override earlier ones.
	#[clap(long, global = true)]
	config: Vec<PathBuf>,
}

fn main() -> Result<()> {
	let runtime = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?;
	runtime.block_on(main_inner())
}

async fn main_inner() -> Result<()> {
	let cli = Cli::parse();

	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.init();

	let config = flywheel_config::Config::load(&cli.config).await?;

	cli.command.execute(config).await
}
