use anyhow::Result;
use clap::Subcommand;

pub mod start;

#[derive(Subcommand)]
pub enum SubCommand {
	/// Runs the engine: API server plus delayed-job worker.
	Start(start::Opts),
	/// Prints the JSON schema for the config file.
	ConfigSchema,
}

impl SubCommand {
	pub async fn execute(self, config: flywheel_config::Config) -> Result<()> {
		match self {
			SubCommand::Start(opts) => opts.execute(config).await,
			SubCommand::ConfigSchema => {
				let schema = schemars::schema_for!(flywheel_config::Root);
				println!("{}", serde_json::to_string_pretty(&schema)?);
				Ok(())
			}
		}
	}
}
