use clap::{CommandFactory, Parser};
use maestro_cli::output::{OutputFormat, print_result};
use maestro_cli::{cli::Cli, commands, logging};
use tracing::error;

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	let Some(action) = cli.action() else {
		let _ = Cli::command().print_help();
		std::process::exit(2);
	};

	if let Err(err) = commands::dispatch(action, &cli).await {
		error!(target = "maestro.cli", error = %err, "command failed");
		if cli.format == OutputFormat::Json {
			print_result(&commands::failure(action, &err), cli.format);
		}
		std::process::exit(1);
	}
}
