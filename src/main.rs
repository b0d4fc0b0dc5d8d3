use anyhow::Context;
use banipd::cli::Cli;
use banipd::tracing_setup::{get_subscriber, init_subscriber, level_filter, LogFile};
use banipd::utils::inspect_err;
use banipd::App;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Cli::parse();

    let filter = level_filter(args.verbose);
    let log_file = match &args.log {
        Some(path) => {
            let log_file = LogFile::open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            init_subscriber(get_subscriber(
                String::from("banipd"),
                filter,
                log_file.clone(),
            ))?;
            Some(log_file)
        }
        None => {
            init_subscriber(get_subscriber(
                String::from("banipd"),
                filter,
                std::io::stdout,
            ))?;
            None
        }
    };

    let config = args.into_config()?;
    let app = App::new(config, log_file).map_err(|err| inspect_err("Startup failed", err))?;
    app.run()
        .await
        .map_err(|err| inspect_err("Daemon stopped", err))
}
