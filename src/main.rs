use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mqttgate")]
#[command(version)]
#[command(about = "Answers HTTP requests by publishing them over MQTT and returning the reply")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the configuration and serve HTTP until interrupted
    Serve {
        /// Path to the YAML configuration file
        #[arg(long, default_value = "./config/example-config.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    let Command::Serve { config } = Args::parse().command;

    let cfg = match mqttgate_config::load_and_validate(&config) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = mqttgate_server::serve(cfg).await {
        eprintln!("server exited with error: {e}");
        std::process::exit(1);
    }
}
