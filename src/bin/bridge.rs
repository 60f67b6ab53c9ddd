use std::path::Path;

use clap::{App, Arg};
use railbus::config::BridgeConfig;
use railbus::dispatcher::Dispatcher;
use tracing::{error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("railbus-bridge")
        .version("0.1.0")
        .about("Bridges one OBIS link to its command/telemetry bus channels")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Bridge configuration file (TOML)")
                .takes_value(true)
                .required(true),
        )
        .get_matches();

    let config_path = matches.value_of("config").unwrap();
    let config = BridgeConfig::load(Path::new(config_path))?;
    info!(config = config_path, name = %config.bridge.name, "bridge starting");

    let mut dispatcher = Dispatcher::new(config);
    dispatcher.create_sessions().await?;

    // The process supervisor (init system, container runtime) owns restarts;
    // we only honor a stop request.
    let handle = dispatcher.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping bridge");
            handle.stop();
        }
    });

    if let Err(e) = dispatcher.run().await {
        error!(error = %e, "bridge terminated");
        return Err(e.into());
    }
    Ok(())
}
