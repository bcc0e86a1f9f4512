use anyhow::Result;
use log::{error, info};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use hoymiles_bridge::options::Options;
use hoymiles_bridge::prelude::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::new();

    let config = Config::new(options.config_file.clone()).unwrap_or_else(|err| {
        // no logging available yet, so eprintln! will have to do
        eprintln!("Error: {:?}", err);
        std::process::exit(255);
    });
    let config = Arc::new(config);

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.loglevel()))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .init();

    info!(
        "Starting hoymiles-bridge with config file: {}",
        options.config_file
    );

    let (shutdown_tx, _) = broadcast::channel(1);

    // Ctrl+C
    let shutdown = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Ctrl+C received, initiating shutdown");
        let _ = shutdown.send(());
    });

    // Optional runtime limit
    if let Some(time) = options.runtime {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            info!("Runtime of {} seconds specified, will terminate automatically", time);
            tokio::time::sleep(Duration::from_secs(time)).await;
            info!("Runtime duration reached, initiating shutdown");
            let _ = shutdown.send(());
        });
    }

    hoymiles_bridge::app(shutdown_tx.subscribe(), config).await
}
