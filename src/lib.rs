pub mod aggregator;
pub mod channels;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hoymiles;
pub mod monitor;
pub mod options;
pub mod poller;
pub mod prelude;
pub mod server;
pub mod source;
pub mod sunspec;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::prelude::*;
use std::sync::Arc;
use tokio_serial::SerialPortBuilderExt;

use crate::coordinator::Coordinator;
use crate::monitor::Monitor;
use crate::poller::Poller;
use crate::server::Server;

// What shutdown needs after the tasks have taken ownership of their
// components: the channel bundle and a handle on the shared stats.
struct Components {
    channels: Channels,
    stats: std::sync::Arc<std::sync::Mutex<coordinator::GatewayStats>>,
}

impl Components {
    fn stop(self) {
        info!("Sending shutdown signals...");
        let _ = self.channels.to_bus.send(poller::BusCommand::Shutdown);
        let _ = self.channels.to_server.send(server::ChannelData::Shutdown);
        let _ = self
            .channels
            .from_coordinator
            .send(monitor::ChannelData::Shutdown);
        let _ = self
            .channels
            .to_coordinator
            .send(coordinator::ChannelData::Shutdown);

        if let Ok(stats) = self.stats.lock() {
            info!("Final statistics:");
            stats.print_summary();
        } else {
            error!("Failed to lock statistics for printing");
        }
    }
}

pub async fn app(mut shutdown: broadcast::Receiver<()>, config: Arc<Config>) -> Result<()> {
    info!("hoymiles-bridge {} starting", CARGO_PKG_VERSION);

    let channels = Channels::new();

    info!("Opening serial port {} @ {} 8N1", config.serial_port(), config.baud_rate());
    let serial = tokio_serial::new(config.serial_port(), config.baud_rate())
        .data_bits(tokio_serial::DataBits::Eight)
        .stop_bits(tokio_serial::StopBits::One)
        .parity(tokio_serial::Parity::None)
        .open_native_async()
        .map_err(|e| file_error!("cannot open {}: {}", config.serial_port(), e))?;

    let mut coordinator = Coordinator::new(config.clone(), channels.clone());
    let poller = Poller::new(config.clone(), channels.clone(), serial);
    let server = Server::new(config.clone(), channels.clone());
    let monitor = Monitor::new(config.clone(), channels.clone())?;

    let components = Components {
        channels: channels.clone(),
        stats: coordinator.stats.clone(),
    };

    // The coordinator must be receiving before the bus task sends its
    // first poll result.
    let coordinator_handle = tokio::spawn(async move {
        if let Err(e) = coordinator.start().await {
            error!("coordinator error: {}", e);
        }
    });

    let monitor_handle = tokio::spawn(async move {
        if let Err(e) = monitor.start().await {
            error!("monitor error: {}", e);
        }
    });

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.start().await {
            error!("tcp server error: {}", e);
        }
    });

    let poller_handle = tokio::spawn(async move {
        if let Err(e) = poller.start().await {
            error!("bus error: {}", e);
        }
    });

    info!("All components running");

    let _ = shutdown.recv().await;
    info!("Shutting down...");
    components.stop();

    // give the tasks a moment to drain their channels
    let _ = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        futures::future::join_all([coordinator_handle, monitor_handle, server_handle, poller_handle]),
    )
    .await;

    info!("hoymiles-bridge stopped");
    Ok(())
}
