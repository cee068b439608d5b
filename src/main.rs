//! framecast server binary
//!
//! Run with: framecast [OPTIONS]
//!
//! Examples:
//!   framecast                                              # simulated basler feed on 0.0.0.0:12345
//!   framecast --monitoring-url http://user:pw@cam/video    # adds the network monitoring camera
//!   framecast --monitoring-url rtsp://user:pw@cam:554/live # same, over RTSP (needs ffmpeg on PATH)
//!   framecast --device 0                                   # basler feed from local camera 0
//!
//! Logging follows RUST_LOG, defaulting to `framecast=info`.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use framecast::{
    BroadcastServer, ChannelConfig, NetworkSourceConfig, Scheduler, SchedulerConfig, ServerConfig, SourceConfig,
};

#[derive(Parser, Debug)]
#[command(name = "framecast")]
#[command(about = "Broadcast camera channels to WebSocket viewers")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "FRAMECAST_BIND", default_value = "0.0.0.0:12345")]
    bind: SocketAddr,

    /// Stream URL of the monitoring camera: MJPEG over http(s) or rtsp(s),
    /// credentials may be embedded
    #[arg(long, env = "FRAMECAST_MONITORING_URL")]
    monitoring_url: Option<String>,

    /// Local capture device index for the basler channel (simulated if unset)
    #[arg(long, env = "FRAMECAST_DEVICE")]
    device: Option<u32>,

    /// Change threshold of the monitoring channel
    #[arg(long, env = "FRAMECAST_MONITORING_THRESHOLD", default_value_t = 38.25)]
    monitoring_threshold: f64,

    /// Change threshold of the basler channel
    #[arg(long, env = "FRAMECAST_BASLER_THRESHOLD", default_value_t = 15.3)]
    basler_threshold: f64,

    /// Maximum concurrent viewers (0 = unlimited)
    #[arg(long, env = "FRAMECAST_MAX_CONNECTIONS", default_value_t = 0)]
    max_connections: usize,

    /// Frames buffered per viewer before dropping
    #[arg(long, env = "FRAMECAST_QUEUE_DEPTH", default_value_t = 8)]
    queue_depth: usize,

    /// Scheduler tick in milliseconds
    #[arg(long, env = "FRAMECAST_TICK_MS", default_value_t = 5)]
    tick_ms: u64,
}

impl Args {
    fn channels(&self) -> Vec<ChannelConfig> {
        let mut channels = Vec::new();

        match &self.monitoring_url {
            Some(url) => channels.push(ChannelConfig::monitoring(url).change_threshold(self.monitoring_threshold)),
            None => tracing::warn!("No monitoring URL configured, monitoring channel disabled"),
        }

        let mut basler = ChannelConfig::basler().change_threshold(self.basler_threshold);
        if let Some(index) = self.device {
            basler = basler.source(SourceConfig::LocalDevice { index });
        }
        channels.push(basler);

        channels
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("framecast=info".parse()?))
        .init();

    let scheduler_config = SchedulerConfig::default().tick_interval(Duration::from_millis(args.tick_ms.max(1)));
    let scheduler = Scheduler::with_channels(scheduler_config, args.channels(), &NetworkSourceConfig::default());

    let config = ServerConfig::default()
        .bind(args.bind)
        .max_connections(args.max_connections)
        .viewer_queue_depth(args.queue_depth);
    let server = BroadcastServer::new(config);

    server
        .run_until(scheduler, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    tracing::info!("Shut down");
    Ok(())
}
