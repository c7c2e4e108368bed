mod config;
mod logging;
mod metrics;
mod server;
mod signaling;

use anyhow::Result;
use clap::Parser;
use minisfu_sfu::Sfu;
use tracing::info;

use config::Config;
use server::MiniSfuServer;

#[derive(Parser, Debug)]
#[command(name = "minisfu")]
#[command(about = "Minimal WebRTC selective forwarding unit", long_about = None)]
struct Args {
    /// Config file (json, yaml or toml)
    #[arg(short = 'c', long, env = "MINISFU_CONFIG")]
    config: Option<String>,

    /// Signaling listen address, overrides `server.addr`
    #[arg(short = 'a', long)]
    addr: Option<String>,

    /// Metrics listen address, overrides `server.metrics_addr` (empty disables)
    #[arg(short = 'm', long)]
    metrics_addr: Option<String>,

    /// Log level, overrides `logging.level`
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(addr) = self.addr {
            config.server.addr = addr;
        }
        if let Some(metrics_addr) = self.metrics_addr {
            config.server.metrics_addr = metrics_addr;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("--- Starting minisfu ---");
    info!("Signaling address: {}", config.server.addr);

    // 4. Build the SFU over webrtc-rs transports
    let sfu = Sfu::with_webrtc(config.sfu.clone())?;

    // 5. Serve until shutdown
    MiniSfuServer::new(config, sfu).start().await
}
