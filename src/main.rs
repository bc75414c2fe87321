//! frame-echo server and client entry point.

use frame_echo::apps;
use frame_echo::client::Client;
use frame_echo::config::{Cli, Command, Config, SendArgs, ServeArgs};
use frame_echo::endpoint::Endpoint;
use frame_echo::protocol::MAX_FRAME_PAYLOAD;
use frame_echo::server::signals::{forward_signals, ShutdownSignals};
use frame_echo::server::Server;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => serve(args),
        Command::Send(args) => send(args),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load(args)?;
    init_logging(&config.log_level);

    info!(
        host = %config.host,
        port = config.port,
        backlog = config.backlog,
        app = ?config.app,
        max_message_bytes = config.max_message_bytes,
        drain_deadline_ms = config.drain_deadline_ms,
        "Starting frame-echo server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(async {
        let server = Server::bind(&config, apps::build(config.app))?;
        let signals = ShutdownSignals::install()?;
        tokio::spawn(forward_signals(signals, server.shutdown_handle()));

        let report = server.run().await;
        if !report.forced.is_empty() {
            warn!(forced = ?report.forced, "Connections were force-closed");
        }
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

fn send(args: SendArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging(&args.log_level);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let endpoint = Endpoint::new(args.host, args.port);
        let mut client = Client::connect(&endpoint, MAX_FRAME_PAYLOAD).await?;
        info!(endpoint = %endpoint, "Connected");

        for _ in 0..args.repeat {
            let response = client.request(args.message.as_bytes()).await?;
            println!("{}", response.escape_ascii());
        }

        client.close().await?;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}
