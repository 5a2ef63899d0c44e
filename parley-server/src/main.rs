use clap::Parser;
use parley_core::ParleyConfig;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use parley_server::app::App;
use parley_server::subsystems::health::DependencyStatus;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "parley.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience; production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match ParleyConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging: RUST_LOG wins over service.log_level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    let app = match App::from_config(&config).await {
        Ok(app) => app,
        Err(e) => {
            eprintln!("Failed to initialise: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        let report = app.health.check().await;
        for (name, status) in [
            ("database", report.dependencies.database),
            ("generation", report.dependencies.genkit),
        ] {
            match status {
                DependencyStatus::Connected => println!("✅ {} connected", name),
                DependencyStatus::NotConfigured => println!("➖ {} not configured", name),
                DependencyStatus::Disconnected => println!("❌ {} unreachable", name),
            }
        }

        if !report.is_healthy() {
            println!("❌ Parley health check failed");
            std::process::exit(1);
        }
        println!("✅ Parley health check passed (v{})", report.version);
        return Ok(());
    }

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    app.registry.start();

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let served = parley_server::http::start_http_server(&addr, app.http.clone(), tx.subscribe()).await;

    app.registry.stop().await;
    tracing::info!("Parley stopped");

    served
}
