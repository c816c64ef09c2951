mod cbt_api;
mod cbt_config;
mod cbt_controllers;
mod cbt_models;
mod cbt_prefs;
mod cbt_views;

use anyhow::Context;
use cbt_api::{CTAGateway, HttpTransport};
use cbt_config::CBTConfig;
use cbt_controllers::{CBTControllers, FixedGeolocator, Surfaces};
use cbt_prefs::{FileStore, PreferenceStore};
use cbt_views::{CBTViews, ConsoleNotifier, TerminalMap, TerminalRouteList};
use clap::Parser;
use log::info;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;

fn main() {
    // Set up panic hook for better error messages
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("\n{}", "═".repeat(70));
        eprintln!("❌ TRACKER PANIC");
        eprintln!("{}", "═".repeat(70));
        eprintln!("\nThe bus tracker hit an unexpected error:");
        eprintln!("{}", panic_info);
        eprintln!("\n💡 Troubleshooting:");
        eprintln!("  • Restart the tracker");
        eprintln!("  • Check your internet connection and CTA_API_KEY");
        eprintln!("\n{}", "═".repeat(70));
    }));

    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = CBTConfig::parse();

    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| run(config))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            CBTViews::show_fallback(&format!("{:#}", e));
            std::process::exit(1);
        }
        Err(_) => {
            eprintln!("\n⚠️  Tracker terminated unexpectedly");
            std::process::exit(1);
        }
    }
}

fn run(config: CBTConfig) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;

    runtime.block_on(async_main(config))
}

async fn async_main(config: CBTConfig) -> anyhow::Result<()> {
    let dashboard = config.dashboard()?;
    let transport = HttpTransport::new(config.request_timeout())?;
    let gateway = Arc::new(CTAGateway::new(Arc::new(transport), &config.base_url, config.api_key()?));

    let prefs_path = config.prefs_path.clone().unwrap_or_else(FileStore::default_path);
    let store = FileStore::open(prefs_path.clone())
        .with_context(|| format!("Could not open preferences at {}", prefs_path.display()))?;
    info!("Preferences at {}", store.path().display());

    let surfaces = Surfaces {
        map: Box::new(TerminalMap::default()),
        route_list: Box::new(TerminalRouteList),
        notifier: Box::new(ConsoleNotifier),
    };

    let mut controller = CBTControllers::new(
        gateway,
        PreferenceStore::new(Box::new(store)),
        surfaces,
        Box::new(FixedGeolocator::new(config.position())),
        dashboard,
    );

    controller.init().await;
    CBTViews::show_help();

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let input = LinesStream::new(stdin.lines()).map_while(Result::ok);
    controller.run(Box::pin(input), config.route.clone()).await;

    info!("Tracker stopped");
    Ok(())
}
