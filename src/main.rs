use antinuke_daemon::config::{SETTINGS_FILE, Settings};
use antinuke_daemon::handlers::Handler;
use antinuke_daemon::protection::{ProtectionService, SerenityPlatform, YamlConfigStore};
use antinuke_daemon::{Error, logging};
use serenity::all::{ClientBuilder, GatewayIntents, Http};
use std::env;
use std::sync::Arc;
use tracing::{error, info};

/// Main function to run the bot
async fn async_main() -> Result<(), Error> {
    logging::init()?;

    let settings = Settings::load(SETTINGS_FILE).await?;
    let token = env::var("DISCORD_TOKEN").map_err(|_| "DISCORD_TOKEN must be set")?;

    let store = Arc::new(YamlConfigStore::load(settings.data_dir.clone()).await?);
    let platform = Arc::new(SerenityPlatform::new(Arc::new(Http::new(&token))));
    let service = ProtectionService::new(store, platform, settings);
    if service.start_refresh_task().is_none() {
        error!("Configuration refresh task was already running");
    }

    // Audit log entries need GUILD_MODERATION, owner changes need GUILDS
    let intents =
        GatewayIntents::GUILDS | GatewayIntents::GUILD_MODERATION | GatewayIntents::GUILD_MEMBERS;
    let mut client = ClientBuilder::new(&token, intents)
        .event_handler(Handler::new(service.clone()))
        .await?;

    let shard_manager = client.shard_manager.clone();
    logging::log_console("Starting anti-nuke daemon...".to_string());
    tokio::select! {
        result = client.start() => {
            if let Err(err) = result {
                error!("Client stopped with an error: {err}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down");
            shard_manager.shutdown_all().await;
        }
    }

    service.shutdown().await;
    Ok(())
}

fn main() {
    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(Error::from)
        .and_then(|runtime| runtime.block_on(async_main()));

    if let Err(err) = result {
        eprintln!("Error: {err}");
    }
}
