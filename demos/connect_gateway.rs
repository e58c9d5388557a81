use std::error::Error;

use secrecy::SecretString;
use tracing_subscriber::EnvFilter;
use wyvern::gateway::client::{GatewayClient, GatewayOptions};

/// GUILDS | GUILD_MESSAGES
const INTENTS: u64 = (1 << 0) | (1 << 9);

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "wyvern=info".into()))
        .init();

    let token = std::env::var("BOT_TOKEN").unwrap_or_else(|_| "REPLACE_WITH_BOT_TOKEN".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let options = GatewayOptions {
            intents: INTENTS,
            ..GatewayOptions::default()
        };
        let client = GatewayClient::with_options(SecretString::new(token), options);
        let mut connection = client.connect().await?;

        let session = connection.session();
        println!(
            "connected session_id={}",
            session.session_id.as_deref().unwrap_or("-")
        );

        while let Some(event) = connection.recv().await {
            println!(
                "seq={} event={} latency_ms={}",
                event.sequence,
                event.name,
                connection
                    .latency()
                    .map_or_else(|| "-".to_string(), |latency| latency.as_millis().to_string()),
            );
            if event.name == "MESSAGE_CREATE" && event.data["content"] == "!stop" {
                connection.stop();
            }
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
