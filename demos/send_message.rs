use std::error::Error;

use secrecy::SecretString;
use serde_json::json;
use tracing_subscriber::EnvFilter;
use wyvern::rest::client::{RestClient, RestError};

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "wyvern=debug".into()))
        .init();

    let token = std::env::var("BOT_TOKEN").unwrap_or_else(|_| "REPLACE_WITH_BOT_TOKEN".to_string());
    let channel_id: u64 = std::env::var("CHANNEL_ID")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = RestClient::new(SecretString::new(token))?;

        let me = client.fetch_current_user().await?;
        println!("logged in as {}", me["username"]);

        // Several sends against one channel share a bucket; the tracker spaces
        // them out instead of tripping a 429.
        for n in 1..=5 {
            let payload = json!({ "content": format!("hello #{n}") });
            match client.create_message(channel_id, &payload).await {
                Ok(message) => println!("sent message id={}", message["id"]),
                Err(RestError::NotFound { body }) => {
                    println!("unknown channel: {body}");
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        let bucket = client
            .bucket_tracker()
            .bucket(wyvern::Route::create_message(channel_id).bucket_key());
        println!("bucket state: {bucket:?}");

        Ok::<(), Box<dyn Error>>(())
    })
}
