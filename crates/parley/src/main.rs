use std::sync::Arc;

use anyhow::Context;
use parley_core::{config::Config, Bot, BotEvent, ErrorEvent, Result as CoreResult};
use parley_http::ReqwestTransport;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    parley_core::logging::init("parley")?;

    let cfg = Config::load()?;
    let transport = ReqwestTransport::new(cfg.request_timeout)?;
    let bot = Bot::builder(cfg).transport(Arc::new(transport)).build()?;
    info!(user = %bot.auth().user_id.0, "bot ready");

    let mut events = bot.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(BotEvent::Error(ErrorEvent {
                    kind,
                    chain,
                    message,
                })) => warn!(%kind, ?chain, %message, "bot error"),
                Ok(BotEvent::Token(_)) => info!("access token refreshed"),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "error channel lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    bot.on("message", |message, ctx| async move {
        let Some(text) = message.text.filter(|t| !t.trim().is_empty()) else {
            return CoreResult::Ok(());
        };
        ctx.say(text, None).await?;
        Ok(())
    });

    // One webhook payload per line.
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(payload) => {
                let outcome = bot.ingest(payload).await;
                info!(?outcome, "ingested");
            }
            Err(e) => warn!(error = %e, "skipping malformed line"),
        }
    }

    Ok(())
}
