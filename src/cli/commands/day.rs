use std::rc::Rc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

use crate::cli::config::{load_config_from_path, Config};
use crate::cli::DayArgs;
use crate::facade::{ApiError, DaySum, SensorApi, SensorQuery};
use crate::sensor_cache::{Hooks, SensorCache};
use crate::transport::{pump, ChannelPush, IsRetryable, PushCommand, PushMessage, ReqwestHttp};

type DayUpdate = Result<DaySum, ApiError>;

pub async fn execute_day(args: DayArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => load_config_from_path(path)?,
        None => Config::load()?,
    };

    // The cache and its callbacks are single-threaded; everything runs on one LocalSet.
    LocalSet::new().run_until(run_day(config, args)).await
}

async fn run_day(config: Config, args: DayArgs) -> Result<()> {
    let http = ReqwestHttp::new().map_err(anyhow::Error::msg)?;
    let (push, mut commands) = ChannelPush::with_commands();
    let api = SensorApi::new(
        &config.http_host,
        &config.api_version,
        Rc::new(http),
        Rc::new(push),
    );
    let registry = api.registry();
    let cache = SensorCache::new(api, config.failure_policy);

    let today = Utc::now().date_naive();
    let day = args.date.unwrap_or(today);
    let query = SensorQuery::new(args.thing, &args.filter);

    let (tx, mut updates) = mpsc::unbounded_channel::<DayUpdate>();
    let errors = tx.clone();
    let dispatch = cache.update_day(
        &query,
        day,
        move |sum| {
            let _ = tx.send(Ok(sum));
        },
        Hooks::new().on_error(move |error| {
            let _ = errors.send(Err(error));
        }),
    );
    tracing::debug!(?dispatch, thing = args.thing, %day, "day requested");

    match updates.recv().await {
        Some(Ok(sum)) => print_sum(&sum)?,
        Some(Err(error)) => {
            let hint = match &error {
                ApiError::Fetch { source, .. } if source.is_retryable() => " (temporary, try again)",
                _ => "",
            };
            return Err(error).with_context(|| format!("Failed to load day sums{}", hint));
        }
        None => bail!("Day request finished without a result"),
    }

    let Some(push_url) = config.push_url.as_deref() else {
        return Ok(());
    };
    if day != today {
        return Ok(());
    }

    eprintln!("Connecting to {}...", push_url);
    let (ws_stream, _) = connect_async(push_url)
        .await
        .with_context(|| format!("Failed to connect to {}", push_url))?;
    let (mut write, mut read) = ws_stream.split();
    eprintln!("Connected. Following live sums for {}.", day);
    eprintln!("Press Ctrl+C to stop.\n");

    let (inbound, inbound_rx) = mpsc::channel::<PushMessage>(64);
    let pump_task = tokio::task::spawn_local(pump(inbound_rx, registry));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            Some(command) = commands.recv() => {
                write.send(Message::Text(encode(&command)?)).await?;
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<PushMessage>(&text) {
                    Ok(message) => {
                        if inbound.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "skipping unparseable push frame"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    eprintln!("Connection closed by server");
                    break;
                }
                Some(Err(e)) => {
                    eprintln!("WebSocket error: {}", e);
                    break;
                }
                Some(Ok(_)) => {}
            },
            Some(update) = updates.recv() => match update {
                Ok(sum) => print_sum(&sum)?,
                Err(error) => warn!(error = %error, "live update failed"),
            },
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
        }
    }

    cache.unsubscribe_everything(|| info!("subscriptions released"));
    while let Ok(command) = commands.try_recv() {
        if let Err(e) = write.send(Message::Text(encode(&command)?)).await {
            warn!(error = %e, "failed to send unsubscribe");
            break;
        }
    }
    let _ = write.close().await;

    drop(inbound);
    let dispatched = pump_task.await.context("Push pump panicked")?;
    info!(dispatched, "push bridge closed");
    Ok(())
}

fn encode(command: &PushCommand) -> Result<String> {
    serde_json::to_string(command).context("Failed to encode push command")
}

fn print_sum(sum: &DaySum) -> Result<()> {
    println!("{}", serde_json::to_string(sum)?);
    Ok(())
}
