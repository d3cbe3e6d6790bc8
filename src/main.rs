use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use stackbot::api::{
    ExchangeDriver, LogNotifier, Notifier, OrderStream, PaperExchange, ProxyDriver,
    TelegramNotifier,
};
use stackbot::config::{RuntimeConfig, StrategyParameters};
use stackbot::execution::runner::StopReason;
use stackbot::execution::{BotContext, FillListener, SharedFillFlags, StrategyRunner};
use stackbot::persistence::{FileStateStore, RedisStateStore, StateStore};
use stackbot::risk::TrailingStopController;
use stackbot::Result;
use tokio_util::sync::CancellationToken;

const ORDER_EVENT_BUFFER: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "stackbot", version, about = "Position-averaging perpetual futures bot")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the strategy for one bot instance
    Run {
        #[command(flatten)]
        instance: InstanceArgs,

        /// Trade against an in-memory exchange starting at this price
        #[arg(long, value_name = "PRICE")]
        paper: Option<f64>,
    },
    /// Print the last status snapshot of a bot instance
    Status {
        #[command(flatten)]
        instance: InstanceArgs,
    },
}

#[derive(Args, Debug)]
struct InstanceArgs {
    /// Bot instance tag; selects config/{tag}.toml and the state keys
    #[arg(long)]
    tag: String,

    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Keep state in Redis instead of JSON files
    #[arg(long)]
    redis: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Run { instance, paper } => run(instance, paper).await,
        Command::Status { instance } => {
            setup_logging(false);
            status(instance).await
        }
    }
}

fn setup_logging(debug: bool) {
    let default = if debug { "stackbot=debug" } else { "stackbot=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn open_store(instance: &InstanceArgs, runtime: &RuntimeConfig) -> Result<Arc<dyn StateStore>> {
    if instance.redis {
        let store = RedisStateStore::new(&runtime.redis_url, &instance.tag).await?;
        Ok(Arc::new(store))
    } else {
        tracing::info!("State directory: {}", instance.data_dir.display());
        Ok(Arc::new(FileStateStore::new(&instance.data_dir, &instance.tag)))
    }
}

fn build_notifier(tag: &str, runtime: &RuntimeConfig) -> Result<Arc<dyn Notifier>> {
    match &runtime.telegram {
        Some(tg) => {
            let notifier =
                TelegramNotifier::new(tg.bot_token.clone(), tg.chat_id.clone(), tag.to_string())?;
            Ok(Arc::new(notifier))
        }
        None => {
            tracing::warn!("Telegram not configured, notifications go to the log only");
            Ok(Arc::new(LogNotifier))
        }
    }
}

fn build_driver(
    params: &StrategyParameters,
    runtime: &RuntimeConfig,
    paper: Option<f64>,
) -> Result<Arc<dyn ExchangeDriver>> {
    if let Some(price) = paper {
        tracing::warn!("📝 Paper trading {} from {}", params.symbol, price);
        return Ok(Arc::new(PaperExchange::new(params.symbol.clone(), price)));
    }
    let url = runtime.require_proxy_url()?;
    Ok(Arc::new(ProxyDriver::new(url)?))
}

async fn run(instance: InstanceArgs, paper: Option<f64>) -> Result<()> {
    let params = StrategyParameters::load(&instance.data_dir, &instance.tag)
        .with_context(|| format!("Failed to load config for {}", instance.tag))?;
    setup_logging(params.debug);

    tracing::info!("🚀 stackbot starting: {} ({} {})", instance.tag, params.side, params.symbol);

    let runtime = RuntimeConfig::from_env();
    let driver = build_driver(&params, &runtime, paper)?;
    let store = open_store(&instance, &runtime).await?;
    let notifier = build_notifier(&instance.tag, &runtime)?;

    let restored = store.load().await.context("Failed to load saved state")?;
    let flags = restored
        .as_ref()
        .map(SharedFillFlags::restored)
        .unwrap_or_default();

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Loss gate: {} at -{}%", params.is_loss_check, params.loss_limit_pct);
    tracing::info!(
        "  RSI: avdo {} / prta {}",
        params.avdo_rsi_threshold,
        params.prta_rsi_threshold
    );
    tracing::info!(
        "  Offsets: avdo {}% / prta min {}%",
        params.avdo_offset_pct,
        params.prta_offset_min_pct
    );
    tracing::info!(
        "  TSL: {}",
        if params.tsl_enabled() {
            format!("{} of size on {}m", params.tsl_qty_factor, params.tsl_timeframe)
        } else {
            "off".to_string()
        }
    );

    let shutdown = CancellationToken::new();
    let ctx = BotContext::new(driver.clone(), notifier.clone(), store, flags.clone());
    let mut runner = StrategyRunner::new(ctx, params.clone(), restored, shutdown.clone());

    match &runtime.order_stream_url {
        Some(url) => {
            let (stream, events) = OrderStream::new(url.clone(), ORDER_EVENT_BUFFER);
            let listener = FillListener::new(
                params.symbol.clone(),
                flags.clone(),
                runner.limit_orders().armed(),
            );
            tokio::spawn(stream.run(shutdown.clone()));
            tokio::spawn(listener.run(events, shutdown.clone()));
        }
        None => tracing::warn!("ORDER_STREAM_URL not set, fills are not tracked"),
    }

    if params.tsl_enabled() && flags.trailing_stop_finished() {
        tracing::info!("🛡️  TSL already finished in an earlier run, not placing it again");
    } else if params.tsl_enabled() {
        let tsl = TrailingStopController::new(
            driver,
            notifier,
            params.symbol.clone(),
            params.side,
            params.tsl_qty_factor,
            params.tsl_timeframe,
        )
        .with_completion_flag(flags.clone())
        .spawn(&shutdown);
        runner.attach_trailing_stop(tsl);
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
                shutdown.cancel();
            }
        });
    }

    let result = runner.run().await;
    runner.stop().await;

    match &result {
        Ok(StopReason::Shutdown) => tracing::info!("👋 stackbot stopped"),
        Ok(StopReason::PositionClosed) => tracing::info!("🏁 Position closed, stackbot stopped"),
        Err(e) => tracing::error!("❌ stackbot stopped on error: {:#}", e),
    }
    result.map(|_| ())
}

async fn status(instance: InstanceArgs) -> Result<()> {
    let runtime = RuntimeConfig::from_env();
    let store = open_store(&instance, &runtime).await?;

    match store.load_status().await? {
        Some(status) => println!("{}: {}", instance.tag, status.summary()),
        None => println!("{}: no status written yet", instance.tag),
    }
    Ok(())
}
