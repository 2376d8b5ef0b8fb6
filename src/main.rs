use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use candle_pipeline::aggregator::CandleAggregator;
use candle_pipeline::config::{Config, LoggingConfig, SinkConfig, SinkKind, SourceMode};
use candle_pipeline::event::SourceEvent;
use candle_pipeline::kraken::KrakenWsClient;
use candle_pipeline::model::trade::Trade;
use candle_pipeline::pipeline::{Pipeline, PipelineSettings};
use candle_pipeline::replay::ReplayReader;
use candle_pipeline::sink::{CandleSink, FeatureStoreSink, MemorySink, SqliteSink};

const STATUS_CHANNEL_CAPACITY: usize = 256;
const SOURCE_STOP_TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::try_new(&logging.level)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_sink(config: &SinkConfig) -> Result<Box<dyn CandleSink>> {
    let sink: Box<dyn CandleSink> = match config.kind {
        SinkKind::Memory => Box::new(MemorySink::new()),
        SinkKind::Sqlite => Box::new(
            SqliteSink::open(&config.sqlite_path)
                .with_context(|| format!("failed to open {}", config.sqlite_path.display()))?,
        ),
        SinkKind::FeatureStore => {
            let url = config
                .feature_store_url
                .as_deref()
                .context("sink.feature_store_url is required for the feature_store sink")?;
            Box::new(FeatureStoreSink::new(
                url,
                &config.feature_group_name,
                config.feature_group_version,
                config.buffer_size,
            ))
        }
    };
    Ok(sink)
}

fn spawn_source(
    config: &Config,
    trade_tx: mpsc::Sender<Trade>,
    status_tx: mpsc::Sender<SourceEvent>,
    shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let handle = match config.source.mode {
        SourceMode::Live => {
            let client = KrakenWsClient::new(&config.source.ws_url, config.source.products());
            tokio::spawn(async move {
                if let Err(e) = client.connect_and_run(trade_tx, status_tx, shutdown).await {
                    tracing::error!(error = %e, "Kraken source failed");
                }
            })
        }
        SourceMode::Replay => {
            let path = config
                .source
                .replay_path
                .clone()
                .context("source.replay_path is required in replay mode")?;
            let reader = ReplayReader::new(path);
            tokio::spawn(async move {
                if let Err(e) = reader.run(trade_tx, shutdown).await {
                    tracing::error!(error = %e, "Replay source failed");
                }
            })
        }
    };
    Ok(handle)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (required by rustls 0.23+)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {:#}", e);
            eprintln!("Set CANDLE_PIPELINE_CONFIG or create config/default.toml");
            std::process::exit(1);
        }
    };

    init_tracing(&config.logging);

    tracing::info!(
        mode = ?config.source.mode,
        products = ?config.source.products(),
        window = %config.aggregator.window,
        late_policy = ?config.aggregator.late_policy,
        sink = ?config.sink.kind,
        "Starting candle-pipeline"
    );

    let aggregator = CandleAggregator::new(config.aggregator.to_aggregator_config()?)
        .context("invalid aggregator configuration")?;
    let sink = build_sink(&config.sink)?;

    let (trade_tx, trade_rx) = mpsc::channel::<Trade>(config.pipeline.channel_capacity);
    let (status_tx, mut status_rx) = mpsc::channel::<SourceEvent>(STATUS_CHANNEL_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let source_label = match config.source.mode {
        SourceMode::Live => "kraken",
        SourceMode::Replay => "replay",
    };
    let status_task = tokio::spawn(async move {
        while let Some(event) = status_rx.recv().await {
            event.log(source_label);
        }
    });

    let source_task = spawn_source(&config, trade_tx, status_tx, shutdown_rx.clone())?;

    let ctrl_c_shutdown = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Ctrl+C received");
        let _ = ctrl_c_shutdown.send(true);
    });

    let pipeline = Pipeline::new(aggregator, sink, PipelineSettings::from_config(&config));
    let result = pipeline.run(trade_rx, shutdown_rx).await;

    // Pipeline is done; stop the source if it is still running.
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(SOURCE_STOP_TIMEOUT, source_task)
        .await
        .is_err()
    {
        tracing::warn!("Source did not stop in time");
    }
    let _ = tokio::time::timeout(SOURCE_STOP_TIMEOUT, status_task).await;

    let summary = result.context("pipeline failed")?;
    tracing::info!(
        trades_accepted = summary.trades_accepted,
        trades_rejected = summary.trades_rejected,
        trades_late = summary.trades_late,
        candles_emitted = summary.candles_emitted,
        corrections_emitted = summary.corrections_emitted,
        "candle-pipeline finished"
    );
    Ok(())
}
