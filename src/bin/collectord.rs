//! collectord - flood detection edge collector
//!
//! This daemon:
//! 1. Opens the configured frame source (video file, image directory, stub stream)
//! 2. Reads the weather station (Netatmo, or static readings when simulated)
//! 3. Samples the source once per interval, aligned to video time
//! 4. Publishes each sample as JSON telemetry over MQTT (or logs it in dry runs)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use flood_collector::config::CollectorConfig;
use flood_collector::sensor::{EnvFileTokenStore, NetatmoApi, StdinPrompt};
use flood_collector::{
    open_source, AcquisitionScheduler, LogSink, MetadataEnricher, ObservationReader,
    ObservationSource, PayloadFormatter, Pipeline, StaticSensor, StopSignal, TelemetryPublisher,
    TelemetrySink,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Sample camera frames and weather readings and publish them over MQTT"
)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "FLOOD_CONFIG")]
    config: Option<PathBuf>,

    /// Log payloads instead of publishing them.
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = CollectorConfig::load_from(args.config.as_deref())?;
    let scheduler = AcquisitionScheduler::new(cfg.acquisition.interval_secs)?;

    let observations: Box<dyn ObservationSource> = if cfg.sensor.simulate {
        Box::new(StaticSensor::new(cfg.sensor.static_reading))
    } else {
        Box::new(ObservationReader::new(
            cfg.sensor.credentials.clone(),
            cfg.sensor.sensor_id.clone(),
            Arc::new(NetatmoApi::new(cfg.sensor.api_base.clone())),
            Arc::new(EnvFileTokenStore::new(cfg.sensor.token_file.clone())),
            Arc::new(StdinPrompt),
        ))
    };

    let enricher = MetadataEnricher {
        camera_id: cfg.acquisition.camera_id.clone(),
        location: cfg.acquisition.location.clone(),
        motion: cfg.acquisition.motion,
        resource_constrained: cfg.acquisition.resource_constrained,
    };
    let formatter = PayloadFormatter::new(cfg.acquisition.jpeg_quality);

    let mut source = open_source(&cfg.source)?;

    let publisher = if cfg.mqtt.enabled && !args.dry_run {
        Some(TelemetryPublisher::connect(&cfg.mqtt).context("start MQTT publisher")?)
    } else {
        log::info!("MQTT disabled; payloads will be logged");
        None
    };
    let log_sink = LogSink::new(cfg.mqtt.topic.clone());
    let sink: &dyn TelemetrySink = match &publisher {
        Some(publisher) => publisher,
        None => &log_sink,
    };

    let stop = StopSignal::new();
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            log::info!("shutdown signal received, stopping acquisition...");
            stop.stop();
        })
        .context("error setting Ctrl-C handler")?;
    }

    let pipeline = Pipeline {
        observations: observations.as_ref(),
        enricher: &enricher,
        formatter: &formatter,
        sink,
    };
    let result = scheduler.run(source.as_mut(), &pipeline, &stop);

    if let Some(publisher) = publisher {
        publisher.close();
    }

    let summary = result?;
    log::info!(
        "collectord done: {} samples, {} published, {} dropped, {} skipped, {} frames read{}",
        summary.cycles,
        summary.submitted,
        summary.dropped,
        summary.skipped,
        summary.frames_read,
        if summary.stopped { " (stopped)" } else { "" }
    );
    Ok(())
}
