use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Context as _;
use futures::{SinkExt, StreamExt};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use switchyard::bridge::codec;
use switchyard::channel::Offer;
use switchyard::config::{self, ManagerConfig};
use switchyard::{PipelineManager, SHUTDOWN, Signal, link, operations};

/// Wire name of this process when it speaks to the manager.
const CLI_SENDER: &str = "cli";

struct Args {
    pipeline: PathBuf,
    config: ManagerConfig,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("Usage: switchyard <pipeline> [options]");
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <pipeline>          Pipeline file of 'operation <id>' / 'signal <name>' lines");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --identity <id>     Manager identity [default: pipeline_manager]");
            eprintln!("  --config-dir <dir>  Directory of per-operation <id>.conf files [default: .]");
            eprintln!("  --tick-ms <n>       Polling interval in milliseconds [default: 5]");
            eprintln!("  --capacity <n>      Queue capacity [default: 1024]");
            eprintln!("  --grace-ms <n>      Shutdown grace period in milliseconds [default: 2000]");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(args).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
    // A blocked stdin read would otherwise hold runtime shutdown.
    process::exit(0);
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut pipeline: Option<PathBuf> = None;
    let mut config = ManagerConfig::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--identity" => {
                i += 1;
                config.identity = args.get(i).ok_or("--identity requires a value")?.clone();
            }
            "--config-dir" => {
                i += 1;
                config = config.with_config_dir(args.get(i).ok_or("--config-dir requires a value")?);
            }
            "--tick-ms" => {
                i += 1;
                config = config.with_tick(Duration::from_millis(millis(args.get(i), "--tick-ms")?));
            }
            "--capacity" => {
                i += 1;
                let value = args.get(i).ok_or("--capacity requires a value")?;
                let capacity = value
                    .parse()
                    .map_err(|_| format!("invalid --capacity: {value}"))?;
                config = config.with_capacity(capacity);
            }
            "--grace-ms" => {
                i += 1;
                config = config
                    .with_shutdown_grace(Duration::from_millis(millis(args.get(i), "--grace-ms")?));
            }
            "--help" | "-h" => return Err("".to_string()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => {
                if pipeline.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                pipeline = Some(PathBuf::from(arg));
            }
        }
        i += 1;
    }

    let pipeline = pipeline.ok_or("missing required argument: <pipeline>")?;
    Ok(Args { pipeline, config })
}

fn millis(value: Option<&String>, flag: &str) -> Result<u64, String> {
    let value = value.ok_or_else(|| format!("{flag} requires a value"))?;
    value
        .parse()
        .map_err(|_| format!("invalid {flag}: {value}"))
}

/// RUST_LOG wins; otherwise SWITCHYARD_LOG picks the level. LOG_FORMAT=json
/// switches to JSON lines. Logs go to stderr, stdout carries the wire.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("SWITCHYARD_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("switchyard={level},switchyard_cli={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn stop_for(identity: &str) -> String {
    codec::encode(&Signal::new("stop", CLI_SENDER, identity, 0.0))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let declarations = config::load(&args.pipeline)
        .with_context(|| format!("loading pipeline {}", args.pipeline.display()))?;

    let capacity = args.config.capacity;
    let manager = PipelineManager::build(args.config, &declarations, &operations::builtin())
        .context("building pipeline")?;
    let identity = manager.identity().to_string();
    tracing::info!(
        manager = %identity,
        operations = ?manager.operations(),
        signals = ?manager.signals(),
        "Starting pipeline"
    );

    let (near, outside) = link(capacity);
    let handle = manager.spawn(near);
    let inject = outside.outbound.clone();

    // stdin -> manager. EOF means nobody is left to talk to: stop the pipeline.
    let reader = {
        let outbound = outside.outbound;
        let identity = identity.clone();
        tokio::spawn(async move {
            let mut lines = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) if line.trim().is_empty() => {}
                    Ok(line) => {
                        if let Err(e) = outbound.offer(line) {
                            tracing::warn!(error = %e, "Dropping input line");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read stdin");
                        break;
                    }
                }
            }
            tracing::debug!("stdin closed");
            let _ = outbound.offer(stop_for(&identity));
        })
    };

    // manager -> stdout, until the manager's bridge goes away.
    let writer = {
        let mut inbound = outside.inbound;
        tokio::spawn(async move {
            let mut out = FramedWrite::new(tokio::io::stdout(), LinesCodec::new());
            while let Some(wire) = inbound.recv().await {
                if let Err(e) = out.send(wire).await {
                    tracing::warn!(error = %e, "Failed to write stdout");
                    break;
                }
            }
        })
    };

    let interrupt = {
        let identity = identity.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, stopping pipeline");
                let _ = inject.offer(stop_for(&identity));
            }
        })
    };

    let code = handle.wait().await.context("pipeline manager task failed")?;

    interrupt.abort();
    reader.abort();
    if let Err(e) = writer.await {
        tracing::warn!(error = %e, "stdout writer failed");
    }

    tracing::info!(code, "Pipeline ended");
    anyhow::ensure!(code == SHUTDOWN, "pipeline ended with code {code}");
    Ok(())
}
