//! # ferry
//!
//! Boots a runtime with an in-process host, drives a batch of post
//! operations through it and reports what was broadcast.

#![deny(unsafe_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use ferry_core::ids::CallId;
use ferry_core::{CallEnvelope, ContextMessage, DispatchError, EventKind, Params, Payload};
use ferry_runtime::{ContextPort, MethodRouter, PostRequest, Runtime, RuntimeConfig};
use ferry_telemetry::{init_telemetry, TelemetryConfig};
use tracing::Level;

const DEMO_SOURCE: &str = "demo.js";

/// Drive post operations through the admission gate.
#[derive(Parser, Debug)]
#[command(name = "ferry", about = "Bounded host-call runtime demo")]
struct Cli {
    /// Concurrency limit (defaults to FERRY_CONCURRENCY or the host hint).
    #[arg(long)]
    concurrency: Option<usize>,

    /// Number of post operations to dispatch.
    #[arg(long, default_value = "32")]
    posts: u64,

    /// Simulated host latency per post.
    #[arg(long, default_value = "10")]
    latency_ms: u64,

    /// Every Nth post outlives the eviction timer (0 disables).
    #[arg(long, default_value = "8")]
    slow_every: u64,

    /// Every Nth post fails (0 disables).
    #[arg(long, default_value = "5")]
    fail_every: u64,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,

    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Startup arguments handed to the demo context.
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

fn nth(n: u64, every: u64) -> bool {
    every > 0 && n % every == every - 1
}

fn build_router(cli: &Cli, post_timer: Duration) -> MethodRouter {
    let mut router = MethodRouter::new();
    let calls = Arc::new(AtomicU64::new(0));
    let latency = Duration::from_millis(cli.latency_ms);
    let (slow_every, fail_every) = (cli.slow_every, cli.fail_every);

    router.register("post", move |params: Params, _opts| {
        let n = calls.fetch_add(1, Ordering::Relaxed);
        async move {
            if nth(n, fail_every) {
                return Err(DispatchError::Host(format!("simulated failure on post {n}")));
            }
            let delay = if nth(n, slow_every) {
                post_timer * 4
            } else {
                latency
            };
            tokio::time::sleep(delay).await;
            let id = params.get("id").and_then(|v| v.as_str()).unwrap_or_default();
            Ok(Payload::Binary(Bytes::from(format!("ok:{id}"))))
        }
    });
    router.register("fs.constants", |_params, _opts| async {
        Ok(Payload::Json(serde_json::json!({
            "O_RDONLY": 0,
            "O_WRONLY": 1,
            "O_RDWR": 2,
        })))
    });
    router.register("system.ping", |params: Params, _opts| async move {
        Ok(Payload::Json(serde_json::Value::Object(params)))
    });
    router
}

/// Context module: asks for its args, pings the host and echoes every
/// forwarded event id back as a plain message.
async fn demo_context(mut port: ContextPort) {
    port.request_args();
    port.invoke(&CallEnvelope::new("system.ping").with_param("from", "demo"));
    while let Some(message) = port.recv().await {
        match message {
            ContextMessage::ArgsReply(args) => {
                tracing::info!(?args, "context received args");
            }
            ContextMessage::CallResult { message, result } => {
                tracing::info!(name = %message.name, ok = result.is_ok(), "context call answered");
            }
            ContextMessage::Event(event) => {
                let id = event.detail.get("id").cloned().unwrap_or_default();
                port.post(ContextMessage::Passthrough(serde_json::json!({ "seen": id })));
            }
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        json: cli.json_logs,
        ..TelemetryConfig::default()
    });

    let mut config = RuntimeConfig::from_env();
    if cli.concurrency.is_some() {
        config.concurrency = cli.concurrency;
    }
    config.args = cli.args.clone();

    let router = build_router(&cli, config.post_timer());
    let runtime = Arc::new(Runtime::new(config, Arc::new(router)).context("invalid runtime config")?);
    tracing::info!(
        concurrency = runtime.post_queue().limit(),
        posts = cli.posts,
        "ferry starting"
    );

    let source = runtime
        .base_url()
        .join(DEMO_SOURCE)
        .context("invalid demo source url")?;
    runtime.launcher().register_fn(&source, demo_context);

    let mut events = runtime.bus().subscribe_all();
    let bridge = runtime
        .spawn_context(DEMO_SOURCE)
        .context("failed to start demo context")?;
    let echoed = Arc::new(AtomicUsize::new(0));
    let echoed_in = Arc::clone(&echoed);
    bridge.set_on_message(move |_| {
        echoed_in.fetch_add(1, Ordering::Relaxed);
    });

    runtime.load();
    if runtime.ready().await.is_some() {
        tracing::debug!("fs.constants precached");
    }

    let mut tasks = Vec::with_capacity(cli.posts as usize);
    for seq in 0..cli.posts {
        let runtime = Arc::clone(&runtime);
        tasks.push(tokio::spawn(async move {
            let request = PostRequest::new(CallId::new(), seq)
                .with_params(serde_json::json!({ "seq": seq }))
                .with_header("x-ferry-seq", seq.to_string());
            runtime.post(request).await;
        }));
    }
    for task in tasks {
        task.await.context("post task panicked")?;
    }

    // Give the context a moment to drain forwarded events.
    tokio::time::sleep(Duration::from_millis(50)).await;
    bridge.terminate().await;

    let (mut data, mut errors, mut init) = (0u64, 0u64, 0u64);
    while let Some(event) = events.try_recv() {
        match event.kind {
            EventKind::Data => data += 1,
            EventKind::Error => errors += 1,
            EventKind::Init => init += 1,
        }
    }

    let stats = runtime.post_queue().stats();
    let summary = serde_json::json!({
        "posts": cli.posts,
        "data": data,
        "error": errors,
        "init": init,
        "echoed_by_context": echoed.load(Ordering::Relaxed),
        "gate": {
            "admitted": stats.admitted,
            "settled": stats.settled,
            "evicted": stats.evicted,
        },
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    tracing::info!("ferry finished");
    Ok(())
}
