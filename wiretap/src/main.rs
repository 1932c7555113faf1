use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wiretap_common::{SessionConfig, TargetId};
use wiretap_core::{launch, CoreError, InterceptService, LaunchOptions};
use wiretap_rules::RuleSet;

/// Wiretap - interactive HTTP interception for Chromium-family browsers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// DevTools base URL of a running browser (e.g. http://127.0.0.1:9222)
    #[arg(long)]
    devtools_url: Option<String>,

    /// Launch a browser instead of attaching to a running one
    #[arg(long)]
    launch: bool,

    /// Launch headless (with --launch)
    #[arg(long)]
    headless: bool,

    /// Rule set JSON file to install
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Pin interception to one target id instead of auto-following
    #[arg(long)]
    target: Option<String>,

    /// Concurrent paused-event workers
    #[arg(long, default_value_t = 32)]
    concurrency: usize,

    /// Response-body fetch cap in bytes
    #[arg(long, default_value_t = 2 << 20)]
    body_size_threshold: u64,

    /// Pending-approval queue and event channel capacity
    #[arg(long, default_value_t = 256)]
    pending_capacity: usize,

    /// Per-event processing deadline in milliseconds
    #[arg(long, default_value_t = 5000)]
    process_timeout_ms: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wiretap=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    if let Err(err) = run(args).await {
        eprintln!("wiretap: {err}");
        std::process::exit(exit_code(&err));
    }
}

async fn run(args: Args) -> Result<(), CoreError> {
    let browser = if args.launch {
        Some(
            launch(LaunchOptions {
                headless: args.headless,
                ..LaunchOptions::default()
            })
            .await?,
        )
    } else {
        None
    };

    let devtools_url = match (&browser, &args.devtools_url) {
        (Some(browser), _) => browser.devtools_url().to_string(),
        (None, Some(url)) => url.clone(),
        (None, None) => {
            return Err(CoreError::Config(
                "either --devtools-url or --launch is required".into(),
            ))
        }
    };

    let service = InterceptService::new();
    let session = service
        .start_session(SessionConfig {
            devtools_url,
            concurrency: args.concurrency,
            body_size_threshold: args.body_size_threshold,
            pending_capacity: args.pending_capacity,
            process_timeout_ms: args.process_timeout_ms,
        })
        .await?;

    if let Some(path) = &args.rules {
        let raw = std::fs::read_to_string(path)?;
        let set = RuleSet::from_json(&raw)
            .map_err(|err| CoreError::Config(format!("rule set {}: {err}", path.display())))?;
        service.load_rules(&session, &set).await?;
    }

    let attached = service
        .attach_target(&session, args.target.clone().map(TargetId))
        .await?;
    service.enable_interception(&session).await?;
    info!(target: "wiretap", session = %session, target_id = %attached, "intercepting");

    let mut events = service.subscribe_events(&session).await?;
    let mut pending = service.subscribe_pending(&session).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                match event {
                    Some(event) => {
                        if let Ok(line) = serde_json::to_string(&event) {
                            println!("{line}");
                        }
                    }
                    None => break,
                }
            }
            item = pending.recv() => {
                if let Some(item) = item {
                    if let Ok(line) = serde_json::to_string(&item) {
                        println!("{line}");
                    }
                }
            }
        }
    }

    service.stop_session(&session).await?;
    if let Some(browser) = browser {
        let _ = browser.stop(Duration::from_secs(3)).await;
    }
    Ok(())
}

/// Exit-code mapping for embedding in scripts and supervisors.
fn exit_code(err: &CoreError) -> i32 {
    match err {
        CoreError::Config(_) | CoreError::Spec(_) => 2,
        CoreError::NoTarget => 3,
        CoreError::AttachFailed(_) => 4,
        CoreError::Transport(_) | CoreError::Protocol { .. } | CoreError::CommandTimeout(_) => 5,
        _ => 1,
    }
}
