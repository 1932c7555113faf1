//! Browser Launcher
//!
//! Helper collaborator that produces a remote-debugging base URL: spawns a
//! Chromium-family binary with a debugging port and a dedicated profile
//! directory, then polls the endpoint until it answers.

use std::path::PathBuf;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info};
use which::which;

use crate::cdp::Discovery;
use crate::error::{CoreError, CoreResult};

const READY_BUDGET: Duration = Duration::from_secs(10);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Clone, Debug, Default)]
pub struct LaunchOptions {
    /// Explicit browser binary; otherwise looked up on PATH.
    pub executable: Option<PathBuf>,
    /// Profile directory; a temp directory is used when unset.
    pub user_data_dir: Option<PathBuf>,
    /// Debugging port; 0 picks a free one.
    pub remote_debugging_port: u16,
    pub headless: bool,
    /// Extra command-line arguments appended verbatim.
    pub args: Vec<String>,
}

/// Handle for a launched browser process.
pub struct BrowserHandle {
    child: Child,
    devtools_url: String,
    port: u16,
}

impl BrowserHandle {
    pub fn devtools_url(&self) -> &str {
        &self.devtools_url
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Kill the browser, waiting up to `timeout` for the process to go.
    pub async fn stop(mut self, timeout: Duration) -> CoreResult<()> {
        self.child.start_kill().map_err(CoreError::Io)?;
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(target: "wiretap::browser", %status, "browser exited");
                Ok(())
            }
            Ok(Err(err)) => Err(CoreError::Io(err)),
            Err(_) => Err(CoreError::Launch("browser stop timed out".into())),
        }
    }
}

/// Launch a browser and wait for its DevTools endpoint to become ready.
pub async fn launch(opts: LaunchOptions) -> CoreResult<BrowserHandle> {
    let executable = match &opts.executable {
        Some(path) => path.clone(),
        None => find_executable()
            .ok_or_else(|| CoreError::Launch("no chromium-family browser found on PATH".into()))?,
    };

    let port = if opts.remote_debugging_port == 0 {
        pick_free_port()?
    } else {
        opts.remote_debugging_port
    };

    let user_data_dir = match &opts.user_data_dir {
        Some(dir) => dir.clone(),
        None => std::env::temp_dir().join("wiretap-browser"),
    };
    std::fs::create_dir_all(&user_data_dir).map_err(CoreError::Io)?;

    let mut command = Command::new(&executable);
    command
        .arg(format!("--remote-debugging-port={port}"))
        .arg(format!("--user-data-dir={}", user_data_dir.display()))
        .arg("--no-first-run")
        .arg("--no-default-browser-check");
    if opts.headless {
        command.arg("--headless=new").arg("--disable-gpu");
    }
    for arg in &opts.args {
        command.arg(arg);
    }
    command.kill_on_drop(true);

    let child = command
        .spawn()
        .map_err(|err| CoreError::Launch(format!("{}: {err}", executable.display())))?;

    let devtools_url = format!("http://127.0.0.1:{port}");
    info!(target: "wiretap::browser", url = %devtools_url, exe = %executable.display(),
          "browser launched");

    let mut handle = BrowserHandle {
        child,
        devtools_url: devtools_url.clone(),
        port,
    };

    if let Err(err) = wait_ready(&devtools_url).await {
        let _ = handle.child.start_kill();
        return Err(err);
    }
    Ok(handle)
}

const EXECUTABLE_CANDIDATES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
    "chrome",
    "msedge",
];

fn find_executable() -> Option<PathBuf> {
    for candidate in EXECUTABLE_CANDIDATES {
        if let Ok(path) = which(candidate) {
            return Some(path);
        }
    }
    // Common macOS install location, not on PATH by default.
    let mac = PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
    mac.exists().then_some(mac)
}

fn pick_free_port() -> CoreResult<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").map_err(CoreError::Io)?;
    let port = listener.local_addr().map_err(CoreError::Io)?.port();
    Ok(port)
}

async fn wait_ready(devtools_url: &str) -> CoreResult<()> {
    let discovery = Discovery::new(devtools_url)?;
    let deadline = tokio::time::Instant::now() + READY_BUDGET;
    loop {
        if discovery.probe().await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(CoreError::Launch("devtools endpoint not ready".into()));
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}
