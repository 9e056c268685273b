//! CDP reachability probing and managed browser processes.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::{SurfError, SurfResult};

pub const CHROME_PATH_ENV: &str = "SURFWRIGHT_CHROME_PATH";

const CHROME_NAMES: [&str; 5] = [
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "chrome",
];

#[cfg(target_os = "macos")]
const CHROME_FALLBACKS: [&str; 2] = [
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
];
#[cfg(not(target_os = "macos"))]
const CHROME_FALLBACKS: [&str; 0] = [];

/// Answers "is there a DevTools endpoint at this origin right now".
pub trait CdpProbe {
    fn reachable(&self, cdp_origin: &str) -> bool;
}

/// `GET <origin>/json/version` with a hard timeout.
#[derive(Debug, Clone)]
pub struct HttpCdpProbe {
    timeout: Duration,
}

impl HttpCdpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CdpProbe for HttpCdpProbe {
    fn reachable(&self, cdp_origin: &str) -> bool {
        let agent = ureq::AgentBuilder::new().timeout(self.timeout).build();
        let url = format!("{}/json/version", cdp_origin.trim_end_matches('/'));
        match agent.get(&url).call() {
            Ok(resp) => resp.status() == 200,
            Err(err) => {
                tracing::debug!(%url, "cdp probe failed: {err}");
                false
            }
        }
    }
}

/// Accepts `http(s)://host:port[/...]`, `ws(s)://host:port/devtools/...` or bare `host:port`
/// and returns `http(s)://host:port`.
pub fn normalize_cdp_origin(raw: &str) -> SurfResult<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(SurfError::query("cdp origin must not be empty"));
    }
    let (scheme, rest) = match raw.split_once("://") {
        Some(("http" | "ws", rest)) => ("http", rest),
        Some(("https" | "wss", rest)) => ("https", rest),
        Some((other, _)) => {
            return Err(SurfError::query(format!(
                "unsupported cdp origin scheme '{other}' in {raw:?}; expected http, https, ws or wss"
            )));
        }
        None => ("http", raw),
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = match authority.rsplit_once(':') {
        Some((host, port)) => {
            if port.parse::<u16>().is_err() {
                return Err(SurfError::query(format!("invalid port in cdp origin {raw:?}")));
            }
            host
        }
        None => authority,
    };
    if host.is_empty() {
        return Err(SurfError::query(format!("cdp origin {raw:?} has no host")));
    }
    Ok(format!("{scheme}://{authority}"))
}

/// Polls until the origin answers or `timeout` passes.
pub fn wait_until_reachable(
    probe: &dyn CdpProbe,
    cdp_origin: &str,
    timeout: Duration,
    poll: Duration,
) -> SurfResult<()> {
    let started = Instant::now();
    loop {
        if probe.reachable(cdp_origin) {
            return Ok(());
        }
        if started.elapsed() >= timeout {
            return Err(SurfError::BrowserStartTimeout {
                cdp_origin: cdp_origin.to_string(),
                waited: started.elapsed(),
            });
        }
        std::thread::sleep(poll);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub debug_port: u16,
    pub user_data_dir: PathBuf,
    pub headless: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchedBrowser {
    pub pid: u32,
}

pub trait BrowserLauncher {
    fn launch(&self, request: &LaunchRequest) -> SurfResult<LaunchedBrowser>;
}

#[derive(Debug, Clone, Default)]
pub struct ChromeLauncher {
    pub chrome_path: Option<PathBuf>,
}

impl BrowserLauncher for ChromeLauncher {
    fn launch(&self, request: &LaunchRequest) -> SurfResult<LaunchedBrowser> {
        let binary = find_chrome_binary(self.chrome_path.as_deref())?;
        std::fs::create_dir_all(&request.user_data_dir)?;
        let mut cmd = Command::new(&binary);
        cmd.arg(format!("--remote-debugging-port={}", request.debug_port))
            .arg(format!("--user-data-dir={}", request.user_data_dir.display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        if request.headless {
            cmd.arg("--headless=new");
        }
        cmd.arg("about:blank")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let child = cmd.spawn().map_err(|e| {
            SurfError::BrowserStartFailed(format!("failed to start {}: {e}", binary.display()))
        })?;
        tracing::info!(pid = child.id(), port = request.debug_port, "launched managed browser");
        Ok(LaunchedBrowser { pid: child.id() })
    }
}

/// Configured path, then `SURFWRIGHT_CHROME_PATH`, then well-known names on `PATH`.
pub fn find_chrome_binary(configured: Option<&Path>) -> SurfResult<PathBuf> {
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(SurfError::BrowserNotFound(format!(
            "configured chrome_path {} does not exist",
            path.display()
        )));
    }
    if let Ok(raw) = std::env::var(CHROME_PATH_ENV)
        && !raw.trim().is_empty()
    {
        let path = PathBuf::from(raw.trim());
        if path.is_file() {
            return Ok(path);
        }
        return Err(SurfError::BrowserNotFound(format!(
            "{CHROME_PATH_ENV}={} does not exist",
            path.display()
        )));
    }
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            for name in CHROME_NAMES {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
        }
    }
    for fallback in CHROME_FALLBACKS {
        let candidate = PathBuf::from(fallback);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(SurfError::BrowserNotFound(format!(
        "no Chrome/Chromium binary found; set chrome_path or {CHROME_PATH_ENV}"
    )))
}

pub fn pick_free_port() -> SurfResult<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Best-effort SIGTERM. Returns whether a signal was delivered; a pid that is already
/// gone is not an error.
#[cfg(unix)]
pub fn terminate_process(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(err) => {
            tracing::warn!(pid, "failed to signal browser process: {err}");
            false
        }
    }
}

#[cfg(not(unix))]
pub fn terminate_process(pid: u32) -> bool {
    let status = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    matches!(status, Ok(s) if s.success())
}
