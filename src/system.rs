use std::fs;
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, error, info};

use crate::executor::ProcessRunner;

pub const CONSOLE_DEVICE: &str = "/dev/console";
pub const LOGIN_WINDOW_PLIST: &str = "/System/Library/LaunchDaemons/com.apple.loginwindow.plist";
const LAUNCHCTL_BIN: &str = "/bin/launchctl";
const ID_BIN: &str = "/usr/bin/id";

const NON_INTERACTIVE_USERS: [&str; 3] = ["", "root", "loginwindow"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub console_user: String,
    pub current_user: String,
    pub is_root: bool,
}

impl SessionIdentity {
    pub fn detect(runner: &dyn ProcessRunner, console_override: Option<&str>) -> Result<Self> {
        let current_uid = run_id(runner, &["-u"])?;
        let current_user = run_id(runner, &["-un"])?;
        let console_user = match console_override {
            Some(user) => user.to_string(),
            None => console_owner(runner, Path::new(CONSOLE_DEVICE)).unwrap_or_else(|err| {
                debug!(error = %format!("{err:#}"), "no console owner; assuming login window");
                "loginwindow".to_string()
            }),
        };
        let identity = Self {
            console_user,
            current_user,
            is_root: current_uid == "0",
        };
        debug!(
            console_user = %identity.console_user,
            current_user = %identity.current_user,
            is_root = identity.is_root,
            "session identity"
        );
        Ok(identity)
    }

    /// True when a real user, not the login window or root, owns the console.
    pub fn has_console_session(&self) -> bool {
        !NON_INTERACTIVE_USERS.contains(&self.console_user.as_str())
    }

    pub fn invoker_is_console_user(&self) -> bool {
        self.current_user == self.console_user
    }
}

fn console_owner(runner: &dyn ProcessRunner, device: &Path) -> Result<String> {
    let uid = fs::metadata(device)
        .with_context(|| format!("failed reading {}", device.display()))?
        .uid();
    run_id(runner, &["-nu", &uid.to_string()])
}

fn run_id(runner: &dyn ProcessRunner, args: &[&str]) -> Result<String> {
    let args = args.iter().map(|arg| arg.to_string()).collect::<Vec<_>>();
    let output = runner.run(ID_BIN, &args)?;
    if !output.success() {
        return Err(anyhow!("id {:?} failed: {}", args, output.stderr.trim()));
    }
    Ok(output.stdout.trim().to_string())
}

pub trait NetworkProbe: Send + Sync {
    fn is_reachable(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct TcpProbe {
    addr: String,
    connect_timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

impl NetworkProbe for TcpProbe {
    fn is_reachable(&self) -> bool {
        let Ok(addrs) = self.addr.to_socket_addrs() else {
            return false;
        };
        addrs
            .into_iter()
            .any(|addr| TcpStream::connect_timeout(&addr, self.connect_timeout).is_ok())
    }
}

/// Poll every `interval` until the network is reachable or `timeout`
/// elapses. A timeout too large to represent never expires.
pub fn wait_for_network(probe: &dyn NetworkProbe, timeout: Duration, interval: Duration) -> bool {
    let deadline = Instant::now().checked_add(timeout);
    info!(timeout_secs = timeout.as_secs(), "waiting for network");
    loop {
        if probe.is_reachable() {
            debug!("network is up");
            return true;
        }
        let pause = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                interval.min(deadline - now)
            }
            None => interval,
        };
        debug!("waiting...");
        thread::sleep(pause);
    }
    error!(
        timeout_secs = timeout.as_secs(),
        "no network connectivity detected before timeout"
    );
    false
}

pub trait LoginSurface: Send + Sync {
    fn set_enabled(&self, enabled: bool) -> Result<()>;
}

pub struct LaunchctlLoginSurface {
    runner: Arc<dyn ProcessRunner>,
}

impl LaunchctlLoginSurface {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }
}

impl LoginSurface for LaunchctlLoginSurface {
    fn set_enabled(&self, enabled: bool) -> Result<()> {
        let verb = if enabled { "load" } else { "unload" };
        debug!(verb, "updating loginwindow state");
        let output = self
            .runner
            .run(LAUNCHCTL_BIN, &[verb.to_string(), LOGIN_WINDOW_PLIST.to_string()])?;
        if !output.success() {
            return Err(anyhow!(
                "launchctl {verb} loginwindow failed: {}",
                output.stderr.trim()
            ));
        }
        Ok(())
    }
}
