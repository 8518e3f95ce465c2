//! Kernel-level blocking through an operator-supplied command.
//!
//! The command is invoked as `<cmd> ban <ip>` or `<cmd> unban <ip>`; it is
//! expected to wrap ipset/nft/iptables. Failures are logged and dropped.

use std::{net::IpAddr, time::Duration};

use tokio::{process::Command, task::JoinHandle, time::timeout};
use tracing::{debug, info, warn};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
pub struct Firewall {
    command: Option<String>,
}

impl Firewall {
    pub fn new(command: Option<String>) -> Self {
        let command = command.filter(|cmd| !cmd.trim().is_empty());
        if command.is_none() {
            info!("no firewall command configured, kernel blocking disabled");
        }
        Self { command }
    }

    pub fn is_enabled(&self) -> bool {
        self.command.is_some()
    }

    pub fn block(&self, ip: &str) -> Option<JoinHandle<()>> {
        self.spawn("ban", ip)
    }

    pub fn unblock(&self, ip: &str) -> Option<JoinHandle<()>> {
        self.spawn("unban", ip)
    }

    /// Only a parsed address is ever passed to the command.
    fn spawn(&self, verb: &'static str, ip: &str) -> Option<JoinHandle<()>> {
        let command = self.command.clone()?;
        let ip = match ip.parse::<IpAddr>() {
            Ok(addr) => addr.to_string(),
            Err(_) => {
                warn!(identity = %ip, verb, "refusing firewall command for a non-address identity");
                return None;
            }
        };
        Some(tokio::spawn(async move {
            let run = Command::new(&command)
                .arg(verb)
                .arg(&ip)
                .kill_on_drop(true)
                .status();
            match timeout(COMMAND_TIMEOUT, run).await {
                Ok(Ok(status)) if status.success() => {
                    debug!(ip = %ip, verb, "firewall command applied");
                }
                Ok(Ok(status)) => {
                    warn!(ip = %ip, verb, code = ?status.code(), "firewall command exited with failure");
                }
                Ok(Err(e)) => {
                    warn!(ip = %ip, verb, command = %command, "firewall command could not run: {}", e);
                }
                Err(_) => {
                    warn!(ip = %ip, verb, "firewall command timed out");
                }
            }
        }))
    }
}
