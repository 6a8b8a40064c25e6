//! Transparent-redirect rule lifecycle.
//!
//! Transparent mode works by redirecting the service's outbound TCP 80/443
//! traffic to the stub listener with netfilter REDIRECT rules. The rules
//! are process-global state, so they are managed as a guard: installed on
//! startup, removed in reverse order on every exit path (the guard's drop
//! runs during unwinding too). Removal is idempotent — removing a rule that
//! is no longer installed is ignored.

use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

/// Outbound ports redirected to the stub while the guard lives.
const REDIRECTED_PORTS: [u16; 2] = [80, 443];

/// Installed netfilter redirect rules, removed on drop.
#[derive(Debug)]
pub struct RedirectGuard {
    stub_port: u16,
    installed: Vec<u16>,
}

impl RedirectGuard {
    /// Redirects outbound TCP 80 and 443 to `stub_port`. On partial
    /// failure, already-installed rules are rolled back before the error
    /// returns.
    pub fn install(stub_port: u16) -> Result<Self> {
        let mut guard = Self {
            stub_port,
            installed: Vec::new(),
        };
        for port in REDIRECTED_PORTS {
            let status = iptables(&rule_args("-A", port, stub_port))
                .with_context(|| format!("iptables unavailable while redirecting port {port}"))?;
            if !status.success() {
                guard.remove_installed();
                bail!("iptables rejected redirect rule for port {port} (is NET_ADMIN enabled?)");
            }
            guard.installed.push(port);
        }
        info!(stub_port, "transparent redirect rules installed");
        Ok(guard)
    }

    fn remove_installed(&mut self) {
        while let Some(port) = self.installed.pop() {
            match iptables(&rule_args("-D", port, self.stub_port)) {
                Ok(status) if status.success() => {}
                Ok(_) | Err(_) => {
                    warn!(port, "transparent redirect rule removal failed");
                }
            }
        }
    }
}

impl Drop for RedirectGuard {
    fn drop(&mut self) {
        self.remove_installed();
        info!("transparent redirect rules removed");
    }
}

fn rule_args(action: &str, port: u16, stub_port: u16) -> Vec<String> {
    [
        "-t",
        "nat",
        action,
        "OUTPUT",
        "-p",
        "tcp",
        "--dport",
        &port.to_string(),
        "-j",
        "REDIRECT",
        "--to-ports",
        &stub_port.to_string(),
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

fn iptables(args: &[String]) -> std::io::Result<std::process::ExitStatus> {
    Command::new("iptables")
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_args_shape() {
        let add = rule_args("-A", 80, 19000);
        assert_eq!(
            add,
            vec![
                "-t", "nat", "-A", "OUTPUT", "-p", "tcp", "--dport", "80", "-j", "REDIRECT",
                "--to-ports", "19000",
            ]
            .into_iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
        );
        let del = rule_args("-D", 443, 19000);
        assert_eq!(del[2], "-D");
        assert_eq!(del[7], "443");
    }
}
