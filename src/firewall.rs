//! Firewall rules that feed HTTP/HTTPS traffic into the inspection queue.
//!
//! Rules are expressed as [`Rule`] values and applied through a
//! [`RuleBackend`]. The production backend shells out to `iptables`; tests
//! substitute a recording fake.

use std::fmt;
use std::process::Command;
use tracing::{debug, error, info, warn};

use crate::error::{GateError, RuleCommandError};

pub const HTTP_PORT: u16 = 80;
pub const HTTPS_PORT: u16 = 443;
pub const DNS_PORT: u16 = 53;

/// Chain all rules are installed into.
pub const CHAIN: &str = "OUTPUT";

/// One rule in the output chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    /// Send outbound TCP to `port` into inspection queue `queue_num`.
    QueueTcp { port: u16, queue_num: u16 },
    /// Accept outbound UDP to `port` unconditionally.
    AcceptUdp { port: u16 },
    /// Accept everything leaving through the loopback interface.
    AcceptLoopback,
}

impl Rule {
    /// Match and target arguments, without the chain operation.
    pub fn spec_args(&self) -> Vec<String> {
        match self {
            Rule::QueueTcp { port, queue_num } => vec![
                "-p".into(),
                "tcp".into(),
                "--dport".into(),
                port.to_string(),
                "-j".into(),
                "NFQUEUE".into(),
                "--queue-num".into(),
                queue_num.to_string(),
            ],
            Rule::AcceptUdp { port } => vec![
                "-p".into(),
                "udp".into(),
                "--dport".into(),
                port.to_string(),
                "-j".into(),
                "ACCEPT".into(),
            ],
            Rule::AcceptLoopback => vec![
                "-o".into(),
                "lo".into(),
                "-j".into(),
                "ACCEPT".into(),
            ],
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.spec_args().join(" "))
    }
}

/// The redirect rules, in installation order.
pub fn queue_rules(queue_num: u16) -> [Rule; 2] {
    [
        Rule::QueueTcp { port: HTTP_PORT, queue_num },
        Rule::QueueTcp { port: HTTPS_PORT, queue_num },
    ]
}

/// The full rule set installed on activation, in order.
pub fn rule_set(queue_num: u16) -> Vec<Rule> {
    let mut rules = queue_rules(queue_num).to_vec();
    rules.push(Rule::AcceptUdp { port: DNS_PORT });
    rules.push(Rule::AcceptLoopback);
    rules
}

/// Applies rules to the host firewall.
pub trait RuleBackend: Send {
    fn flush(&mut self, chain: &str) -> Result<(), RuleCommandError>;
    fn insert(&mut self, chain: &str, rule: &Rule) -> Result<(), RuleCommandError>;
    fn delete(&mut self, chain: &str, rule: &Rule) -> Result<(), RuleCommandError>;
}

/// Runs the `iptables` binary.
#[derive(Debug, Clone)]
pub struct IptablesBackend {
    program: String,
}

impl IptablesBackend {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Full argument vector for one operation (`-F`, `-I` or `-D`).
    pub fn args(op: &str, chain: &str, rule: Option<&Rule>) -> Vec<String> {
        let mut args = vec![op.to_string(), chain.to_string()];
        if let Some(rule) = rule {
            args.extend(rule.spec_args());
        }
        args
    }

    fn run(&self, args: Vec<String>) -> Result<(), RuleCommandError> {
        let command = format!("{} {}", self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|source| RuleCommandError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(RuleCommandError::Failed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!(%command, "rule command ok");
        Ok(())
    }
}

impl Default for IptablesBackend {
    fn default() -> Self {
        Self::new("iptables")
    }
}

impl RuleBackend for IptablesBackend {
    fn flush(&mut self, chain: &str) -> Result<(), RuleCommandError> {
        self.run(Self::args("-F", chain, None))
    }

    fn insert(&mut self, chain: &str, rule: &Rule) -> Result<(), RuleCommandError> {
        self.run(Self::args("-I", chain, Some(rule)))
    }

    fn delete(&mut self, chain: &str, rule: &Rule) -> Result<(), RuleCommandError> {
        self.run(Self::args("-D", chain, Some(rule)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallState {
    Inactive,
    Active,
}

/// Installs and removes the inspection rules, tracking whether they are live.
pub struct FirewallRuleManager<R> {
    backend: R,
    state: FirewallState,
    queue_num: Option<u16>,
}

impl<R: RuleBackend> FirewallRuleManager<R> {
    pub fn new(backend: R) -> Self {
        Self {
            backend,
            state: FirewallState::Inactive,
            queue_num: None,
        }
    }

    pub fn state(&self) -> FirewallState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == FirewallState::Active
    }

    /// Flush the chain and install the rule set. A no-op while active.
    ///
    /// On failure the redirect rules installed so far are removed again and
    /// the manager stays inactive.
    pub fn activate(&mut self, queue_num: u16) -> Result<(), GateError> {
        if self.is_active() {
            debug!("firewall rules already active");
            return Ok(());
        }

        if let Err(source) = self.backend.flush(CHAIN) {
            error!(chain = CHAIN, error = %source, "failed to flush chain");
            return Err(GateError::RuleInstall {
                rule: format!("flush {}", CHAIN),
                source,
            });
        }

        let mut installed = Vec::new();
        for rule in rule_set(queue_num) {
            match self.backend.insert(CHAIN, &rule) {
                Ok(()) => installed.push(rule),
                Err(source) => {
                    error!(%rule, error = %source, "failed to install rule, rolling back");
                    self.remove_queue_rules(&installed);
                    return Err(GateError::RuleInstall {
                        rule: rule.to_string(),
                        source,
                    });
                }
            }
        }

        self.state = FirewallState::Active;
        self.queue_num = Some(queue_num);
        info!(queue_num, "firewall rules installed");
        Ok(())
    }

    /// Remove the redirect rules. Failures are logged, never returned.
    pub fn deactivate(&mut self) {
        if let Some(queue_num) = self.queue_num.take() {
            self.remove_queue_rules(&queue_rules(queue_num));
            info!(queue_num, "firewall rules removed");
        }
        self.state = FirewallState::Inactive;
    }

    fn remove_queue_rules(&mut self, rules: &[Rule]) {
        for rule in rules {
            if !matches!(rule, Rule::QueueTcp { .. }) {
                continue;
            }
            if let Err(e) = self.backend.delete(CHAIN, rule) {
                warn!(%rule, error = %e, "failed to remove rule");
            }
        }
    }
}
