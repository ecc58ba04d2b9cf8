//! Facade tying the firewall rules, the packet thread and the filter state
//! together.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::allow_list::AllowSet;
use crate::config::GateConfig;
use crate::conntrack::FilterState;
use crate::error::GateError;
use crate::firewall::{FirewallRuleManager, IptablesBackend, RuleBackend};
use crate::inspect::{lock, PacketInspector};
use crate::queue::{NfqBinder, PacketQueueListener, QueueBinder};

/// Fails unless the process runs with an effective uid of root.
pub fn verify_privilege() -> Result<(), GateError> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    check_euid(euid)
}

fn check_euid(euid: u32) -> Result<(), GateError> {
    if euid == 0 {
        Ok(())
    } else {
        Err(GateError::Privilege { euid })
    }
}

/// Blocks outbound HTTP/HTTPS except to an allow-list of domains.
///
/// # Usage
///
/// ```rust,ignore
/// let mut net = NetworkManager::new(GateConfig::default())?;
/// net.block_all_except_allowed(["github.com", "docs.rs"])?;
/// // ...
/// net.unblock_all();
/// ```
pub struct NetworkManager<R = IptablesBackend, B = NfqBinder>
where
    R: RuleBackend + 'static,
    B: QueueBinder + Clone,
{
    config: GateConfig,
    filter: Arc<Mutex<FilterState>>,
    firewall: Arc<Mutex<FirewallRuleManager<R>>>,
    binder: B,
    listener: Option<PacketQueueListener>,
}

impl NetworkManager {
    /// Production manager backed by `iptables` and NFQUEUE. Requires root.
    pub fn new(config: GateConfig) -> Result<Self, GateError> {
        verify_privilege()?;
        let rules = IptablesBackend::new(config.iptables_bin.clone());
        Ok(Self::with_backends(config, rules, NfqBinder))
    }
}

impl<R, B> NetworkManager<R, B>
where
    R: RuleBackend + 'static,
    B: QueueBinder + Clone,
{
    pub fn with_backends(config: GateConfig, rules: R, binder: B) -> Self {
        let filter = FilterState::new(config.tracking_policy());
        Self {
            config,
            filter: Arc::new(Mutex::new(filter)),
            firewall: Arc::new(Mutex::new(FirewallRuleManager::new(rules))),
            binder,
            listener: None,
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Whether the inspection rules are currently installed.
    pub fn is_blocking(&self) -> bool {
        lock(&self.firewall).is_active()
    }

    pub fn get_allowed_domains(&self) -> BTreeSet<String> {
        lock(&self.filter).allow_set().to_set()
    }

    /// Replace the allow-list and make sure blocking is active.
    ///
    /// Connection state is cleared afterwards, so only connections seen from
    /// now on are judged against the new list.
    pub fn block_all_except_allowed<I, S>(&mut self, domains: I) -> Result<(), GateError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allow = AllowSet::from_domains(domains);
        let count = allow.len();
        lock(&self.filter).set_allow_set(allow);

        if self.is_blocking() {
            info!(domains = count, "updated allowed domains");
        } else {
            self.enable()?;
            info!(domains = count, "blocking enabled");
        }

        lock(&self.filter).clear();
        Ok(())
    }

    /// Stop inspecting, remove the rules and forget all connections.
    pub fn unblock_all(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.stop(self.config.join_timeout());
        }
        teardown(&self.firewall, &self.filter);
        info!("all blocking rules removed");
    }

    fn enable(&mut self) -> Result<(), GateError> {
        // A listener left over from a failed run has left its loop. Its
        // teardown must finish before new rules go in, or it removes them.
        if let Some(stale) = self.listener.take() {
            stale.join();
        }

        let queue_num = self.config.queue_num;
        lock(&self.firewall).activate(queue_num)?;

        let firewall = self.firewall.clone();
        let filter = self.filter.clone();
        let on_failure = move || {
            warn!("packet inspection died, removing rules");
            teardown(&firewall, &filter);
        };

        let inspector = PacketInspector::new(self.filter.clone());
        match PacketQueueListener::start(self.binder.clone(), queue_num, inspector, on_failure) {
            Ok(listener) => {
                self.listener = Some(listener);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "could not bind inspection queue, unblocking");
                teardown(&self.firewall, &self.filter);
                Err(e)
            }
        }
    }
}

impl<R, B> Drop for NetworkManager<R, B>
where
    R: RuleBackend + 'static,
    B: QueueBinder + Clone,
{
    fn drop(&mut self) {
        if self.listener.is_some() || self.is_blocking() {
            self.unblock_all();
        }
    }
}

fn teardown<R: RuleBackend>(
    firewall: &Mutex<FirewallRuleManager<R>>,
    filter: &Mutex<FilterState>,
) {
    lock(firewall).deactivate();
    lock(filter).clear();
}
