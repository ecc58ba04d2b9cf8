//! Outbound HTTP/HTTPS gatekeeper for a single Linux host.
//!
//! TCP traffic to ports 80 and 443 is redirected into an NFQUEUE. Each
//! connection is held in a short grace period until its destination hostname
//! is read from the HTTP `Host` header or the TLS SNI extension, then allowed
//! or dropped for good depending on the allow-list.

pub mod allow_list;
pub mod config;
pub mod conntrack;
pub mod error;
pub mod extract;
pub mod firewall;
pub mod inspect;
pub mod manager;
pub mod packet;
pub mod queue;

pub use allow_list::{is_allowed, normalize_domain, AllowSet};
pub use config::GateConfig;
pub use error::{ConfigError, GateError, RuleCommandError};
pub use extract::{extract_http_host, extract_tls_sni};
pub use firewall::FirewallState;
pub use manager::{verify_privilege, NetworkManager};
pub use queue::Verdict;
