//! The engine: a rule table, a dialer, and one worker per rule.
//!
//! All workers share a single cancellation scope derived from the caller's
//! token. The first worker to fail cancels the scope, so one broken rule
//! takes the whole tunnel down; [`Tunnel::run`] then waits for every worker
//! and reports that first failure.

use crate::dialer::{dialer_from_uri, Dialer};
use crate::error::{TunnelError, TunnelResult};
use crate::handler::ForwardContext;
use crate::proxy::ProxyUri;
use crate::rules::RuleTable;
use crate::worker::RuleWorker;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Forwards every registered rule through one dialer.
pub struct Tunnel {
    ctx: Arc<ForwardContext>,
    rules: RuleTable,
}

impl Tunnel {
    /// Build a tunnel that dials through the proxy at `proxy_uri`.
    ///
    /// A zero `rw_timeout` disables the per-connection deadline.
    ///
    /// # Errors
    ///
    /// Fails if the URI cannot be parsed or names an unsupported scheme, or
    /// if the dialer cannot be built from it. No socket is opened here.
    pub fn new(proxy_uri: &str, rw_timeout: Duration) -> TunnelResult<Self> {
        let uri = ProxyUri::parse(proxy_uri)?;
        let dialer = dialer_from_uri(&uri)?;
        info!(proxy = %uri, ?rw_timeout, "created tunnel");
        Ok(Self::with_dialer(dialer, rw_timeout))
    }

    /// Build a tunnel around any [`Dialer`].
    pub fn with_dialer(dialer: Arc<dyn Dialer>, rw_timeout: Duration) -> Self {
        let rw_timeout = (!rw_timeout.is_zero()).then_some(rw_timeout);
        Self {
            ctx: Arc::new(ForwardContext::new(dialer, rw_timeout)),
            rules: RuleTable::new(),
        }
    }

    /// Register a forwarding rule. Rules added after [`Tunnel::run`] has
    /// taken its snapshot are not picked up.
    pub fn add(&self, name: &str, local_addr: &str, remote_addr: &str) {
        self.rules.add(name, local_addr, remote_addr);
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    pub fn rw_timeout(&self) -> Option<Duration> {
        self.ctx.rw_timeout
    }

    /// Run every rule until `cancel` fires or a rule fails.
    ///
    /// Returns `Ok(())` if all workers stopped because of cancellation,
    /// otherwise the first fatal error. Connections already being forwarded
    /// are not waited for.
    pub async fn run(&self, cancel: CancellationToken) -> TunnelResult<()> {
        let scope = cancel.child_token();
        let mut workers = JoinSet::new();

        for rule in self.rules.snapshot() {
            let worker = RuleWorker::new(rule, self.ctx.clone(), scope.clone());
            workers.spawn(worker.run());
        }
        debug!(workers = workers.len(), "started forwarding rules");

        let mut first_error: Option<TunnelError> = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(TunnelError::Worker(e.to_string())));
            let Err(e) = result else {
                continue;
            };
            if first_error.is_some() {
                debug!(error = %e, "additional rule failure");
                continue;
            }
            error!(error = %e, "forwarding rule failed, shutting down all rules");
            scope.cancel();
            first_error = Some(e);
        }

        // Release the child token from the caller's token.
        scope.cancel();
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
