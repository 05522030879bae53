//! Per-connection hand-off: dial the remote, apply the deadline, start pumps.

use crate::dialer::{Dialer, Network};
use crate::error::TunnelResult;
use crate::rules::ForwardingRule;
use crate::session::Session;
use crate::stream::{BoxedStream, DeadlineStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Everything a connection handler needs that is shared across the tunnel.
pub struct ForwardContext {
    pub network: Network,
    pub dialer: Arc<dyn Dialer>,
    /// `None` means no deadline is ever applied.
    pub rw_timeout: Option<Duration>,
}

impl ForwardContext {
    pub fn new(dialer: Arc<dyn Dialer>, rw_timeout: Option<Duration>) -> Self {
        Self {
            network: Network::Tcp,
            dialer,
            rw_timeout,
        }
    }
}

/// Forward one accepted local connection to the rule's remote address.
///
/// On success the two pumps are already running and the returned session
/// can be ignored. On dial failure the local connection is closed and the
/// error returned for logging; it never affects the rule.
pub async fn handle_connection(
    ctx: &ForwardContext,
    rule: Arc<ForwardingRule>,
    local: BoxedStream,
    cancel: &CancellationToken,
) -> TunnelResult<Arc<Session>> {
    let remote = match ctx.dialer.dial(ctx.network, &rule.remote_addr, cancel).await {
        Ok(remote) => remote,
        Err(e) => {
            close_local(local, &rule).await;
            return Err(e);
        }
    };

    let (local, remote): (BoxedStream, BoxedStream) = match ctx.rw_timeout {
        Some(timeout) => {
            let deadline = Instant::now() + timeout;
            (
                Box::new(DeadlineStream::new(local, deadline)),
                Box::new(DeadlineStream::new(remote, deadline)),
            )
        }
        None => (local, remote),
    };

    debug!(rule = %rule, "connection established");
    Ok(Session::start(rule, local, remote))
}

async fn close_local(mut local: BoxedStream, rule: &ForwardingRule) {
    if let Err(e) = local.shutdown().await {
        warn!(rule = %rule, error = %e, "failed to close local connection");
    }
}
