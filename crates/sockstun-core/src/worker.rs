//! Rule worker: one listening socket and its accept loop.
//!
//! ```text
//! Binding ──▶ Accepting ──▶ ShuttingDown ──▶ Stopped
//!    │
//!    └──────▶ Failed ─────────────────────▶ Stopped
//! ```
//!
//! Accepted connections are handed to a spawned handler and never joined,
//! so transfers outlive the accept loop. Shutdown stops new work only.

use crate::error::{TunnelError, TunnelResult};
use crate::handler::{handle_connection, ForwardContext};
use crate::rules::ForwardingRule;
use crate::stream::{set_nodelay, BoxedStream};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a [`RuleWorker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Binding,
    Accepting,
    ShuttingDown,
    Failed,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Binding => "binding",
            WorkerState::Accepting => "accepting",
            WorkerState::ShuttingDown => "shutting down",
            WorkerState::Failed => "failed",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A bound listener whose close is idempotent.
///
/// An empty slot means the listener was closed on purpose; the accept loop
/// checks the slot instead of interpreting accept errors.
struct ListenerSlot {
    rule: Arc<ForwardingRule>,
    listener: Option<TcpListener>,
}

impl ListenerSlot {
    async fn bind(rule: Arc<ForwardingRule>) -> TunnelResult<Self> {
        let listener = TcpListener::bind(&rule.local_addr)
            .await
            .map_err(|source| TunnelError::Bind {
                addr: rule.local_addr.clone(),
                source,
            })?;
        Ok(Self {
            rule,
            listener: Some(listener),
        })
    }

    fn get(&self) -> Option<&TcpListener> {
        self.listener.as_ref()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Close the socket. Returns `false` if it was already closed.
    fn close(&mut self) -> bool {
        match self.listener.take() {
            Some(listener) => {
                drop(listener);
                debug!(rule = %self.rule, "closed local socket");
                true
            }
            None => false,
        }
    }
}

impl Drop for ListenerSlot {
    fn drop(&mut self) {
        self.close();
    }
}

/// Runs the accept loop for one forwarding rule.
pub struct RuleWorker {
    rule: Arc<ForwardingRule>,
    ctx: Arc<ForwardContext>,
    cancel: CancellationToken,
    state: WorkerState,
}

impl RuleWorker {
    pub fn new(rule: Arc<ForwardingRule>, ctx: Arc<ForwardContext>, cancel: CancellationToken) -> Self {
        Self {
            rule,
            ctx,
            cancel,
            state: WorkerState::Binding,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn transition(&mut self, next: WorkerState) {
        debug!(rule = %self.rule, from = %self.state, to = %next, "worker state");
        self.state = next;
    }

    /// Bind, then accept until cancelled.
    ///
    /// Returns `Ok(())` when stopped by cancellation. A bind failure is
    /// returned as a fatal error; accept failures are logged and retried.
    pub async fn run(mut self) -> TunnelResult<()> {
        let mut slot = match ListenerSlot::bind(self.rule.clone()).await {
            Ok(slot) => slot,
            Err(e) => {
                self.transition(WorkerState::Failed);
                self.transition(WorkerState::Stopped);
                return Err(e);
            }
        };
        info!(
            rule = %self.rule,
            bound = ?slot.local_addr(),
            "enabling forwarding rule"
        );
        self.transition(WorkerState::Accepting);

        loop {
            let Some(listener) = slot.get() else {
                break;
            };
            let accepted = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = listener.accept() => Some(result),
            };

            match accepted {
                None => {
                    self.transition(WorkerState::ShuttingDown);
                    slot.close();
                }
                Some(Ok((stream, peer))) => {
                    debug!(rule = %self.rule, %peer, "accepted connection");
                    set_nodelay(&stream, &peer.to_string());
                    self.spawn_handler(Box::new(stream), peer);
                }
                Some(Err(e)) => {
                    warn!(rule = %self.rule, error = %e, "failed to accept on local socket");
                }
            }
        }

        slot.close();
        self.transition(WorkerState::Stopped);
        info!(rule = %self.rule, "forwarding rule stopped");
        Ok(())
    }

    fn spawn_handler(&self, stream: BoxedStream, peer: SocketAddr) {
        let ctx = self.ctx.clone();
        let rule = self.rule.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(&ctx, rule.clone(), stream, &cancel).await {
                warn!(rule = %rule, %peer, error = %e, "failed to handle connection");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::DirectDialer;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn ctx() -> Arc<ForwardContext> {
        Arc::new(ForwardContext::new(Arc::new(DirectDialer), None))
    }

    #[tokio::test]
    async fn listener_close_is_idempotent() {
        let rule = Arc::new(ForwardingRule::new("t", "127.0.0.1:0", "127.0.0.1:1"));
        let mut slot = ListenerSlot::bind(rule).await.unwrap();
        assert!(slot.local_addr().is_some());
        assert!(slot.close());
        assert!(!slot.close());
        assert!(slot.get().is_none());
        assert!(slot.local_addr().is_none());
        // Drop runs close a third time.
    }

    #[tokio::test]
    async fn bind_failure_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let rule = Arc::new(ForwardingRule::new("dup", &addr, "127.0.0.1:1"));

        let worker = RuleWorker::new(rule, ctx(), CancellationToken::new());
        assert_eq!(worker.state(), WorkerState::Binding);
        let err = worker.run().await.unwrap_err();
        assert!(matches!(err, TunnelError::Bind { addr: a, .. } if a == addr));
    }

    #[tokio::test]
    async fn cancellation_stops_accept_loop() {
        let rule = Arc::new(ForwardingRule::new("idle", "127.0.0.1:0", "127.0.0.1:1"));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(RuleWorker::new(rule, ctx(), cancel.clone()).run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn forwards_accepted_connection_and_survives_shutdown() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap().to_string();

        let local_addr = {
            let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap().to_string()
        };
        let rule = Arc::new(ForwardingRule::new("echo", &local_addr, &upstream_addr));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(RuleWorker::new(rule, ctx(), cancel.clone()).run());

        let mut client = loop {
            match TcpStream::connect(&local_addr).await {
                Ok(c) => break c,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };
        let (mut server, _) = upstream.accept().await.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        cancel.cancel();
        worker.await.unwrap().unwrap();

        // The in-flight connection keeps working after the rule stopped.
        server.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // But no new connections are accepted.
        assert!(TcpStream::connect(&local_addr).await.is_err());
    }
}
