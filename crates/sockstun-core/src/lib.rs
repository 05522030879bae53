//! sockstun-core: forwarding engine for sockstun.
//!
//! Exposes named local TCP listeners and forwards each accepted connection
//! through a proxy dialer to a fixed remote address, with an optional
//! absolute read/write deadline per connection.

pub mod dialer;
pub mod error;
pub mod handler;
pub mod proxy;
pub mod rules;
pub mod session;
pub mod stream;
pub mod tunnel;
pub mod worker;

// Re-export commonly used items at crate root.
pub use dialer::{dialer_from_uri, Dialer, DirectDialer, Network, SocksDialer};
pub use error::{TunnelError, TunnelResult};
pub use proxy::{ProxyScheme, ProxyUri};
pub use rules::{ForwardingRule, RuleTable};
pub use stream::{BoxedStream, ProxyStream};
pub use tunnel::Tunnel;
