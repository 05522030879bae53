//! The dialer capability: open a byte stream to a remote address, cancellably.
//!
//! The engine only ever talks to `dyn Dialer`. Two implementations live here:
//!
//! - **[`DirectDialer`]**: plain TCP connect, no proxy.
//! - **[`SocksDialer`]**: SOCKS4/4a/5/5h via `tokio-socks`.
//!   Only `socks4` resolves the target on this host (`tokio::net::lookup_host`);
//!   every other scheme hands the hostname to the proxy.

use crate::error::{TunnelError, TunnelResult};
use crate::proxy::{ProxyScheme, ProxyUri};
use crate::stream::{set_nodelay, BoxedStream};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tokio_socks::{IntoTargetAddr, TargetAddr};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Network kind passed to a dialer. Only TCP is forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    #[default]
    Tcp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
        }
    }
}

pub type DialFuture<'a> = Pin<Box<dyn Future<Output = TunnelResult<BoxedStream>> + Send + 'a>>;

/// Opens connected byte streams to remote addresses.
pub trait Dialer: Send + Sync {
    /// Connect to `addr` (`host:port`). Must resolve to
    /// [`TunnelError::DialCancelled`] promptly once `cancel` fires.
    fn dial<'a>(
        &'a self,
        network: Network,
        addr: &'a str,
        cancel: &'a CancellationToken,
    ) -> DialFuture<'a>;
}

/// Build the dialer described by a proxy URI.
pub fn dialer_from_uri(uri: &ProxyUri) -> TunnelResult<Arc<dyn Dialer>> {
    Ok(Arc::new(SocksDialer::new(uri.clone())))
}

/// Connects straight to the target without a proxy.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectDialer;

impl Dialer for DirectDialer {
    fn dial<'a>(
        &'a self,
        network: Network,
        addr: &'a str,
        cancel: &'a CancellationToken,
    ) -> DialFuture<'a> {
        Box::pin(async move {
            debug!(%network, addr, "dialing directly");
            let stream = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TunnelError::DialCancelled(addr.to_string())),
                result = TcpStream::connect(addr) => result.map_err(|e| dial_error(addr, e))?,
            };
            set_nodelay(&stream, addr);
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

/// Connects through a SOCKS proxy.
#[derive(Debug, Clone)]
pub struct SocksDialer {
    proxy: ProxyUri,
}

impl SocksDialer {
    pub fn new(proxy: ProxyUri) -> Self {
        Self { proxy }
    }

    async fn connect(&self, addr: &str) -> TunnelResult<TcpStream> {
        let result = if self.proxy.scheme.resolves_remotely() {
            self.handshake(addr).await
        } else {
            let resolved = self.resolve_locally(addr).await?;
            self.handshake(resolved).await
        };
        result.map_err(|e| dial_error(addr, e))
    }

    async fn handshake<'t, T>(&self, target: T) -> Result<TcpStream, tokio_socks::Error>
    where
        T: IntoTargetAddr<'t>,
    {
        let proxy_addr = self.proxy.addr();
        let proxy_addr = proxy_addr.as_str();
        let user = self.proxy.username.as_deref();
        let password = self.proxy.password.as_deref();

        let stream = match (self.proxy.scheme, user, password) {
            (ProxyScheme::Socks4 | ProxyScheme::Socks4a, Some(user), _) => {
                Socks4Stream::connect_with_userid(proxy_addr, target, user)
                    .await?
                    .into_inner()
            }
            (ProxyScheme::Socks4 | ProxyScheme::Socks4a, None, _) => {
                Socks4Stream::connect(proxy_addr, target).await?.into_inner()
            }
            (ProxyScheme::Socks5 | ProxyScheme::Socks5h, Some(user), Some(password))
                if !password.is_empty() =>
            {
                Socks5Stream::connect_with_password(proxy_addr, target, user, password)
                    .await?
                    .into_inner()
            }
            (ProxyScheme::Socks5 | ProxyScheme::Socks5h, Some(user), _) => {
                let target = target.into_target_addr()?;
                socks5_connect_empty_password(proxy_addr, target, user).await?
            }
            (ProxyScheme::Socks5 | ProxyScheme::Socks5h, None, _) => {
                Socks5Stream::connect(proxy_addr, target).await?.into_inner()
            }
        };
        Ok(stream)
    }

    /// Resolve `addr` on this host to the IPv4 address SOCKS4 requires.
    async fn resolve_locally(&self, addr: &str) -> TunnelResult<SocketAddr> {
        let mut addrs = tokio::net::lookup_host(addr)
            .await
            .map_err(|e| dial_error(addr, e))?;
        let found = addrs.find(SocketAddr::is_ipv4);
        debug!(addr, resolved = ?found, "resolved target locally");
        found.ok_or_else(|| TunnelError::Dial {
            addr: addr.to_string(),
            reason: "no usable address for target".to_string(),
        })
    }
}

impl Dialer for SocksDialer {
    fn dial<'a>(
        &'a self,
        network: Network,
        addr: &'a str,
        cancel: &'a CancellationToken,
    ) -> DialFuture<'a> {
        Box::pin(async move {
            debug!(%network, addr, proxy = %self.proxy, "dialing through proxy");
            let stream = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TunnelError::DialCancelled(addr.to_string())),
                result = self.connect(addr) => result?,
            };
            set_nodelay(&stream, addr);
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

/// SOCKS5 CONNECT with username/password auth and an empty password.
///
/// RFC 1929 permits a zero-length password but `tokio-socks` refuses to send
/// one, so this case speaks the protocol directly.
async fn socks5_connect_empty_password(
    proxy_addr: &str,
    target: TargetAddr<'_>,
    user: &str,
) -> Result<TcpStream, tokio_socks::Error> {
    use tokio_socks::Error;

    let user = user.as_bytes();
    let user_len = u8::try_from(user.len())
        .map_err(|_| Error::InvalidAuthValues("username length should between 1 to 255"))?;

    let mut stream = TcpStream::connect(proxy_addr)
        .await
        .map_err(|_| Error::ProxyServerUnreachable)?;

    // Offer username/password only.
    stream.write_all(&[SOCKS5_VERSION, 1, AUTH_PASSWORD]).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    match reply {
        [SOCKS5_VERSION, AUTH_PASSWORD] => {}
        [SOCKS5_VERSION, 0xff] => return Err(Error::NoAcceptableAuthMethods),
        [SOCKS5_VERSION, _] => return Err(Error::UnknownAuthMethod),
        _ => return Err(Error::InvalidResponseVersion),
    }

    let mut auth = Vec::with_capacity(3 + user.len());
    auth.extend_from_slice(&[1, user_len]);
    auth.extend_from_slice(user);
    auth.push(0);
    stream.write_all(&auth).await?;
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0 {
        return Err(Error::PasswordAuthFailure(reply[1]));
    }

    let mut request = vec![SOCKS5_VERSION, 1, 0];
    let port = match target {
        TargetAddr::Ip(SocketAddr::V4(addr)) => {
            request.push(1);
            request.extend_from_slice(&addr.ip().octets());
            addr.port()
        }
        TargetAddr::Ip(SocketAddr::V6(addr)) => {
            request.push(4);
            request.extend_from_slice(&addr.ip().octets());
            addr.port()
        }
        TargetAddr::Domain(host, port) => {
            let len = u8::try_from(host.len())
                .map_err(|_| Error::InvalidTargetAddress("overlong domain"))?;
            request.push(3);
            request.push(len);
            request.extend_from_slice(host.as_bytes());
            port
        }
    };
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(Error::InvalidResponseVersion);
    }
    match head[1] {
        0 => {}
        1 => return Err(Error::GeneralSocksServerFailure),
        2 => return Err(Error::ConnectionNotAllowedByRuleset),
        3 => return Err(Error::NetworkUnreachable),
        4 => return Err(Error::HostUnreachable),
        5 => return Err(Error::ConnectionRefused),
        6 => return Err(Error::TtlExpired),
        7 => return Err(Error::CommandNotSupported),
        8 => return Err(Error::AddressTypeNotSupported),
        _ => return Err(Error::UnknownError),
    }
    // Skip the bound address.
    let bound_len = match head[3] {
        1 => 4 + 2,
        4 => 16 + 2,
        3 => stream.read_u8().await? as usize + 2,
        _ => return Err(Error::UnknownAddressType),
    };
    let mut bound = vec![0u8; bound_len];
    stream.read_exact(&mut bound).await?;
    Ok(stream)
}

const SOCKS5_VERSION: u8 = 5;
const AUTH_PASSWORD: u8 = 2;

fn dial_error(addr: &str, e: impl fmt::Display) -> TunnelError {
    TunnelError::Dial {
        addr: addr.to_string(),
        reason: e.to_string(),
    }
}
