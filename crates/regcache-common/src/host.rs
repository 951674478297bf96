//! Local host identity
//!
//! The name a process advertises for itself: `$HOSTNAME` when set (as in
//! most container runtimes), otherwise the machine's address in the
//! private `10.0.0.0/8` range.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use tracing::debug;

pub const ENV_HOSTNAME: &str = "HOSTNAME";

/// Returns the advertised host, or `None` if neither source yields one.
pub fn local_host() -> Option<String> {
    resolve_host(|key| std::env::var(key).ok(), inner_ipv4)
}

fn resolve_host<E, I>(env: E, inner: I) -> Option<String>
where
    E: Fn(&str) -> Option<String>,
    I: FnOnce() -> Option<Ipv4Addr>,
{
    env(ENV_HOSTNAME)
        .map(|host| host.trim().to_string())
        .filter(|host| !host.is_empty())
        .or_else(|| inner().map(|ip| ip.to_string()))
}

/// True for non-loopback addresses in `10.0.0.0/8`.
pub fn is_inner(ip: Ipv4Addr) -> bool {
    !ip.is_loopback() && ip.octets()[0] == 10
}

/// Source address the kernel routes `10.0.0.0/8` traffic from.
///
/// Connecting a UDP socket only selects a route; nothing is sent.
fn inner_ipv4() -> Option<Ipv4Addr> {
    let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)) {
        Ok(socket) => socket,
        Err(e) => {
            debug!("Cannot open route socket: {}", e);
            return None;
        }
    };
    if let Err(e) = socket.connect((Ipv4Addr::new(10, 255, 255, 254), 9)) {
        debug!("No route into 10.0.0.0/8: {}", e);
        return None;
    }
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if is_inner(ip) => Some(ip),
        _ => None,
    }
}
