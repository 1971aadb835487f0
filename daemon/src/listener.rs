//! Telemetry listener bring-up.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener};

use log::*;
use socket2::{Domain, Protocol, Socket, Type};

use telemd_common::config::Config;

use crate::error::Error;

/// Open the listening socket per configuration.
///
/// With no explicit bind address we prefer a dual-stack v6 socket, v6-only
/// off, and fall back to v4 when v6 socket creation fails. The backlog is
/// kept at one: the reactor drains pending connections immediately.
pub fn bind(cfg: &Config) -> Result<TcpListener, Error> {
    let port = cfg.port();

    let (socket, addr) = match cfg.bind_ip()? {
        Some(ip) => {
            let domain = match ip {
                IpAddr::V4(_) => Domain::IPV4,
                IpAddr::V6(_) => Domain::IPV6,
            };
            let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
            (socket, SocketAddr::new(ip, port))
        }
        None => match Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP)) {
            Ok(socket) => {
                if let Err(e) = socket.set_only_v6(false) {
                    warn!("setsockopt IPV6_V6ONLY failed: {}", e);
                }
                (socket, SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port))
            }
            Err(_) => {
                let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
                (socket, SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port))
            }
        },
    };

    if let Some(prec) = cfg.ipprec() {
        // Precedence sits in the top three bits of the TOS octet.
        let tos = u32::from(prec) << 5;
        if let Err(e) = socket.set_tos(tos) {
            warn!("setsockopt IP_TOS failed: {}", e);
        }
    }

    if let Err(e) = socket.set_reuse_address(true) {
        warn!("setsockopt SO_REUSEADDR failed: {}", e);
    }

    if let Some(target) = cfg.pipe_size() {
        probe_rcvbuf(&socket, target);
    }

    if let Err(e) = socket.bind(&addr.into()) {
        error!("bind() to ip={} port={}/tcp failed: {}", addr.ip(), port, e);
        return Err(e.into());
    }
    socket.listen(1)?;

    Ok(socket.into())
}

/// Probe the achievable receive-buffer size: set the target, read back
/// what the kernel granted, then restore the original setting. The result
/// is informational only.
fn probe_rcvbuf(socket: &Socket, target: usize) {
    let saved = socket.recv_buffer_size().unwrap_or(0);
    if let Err(e) = socket.set_recv_buffer_size(target) {
        warn!("setsockopt SO_RCVBUF failed: {}", e);
    }
    let obtained = socket.recv_buffer_size().unwrap_or(0);
    socket.set_recv_buffer_size(saved).ok();
    info!("telemetry_pipe_size: obtained={} target={}", obtained, target);
}

/// Normalize an IPv4-mapped IPv6 source address to plain IPv4, so ACL
/// checks and peer address strings see the v4 form.
pub fn normalize_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port()),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemd_common::config::Config;

    #[test]
    fn binds_explicit_loopback_with_ephemeral_port() {
        let cfg = Config {
            telemetry_ip: Some("127.0.0.1".into()),
            telemetry_port: Some(0),
            ..Config::default()
        };
        let listener = bind(&cfg).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn mapped_v6_addresses_normalize_to_v4() {
        let mapped: SocketAddr = "[::ffff:10.0.0.1]:3200".parse().unwrap();
        let normalized = normalize_addr(mapped);
        assert_eq!(normalized.ip(), "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(normalized.port(), 3200);

        let native: SocketAddr = "[2001:db8::1]:3200".parse().unwrap();
        assert_eq!(normalize_addr(native), native);
    }
}
