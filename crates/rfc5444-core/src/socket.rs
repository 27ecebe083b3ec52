//! Managed UDP transport under an RFC 5444 interface.
//!
//! Each engine interface owns one [`PacketTransport`]. The production
//! implementation, [`UdpTransport`], keeps one socket per address family,
//! joins the configured multicast groups, and runs a receive thread per
//! socket that pushes ACL-filtered datagrams into a crossbeam channel
//! drained by the host event loop. Reconfiguration tears the sockets down
//! and rebinds; receive threads notice the generation bump and exit.

use anyhow::{bail, Context, Result};
use crossbeam_channel::Sender;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};
use std::sync::Arc;
use std::time::Duration;

use crate::acl::Acl;
use crate::pool::{BufferPool, PooledBuf};
use crate::wire::MAX_PACKET_SIZE;

/// Address family selector for socket activity checks and multicast sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

/// Socket configuration carried by an RFC 5444 interface.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    pub acl: Acl,
    pub bindto_v4: Ipv4Addr,
    pub bindto_v6: Ipv6Addr,
    pub multicast_v4: Option<Ipv4Addr>,
    pub multicast_v6: Option<Ipv6Addr>,
    /// Local bind port for unicast traffic. 0 means "not yet configured".
    pub port: u16,
    /// Destination port for multicast sends. 0 means "inherit".
    pub multicast_port: u16,
    /// Kernel device to bind to. Empty string means not device-bound.
    pub interface: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            acl: Acl::default(),
            bindto_v4: Ipv4Addr::UNSPECIFIED,
            bindto_v6: Ipv6Addr::UNSPECIFIED,
            multicast_v4: None,
            multicast_v6: None,
            port: 0,
            multicast_port: 0,
            interface: String::new(),
        }
    }
}

/// A datagram received by a transport, tagged with its owning interface.
pub struct InboundDatagram {
    pub protocol: String,
    pub interface: String,
    pub from: SocketAddr,
    pub payload: PooledBuf,
}

/// The managed-socket surface consumed by the engine.
pub trait PacketTransport {
    /// Bind sockets according to `config`. Returns true if the local socket
    /// addresses changed compared to the previous configuration.
    fn apply(&mut self, config: &TransportConfig) -> Result<bool>;

    /// Tear down the sockets. `purge` drops pending outbound state instead
    /// of letting it drain.
    fn close(&mut self, purge: bool);

    /// Whether a send for this family has a socket to go out on.
    fn is_active(&self, family: Family) -> bool;

    fn send_unicast(&mut self, dst: SocketAddr, data: &[u8]) -> Result<()>;

    /// Send to the configured multicast group of `family`. The destination
    /// address is implied by the applied configuration.
    fn send_multicast(&mut self, family: Family, data: &[u8]) -> Result<()>;

    /// Kernel index of the bound device, 0 when not device-bound.
    fn if_index(&self) -> u32;
}

/// Creates one transport per engine interface.
pub trait TransportFactory {
    fn create(&mut self, protocol: &str, interface: &str) -> Box<dyn PacketTransport>;
}

impl<F> TransportFactory for F
where
    F: FnMut(&str, &str) -> Box<dyn PacketTransport>,
{
    fn create(&mut self, protocol: &str, interface: &str) -> Box<dyn PacketTransport> {
        (self)(protocol, interface)
    }
}

// ---------------------------------------------------------------------------
// UdpTransport
// ---------------------------------------------------------------------------

/// Poll interval for receive threads to notice a shutdown or rebind.
const RECV_TIMEOUT: Duration = Duration::from_millis(250);

struct BoundSocket {
    socket: Arc<Socket>,
    multicast_dst: Option<SocketAddr>,
}

pub struct UdpTransport {
    protocol: String,
    interface: String,
    pool: BufferPool,
    tx: Sender<InboundDatagram>,
    v4: Option<BoundSocket>,
    v6: Option<BoundSocket>,
    if_index: u32,
    /// Bumped on every apply/close so stale receive threads exit.
    generation: Arc<AtomicU64>,
    applied: Option<TransportConfig>,
}

impl UdpTransport {
    pub fn new(
        protocol: &str,
        interface: &str,
        pool: BufferPool,
        tx: Sender<InboundDatagram>,
    ) -> Self {
        Self {
            protocol: protocol.to_string(),
            interface: interface.to_string(),
            pool,
            tx,
            v4: None,
            v6: None,
            if_index: 0,
            generation: Arc::new(AtomicU64::new(0)),
            applied: None,
        }
    }

    fn bind_v4(&self, config: &TransportConfig) -> Result<BoundSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProtocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;

        let bind_addr = SocketAddrV4::new(config.bindto_v4, config.port);
        socket
            .bind(&bind_addr.into())
            .with_context(|| format!("failed to bind v4 socket to {bind_addr}"))?;

        let mut multicast_dst = None;
        if let Some(group) = config.multicast_v4 {
            let iface_addr = if config.interface.is_empty() {
                Ipv4Addr::UNSPECIFIED
            } else {
                resolve_interface_v4(&config.interface)?
            };
            socket
                .join_multicast_v4(&group, &iface_addr)
                .with_context(|| format!("failed to join multicast group {group}"))?;
            socket.set_multicast_if_v4(&iface_addr)?;
            socket.set_multicast_loop_v4(false)?;
            multicast_dst = Some(SocketAddr::V4(SocketAddrV4::new(
                group,
                config.multicast_port,
            )));
        }

        Ok(BoundSocket { socket: Arc::new(socket), multicast_dst })
    }

    fn bind_v6(&self, config: &TransportConfig, if_index: u32) -> Result<BoundSocket> {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(SockProtocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_only_v6(true)?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;

        // a link-local bind address needs the device's own address plus its
        // scope id
        let bind_ip = if is_linklocal_v6(config.bindto_v6) && !config.interface.is_empty() {
            resolve_interface_linklocal_v6(&config.interface)?
        } else {
            config.bindto_v6
        };
        let scope = if bind_ip.segments()[0] & 0xffc0 == 0xfe80 { if_index } else { 0 };
        let bind_addr = SocketAddrV6::new(bind_ip, config.port, 0, scope);
        socket
            .bind(&bind_addr.into())
            .with_context(|| format!("failed to bind v6 socket to {bind_addr}"))?;

        let mut multicast_dst = None;
        if let Some(group) = config.multicast_v6 {
            socket
                .join_multicast_v6(&group, if_index)
                .with_context(|| format!("failed to join multicast group {group}"))?;
            socket.set_multicast_if_v6(if_index)?;
            socket.set_multicast_loop_v6(false)?;
            multicast_dst = Some(SocketAddr::V6(SocketAddrV6::new(
                group,
                config.multicast_port,
                0,
                if_index,
            )));
        }

        Ok(BoundSocket { socket: Arc::new(socket), multicast_dst })
    }

    fn spawn_receiver(&self, family: Family, socket: Arc<Socket>, acl: Acl) {
        let generation = self.generation.clone();
        let my_generation = generation.load(SeqCst);
        let pool = self.pool.clone();
        let tx = self.tx.clone();
        let protocol = self.protocol.clone();
        let interface = self.interface.clone();
        let tag = match family {
            Family::V4 => "v4",
            Family::V6 => "v6",
        };

        let spawned = std::thread::Builder::new()
            .name(format!("{interface}-recv-{tag}"))
            .spawn(move || {
                while generation.load(SeqCst) == my_generation {
                    let mut buf = pool.acquire();
                    // SAFETY: recv writes at most storage.len() bytes; the
                    // buffer length is set from the return value below.
                    let uninit = unsafe {
                        std::slice::from_raw_parts_mut(
                            buf.storage_mut().as_mut_ptr() as *mut std::mem::MaybeUninit<u8>,
                            buf.capacity(),
                        )
                    };
                    let (len, from) = match socket.recv_from(uninit) {
                        Ok((len, from)) => (len, from),
                        Err(e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut =>
                        {
                            continue;
                        }
                        Err(_) => break,
                    };
                    let Some(from) = from.as_socket() else { continue };
                    if len == 0 || !acl.accepts(from.ip()) {
                        continue;
                    }
                    buf.set_len(len);
                    if tx
                        .send(InboundDatagram {
                            protocol: protocol.clone(),
                            interface: interface.clone(),
                            from,
                            payload: buf,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("failed to spawn receive thread for {}: {e}", self.interface);
        }
    }
}

impl PacketTransport for UdpTransport {
    fn apply(&mut self, config: &TransportConfig) -> Result<bool> {
        let changed = match &self.applied {
            Some(previous) => {
                previous.bindto_v4 != config.bindto_v4
                    || previous.bindto_v6 != config.bindto_v6
                    || previous.port != config.port
                    || previous.interface != config.interface
            }
            None => true,
        };

        // retire the previous sockets before rebinding
        self.generation.fetch_add(1, SeqCst);
        self.v4 = None;
        self.v6 = None;

        self.if_index = if config.interface.is_empty() {
            0
        } else {
            if_nametoindex(&config.interface)
        };

        let v4 = self.bind_v4(config)?;
        self.spawn_receiver(Family::V4, v4.socket.clone(), config.acl.clone());
        self.v4 = Some(v4);

        match self.bind_v6(config, self.if_index) {
            Ok(v6) => {
                self.spawn_receiver(Family::V6, v6.socket.clone(), config.acl.clone());
                self.v6 = Some(v6);
            }
            // IPv6 is best-effort, a v4-only host still works
            Err(e) => tracing::warn!("no v6 socket for {}: {e:#}", self.interface),
        }

        self.applied = Some(config.clone());
        Ok(changed)
    }

    fn close(&mut self, purge: bool) {
        // sends are synchronous, purge only affects the receive side
        let _ = purge;
        self.generation.fetch_add(1, SeqCst);
        self.v4 = None;
        self.v6 = None;
        self.applied = None;
    }

    fn is_active(&self, family: Family) -> bool {
        match family {
            Family::V4 => self.v4.is_some(),
            Family::V6 => self.v6.is_some(),
        }
    }

    fn send_unicast(&mut self, dst: SocketAddr, data: &[u8]) -> Result<()> {
        let bound = match dst {
            SocketAddr::V4(_) => self.v4.as_ref(),
            SocketAddr::V6(_) => self.v6.as_ref(),
        };
        let Some(bound) = bound else {
            bail!("no socket for {dst}");
        };
        bound
            .socket
            .send_to(data, &dst.into())
            .with_context(|| format!("unicast send to {dst} failed"))?;
        Ok(())
    }

    fn send_multicast(&mut self, family: Family, data: &[u8]) -> Result<()> {
        let bound = match family {
            Family::V4 => self.v4.as_ref(),
            Family::V6 => self.v6.as_ref(),
        };
        let Some(bound) = bound else {
            bail!("no socket for {family:?}");
        };
        let Some(dst) = bound.multicast_dst else {
            bail!("no multicast group configured for {family:?}");
        };
        bound
            .socket
            .send_to(data, &dst.into())
            .with_context(|| format!("multicast send to {dst} failed"))?;
        Ok(())
    }

    fn if_index(&self) -> u32 {
        self.if_index
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.close(false);
    }
}

/// Convenience constructor for the usual daemon wiring: one datagram channel
/// shared by all interfaces of the engine.
pub fn udp_factory(
    tx: Sender<InboundDatagram>,
) -> impl FnMut(&str, &str) -> Box<dyn PacketTransport> {
    let pool = BufferPool::new("rx datagrams", MAX_PACKET_SIZE);
    move |protocol: &str, interface: &str| {
        Box::new(UdpTransport::new(protocol, interface, pool.clone(), tx.clone()))
            as Box<dyn PacketTransport>
    }
}

fn if_nametoindex(name: &str) -> u32 {
    let Ok(cname) = std::ffi::CString::new(name) else {
        return 0;
    };
    unsafe { libc::if_nametoindex(cname.as_ptr()) }
}

fn is_linklocal_v6(addr: Ipv6Addr) -> bool {
    addr.segments()[0] & 0xffc0 == 0xfe80
}

/// Look up the IPv4 address assigned to a kernel interface.
fn resolve_interface_v4(interface: &str) -> Result<Ipv4Addr> {
    #[cfg(unix)]
    {
        use std::ffi::CStr;
        use std::ptr::null_mut;
        unsafe {
            let mut addrs: *mut libc::ifaddrs = null_mut();
            if libc::getifaddrs(&mut addrs) != 0 {
                bail!("getifaddrs failed");
            }
            let mut current = addrs;
            while !current.is_null() {
                let ifa = &*current;
                if !ifa.ifa_name.is_null() && !ifa.ifa_addr.is_null() {
                    let name = CStr::from_ptr(ifa.ifa_name).to_str().unwrap_or("");
                    if name == interface
                        && (*ifa.ifa_addr).sa_family == libc::AF_INET as libc::sa_family_t
                    {
                        let sin = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                        let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                        libc::freeifaddrs(addrs);
                        return Ok(ip);
                    }
                }
                current = ifa.ifa_next;
            }
            libc::freeifaddrs(addrs);
        }
        bail!("interface {} has no IPv4 address", interface);
    }
    #[cfg(not(unix))]
    {
        let _ = interface;
        Ok(Ipv4Addr::UNSPECIFIED)
    }
}

/// Look up the link-local IPv6 address assigned to a kernel interface.
fn resolve_interface_linklocal_v6(interface: &str) -> Result<Ipv6Addr> {
    #[cfg(unix)]
    {
        use std::ffi::CStr;
        use std::ptr::null_mut;
        unsafe {
            let mut addrs: *mut libc::ifaddrs = null_mut();
            if libc::getifaddrs(&mut addrs) != 0 {
                bail!("getifaddrs failed");
            }
            let mut current = addrs;
            while !current.is_null() {
                let ifa = &*current;
                if !ifa.ifa_name.is_null() && !ifa.ifa_addr.is_null() {
                    let name = CStr::from_ptr(ifa.ifa_name).to_str().unwrap_or("");
                    if name == interface
                        && (*ifa.ifa_addr).sa_family == libc::AF_INET6 as libc::sa_family_t
                    {
                        let sin6 = &*(ifa.ifa_addr as *const libc::sockaddr_in6);
                        let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                        if is_linklocal_v6(ip) {
                            libc::freeifaddrs(addrs);
                            return Ok(ip);
                        }
                    }
                }
                current = ifa.ifa_next;
            }
            libc::freeifaddrs(addrs);
        }
        bail!("interface {} has no link-local IPv6 address", interface);
    }
    #[cfg(not(unix))]
    {
        let _ = interface;
        Ok(Ipv6Addr::UNSPECIFIED)
    }
}

// ---------------------------------------------------------------------------
// Test transport
// ---------------------------------------------------------------------------
