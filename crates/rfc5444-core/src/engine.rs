//! The aggregation and dispatch engine.
//!
//! Owns the registry of protocols, their interfaces, and per-destination
//! dispatch targets. Upper-layer modules share entries through explicit
//! refcount tokens: every `add_*` hands out one token, every `remove_*`
//! consumes one, and an entry is destroyed when its last token is returned.
//!
//! The engine is single-threaded and sans-IO about time: state-changing
//! calls take `now`, [`Engine::poll_timeout`] reports the earliest pending
//! aggregation deadline, and [`Engine::handle_timeout`] flushes every
//! target whose deadline passed. The host event loop combines these with
//! the datagram channel fed by the interface transports.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::{Duration, Instant};

use crate::pool::BufferPool;
use crate::printer::{Direction, PacketPrinter};
use crate::reader::{ConsumerId, InputContext, MessageConsumer, PacketParser};
use crate::socket::{Family, InboundDatagram, PacketTransport, TransportConfig, TransportFactory};
use crate::wire::{Message, MAX_MESSAGE_SIZE};
use crate::writer::{EmitError, MessageProvider, PacketAssembler, Selector, WriterInterfaceId};

/// Name of the protocol created at engine construction.
pub const DEFAULT_PROTOCOL: &str = "rfc5444";

/// Reserved interface name for the unicast interface that is not bound to a
/// kernel device and never joins multicast groups.
pub const UNICAST_INTERFACE: &str = "_unicast_";

pub const DEFAULT_AGGREGATION_INTERVAL: Duration = Duration::from_millis(100);

/// Case-insensitive registry key. The display name keeps its original
/// spelling on the entry itself.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct NameKey(String);

impl NameKey {
    fn new(name: &str) -> Self {
        Self(name.to_ascii_lowercase())
    }
}

/// Refcount token for a protocol. Cloning hands the same entry to another
/// holder only in combination with [`Engine::add_protocol`]; `remove_*`
/// consumes one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolRef {
    key: NameKey,
}

/// Refcount token for an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRef {
    protocol: NameKey,
    interface: NameKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetKey {
    Unicast(IpAddr),
    Multicast(Family),
}

/// Refcount token for a dispatch target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRef {
    protocol: NameKey,
    interface: NameKey,
    key: TargetKey,
}

/// Token for a registered interface-change listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Passed to interface-change listeners.
#[derive(Debug)]
pub struct InterfaceEvent<'a> {
    pub protocol: &'a str,
    pub interface: &'a str,
    /// True when the socket addresses changed, not just ancillary settings.
    pub changed: bool,
}

pub type InterfaceListener = Box<dyn FnMut(&InterfaceEvent<'_>)>;

struct Target {
    dst: IpAddr,
    unicast: bool,
    refcount: u32,
    /// Per-target message sequence counter, random initial value.
    seqno: u16,
    /// Holders that want packet sequence numbers on this target.
    pktseqno_refcount: u32,
    wif: WriterInterfaceId,
    /// Pending aggregation deadline; None while the timer is idle.
    flush_at: Option<Instant>,
}

struct Interface {
    name: String,
    /// Set for the reserved unicast interface: no device bind, no multicast.
    unspecific: bool,
    refcount: u32,
    transport: Box<dyn PacketTransport>,
    cached_config: TransportConfig,
    targets: BTreeMap<IpAddr, Target>,
    multicast4: Option<Target>,
    multicast6: Option<Target>,
    listeners: Vec<(ListenerId, InterfaceListener)>,
}

impl Interface {
    fn target_mut(&mut self, key: &TargetKey) -> Option<&mut Target> {
        match key {
            TargetKey::Unicast(dst) => self.targets.get_mut(dst),
            TargetKey::Multicast(Family::V4) => self.multicast4.as_mut(),
            TargetKey::Multicast(Family::V6) => self.multicast6.as_mut(),
        }
    }

    fn all_targets(&self) -> impl Iterator<Item = &Target> {
        self.targets
            .values()
            .chain(self.multicast4.iter())
            .chain(self.multicast6.iter())
    }

    fn all_targets_mut(&mut self) -> impl Iterator<Item = (TargetKey, &mut Target)> {
        self.targets
            .iter_mut()
            .map(|(dst, t)| (TargetKey::Unicast(*dst), t))
            .chain(self.multicast4.iter_mut().map(|t| (TargetKey::Multicast(Family::V4), t)))
            .chain(self.multicast6.iter_mut().map(|t| (TargetKey::Multicast(Family::V6), t)))
    }
}

struct Protocol {
    name: String,
    port: u16,
    fixed_local_port: bool,
    refcount: u32,
    parser: PacketParser,
    assembler: PacketAssembler,
    interfaces: BTreeMap<NameKey, Interface>,
}

pub struct Engine {
    protocols: BTreeMap<NameKey, Protocol>,
    aggregation_interval: Duration,
    transports: Box<dyn TransportFactory>,
    printer: PacketPrinter,
    msg_pool: BufferPool,
    rng: StdRng,
    next_listener_id: u64,
    default_protocol: ProtocolRef,
    unicast_interface: InterfaceRef,
}

impl Engine {
    /// Build an engine with the default protocol and its unicast interface
    /// already registered.
    pub fn new(transports: Box<dyn TransportFactory>) -> Self {
        Self::with_rng(transports, StdRng::from_entropy())
    }

    pub fn with_rng(transports: Box<dyn TransportFactory>, rng: StdRng) -> Self {
        let mut engine = Engine {
            protocols: BTreeMap::new(),
            aggregation_interval: DEFAULT_AGGREGATION_INTERVAL,
            transports,
            printer: PacketPrinter::new(),
            msg_pool: BufferPool::new("writer messages", MAX_MESSAGE_SIZE),
            rng,
            next_listener_id: 0,
            default_protocol: ProtocolRef { key: NameKey::new(DEFAULT_PROTOCOL) },
            unicast_interface: InterfaceRef {
                protocol: NameKey::new(DEFAULT_PROTOCOL),
                interface: NameKey::new(UNICAST_INTERFACE),
            },
        };
        let protocol = engine.add_protocol(DEFAULT_PROTOCOL, true);
        let (unicast, _) = engine.add_interface(&protocol, None, UNICAST_INTERFACE);
        engine.default_protocol = protocol;
        engine.unicast_interface = unicast;
        engine
    }

    /// The engine's own token for the default protocol. Callers that want a
    /// token of their own go through [`Engine::add_protocol`].
    pub fn default_protocol(&self) -> ProtocolRef {
        self.default_protocol.clone()
    }

    pub fn unicast_interface(&self) -> InterfaceRef {
        self.unicast_interface.clone()
    }

    pub fn aggregation_interval(&self) -> Duration {
        self.aggregation_interval
    }

    pub fn set_aggregation_interval(&mut self, interval: Duration) {
        self.aggregation_interval = interval;
    }

    // -----------------------------------------------------------------
    // Protocol operations
    // -----------------------------------------------------------------

    /// Find or create a protocol. An existing entry is returned with its
    /// refcount incremented; `fixed_local_port` only applies on creation.
    pub fn add_protocol(&mut self, name: &str, fixed_local_port: bool) -> ProtocolRef {
        let key = NameKey::new(name);
        if let Some(protocol) = self.protocols.get_mut(&key) {
            protocol.refcount += 1;
            return ProtocolRef { key };
        }

        self.protocols.insert(
            key.clone(),
            Protocol {
                name: name.to_string(),
                port: 0,
                fixed_local_port,
                refcount: 1,
                parser: PacketParser::new(),
                assembler: PacketAssembler::new(self.msg_pool.clone()),
                interfaces: BTreeMap::new(),
            },
        );
        ProtocolRef { key }
    }

    /// Return one protocol token. The entry is destroyed, reader and writer
    /// included, when the last token comes back.
    pub fn remove_protocol(&mut self, protocol: ProtocolRef) {
        let entry = self
            .protocols
            .get_mut(&protocol.key)
            .expect("stale protocol handle");
        if entry.refcount > 1 {
            entry.refcount -= 1;
            return;
        }
        self.protocols.remove(&protocol.key);
    }

    /// Move a protocol to another UDP port. Every interface socket is torn
    /// down with pending state purged and reconfigured against the new port.
    pub fn reconfigure_protocol(&mut self, protocol: &ProtocolRef, port: u16) {
        let entry = self
            .protocols
            .get_mut(&protocol.key)
            .expect("stale protocol handle");
        if entry.port == port {
            return;
        }
        tracing::info!("reconfigure protocol {} to port {port}", entry.name);
        entry.port = port;

        let interface_keys: Vec<NameKey> = entry.interfaces.keys().cloned().collect();
        for key in interface_keys {
            self.protocols
                .get_mut(&protocol.key)
                .expect("stale protocol handle")
                .interfaces
                .get_mut(&key)
                .expect("interface disappeared during reconfigure")
                .transport
                .close(true);

            if port != 0 {
                let interface = InterfaceRef { protocol: protocol.key.clone(), interface: key };
                self.reconfigure_interface(&interface, None);
            }
        }
    }

    pub fn protocol_port(&self, protocol: &ProtocolRef) -> u16 {
        self.protocols
            .get(&protocol.key)
            .map(|p| p.port)
            .unwrap_or(0)
    }

    pub fn has_protocol(&self, name: &str) -> bool {
        self.protocols.contains_key(&NameKey::new(name))
    }

    pub fn protocol_refcount(&self, protocol: &ProtocolRef) -> Option<u32> {
        self.protocols.get(&protocol.key).map(|p| p.refcount)
    }

    /// Register a handler for inbound messages of one type on this
    /// protocol's reader.
    pub fn register_consumer(
        &mut self,
        protocol: &ProtocolRef,
        msg_type: u8,
        consumer: Box<dyn MessageConsumer>,
    ) -> ConsumerId {
        self.protocols
            .get_mut(&protocol.key)
            .expect("stale protocol handle")
            .parser
            .register_consumer(msg_type, consumer)
    }

    pub fn remove_consumer(&mut self, protocol: &ProtocolRef, id: ConsumerId) {
        if let Some(entry) = self.protocols.get_mut(&protocol.key) {
            entry.parser.remove_consumer(id);
        }
    }

    /// Register a content provider for one message id on this protocol's
    /// writer.
    pub fn register_provider(
        &mut self,
        protocol: &ProtocolRef,
        msgid: u8,
        provider: Box<dyn MessageProvider>,
    ) {
        self.protocols
            .get_mut(&protocol.key)
            .expect("stale protocol handle")
            .assembler
            .register_provider(msgid, provider);
    }

    pub fn remove_provider(&mut self, protocol: &ProtocolRef, msgid: u8) {
        if let Some(entry) = self.protocols.get_mut(&protocol.key) {
            entry.assembler.remove_provider(msgid);
        }
    }

    // -----------------------------------------------------------------
    // Interface operations
    // -----------------------------------------------------------------

    /// Find or create an interface under a protocol. The returned token
    /// counts either way. A supplied listener is attached and its id
    /// returned for later detachment.
    pub fn add_interface(
        &mut self,
        protocol: &ProtocolRef,
        listener: Option<InterfaceListener>,
        name: &str,
    ) -> (InterfaceRef, Option<ListenerId>) {
        let key = NameKey::new(name);
        let entry = self
            .protocols
            .get_mut(&protocol.key)
            .expect("stale protocol handle");

        if !entry.interfaces.contains_key(&key) {
            let transport = self.transports.create(&entry.name, name);
            entry.interfaces.insert(
                key.clone(),
                Interface {
                    name: name.to_string(),
                    unspecific: name.eq_ignore_ascii_case(UNICAST_INTERFACE),
                    refcount: 0,
                    transport,
                    cached_config: TransportConfig::default(),
                    targets: BTreeMap::new(),
                    multicast4: None,
                    multicast6: None,
                    listeners: Vec::new(),
                },
            );
            entry.refcount += 1;
        }

        let interface = entry.interfaces.get_mut(&key).expect("just inserted");
        interface.refcount += 1;

        let listener_id = listener.map(|callback| {
            let id = ListenerId(self.next_listener_id);
            self.next_listener_id += 1;
            interface.listeners.push((id, callback));
            id
        });

        (
            InterfaceRef { protocol: protocol.key.clone(), interface: key },
            listener_id,
        )
    }

    /// Return one interface token, optionally detaching a listener first.
    /// Listener detachment happens regardless of whether the interface
    /// survives. On destruction the multicast targets are torn down, the
    /// socket is closed without purging in-flight sends, and one protocol
    /// token is returned.
    pub fn remove_interface(&mut self, interface: InterfaceRef, listener: Option<ListenerId>) {
        let entry = self
            .protocols
            .get_mut(&interface.protocol)
            .expect("stale interface handle");
        let iface = entry
            .interfaces
            .get_mut(&interface.interface)
            .expect("stale interface handle");

        if let Some(listener_id) = listener {
            iface.listeners.retain(|(id, _)| *id != listener_id);
        }

        if iface.refcount > 1 {
            iface.refcount -= 1;
            return;
        }

        let mut iface = entry
            .interfaces
            .remove(&interface.interface)
            .expect("just resolved");
        for target in iface.multicast4.take().iter().chain(iface.multicast6.take().iter()) {
            entry.assembler.unregister_interface(target.wif);
        }
        // unicast targets still present here mean leaked target tokens, but
        // their writer state must not outlive the interface either
        for target in iface.targets.values() {
            entry.assembler.unregister_interface(target.wif);
        }
        iface.transport.close(false);
        drop(iface);

        self.remove_protocol(ProtocolRef { key: interface.protocol });
    }

    /// Re-apply socket configuration. With `config` the cached snapshot is
    /// replaced first (its interface name forced to the interface's own);
    /// without it the cached snapshot is reused. Multicast targets are
    /// rebuilt to match the configured groups; a failed replacement keeps
    /// the previous target.
    pub fn reconfigure_interface(
        &mut self,
        interface: &InterfaceRef,
        config: Option<&TransportConfig>,
    ) {
        let Engine { protocols, rng, .. } = self;
        let entry = protocols
            .get_mut(&interface.protocol)
            .expect("stale interface handle");
        let port = entry.port;
        let fixed_local_port = entry.fixed_local_port;
        let Protocol { assembler, interfaces, .. } = entry;
        let iface = interfaces
            .get_mut(&interface.interface)
            .expect("stale interface handle");

        if let Some(config) = config {
            iface.cached_config = config.clone();
            iface.cached_config.interface = iface.name.clone();
        }

        if iface.cached_config.multicast_port == 0 {
            iface.cached_config.multicast_port = port;
        }
        if fixed_local_port && iface.cached_config.port == 0 {
            iface.cached_config.port = port;
        }

        if iface.unspecific {
            // not bound to a device and never part of a multicast group
            iface.cached_config.multicast_v4 = None;
            iface.cached_config.multicast_v6 = None;
            iface.cached_config.port = port;
            iface.cached_config.interface.clear();
        }

        tracing::info!(
            "reconfigure interface {} to port {}/{}",
            iface.name,
            iface.cached_config.port,
            iface.cached_config.multicast_port
        );

        if port == 0 {
            tracing::info!("    delay configuration, protocol port still missing");
            return;
        }

        if let Err(e) = iface.transport.apply(&iface.cached_config) {
            tracing::warn!("could not apply socket configuration for {}: {e:#}", iface.name);
        }

        let groups = [
            (iface.cached_config.multicast_v4.map(IpAddr::V4), Family::V4),
            (iface.cached_config.multicast_v6.map(IpAddr::V6), Family::V6),
        ];
        for (group, family) in groups {
            let slot = match family {
                Family::V4 => &mut iface.multicast4,
                Family::V6 => &mut iface.multicast6,
            };
            let old = slot.take();
            let mut keep_old = false;
            if let Some(group) = group {
                match create_target(assembler, rng, group, false) {
                    Ok(target) => *slot = Some(target),
                    Err(e) => {
                        tracing::warn!(
                            "could not create multicast target {group} for interface {}: {e}",
                            iface.name
                        );
                        keep_old = true;
                    }
                }
            }
            if keep_old {
                *slot = old;
            } else if let Some(old) = old {
                assembler.unregister_interface(old.wif);
            }
        }
    }

    /// React to a settings change reported for an interface's socket:
    /// re-derive the socket configuration when addresses changed, then tell
    /// every attached listener.
    pub fn notify_interface_changed(&mut self, interface: &InterfaceRef, changed: bool) {
        if changed {
            self.reconfigure_interface(interface, None);
        }

        let entry = self
            .protocols
            .get_mut(&interface.protocol)
            .expect("stale interface handle");
        let Protocol { name: protocol_name, interfaces, .. } = entry;
        let iface = interfaces
            .get_mut(&interface.interface)
            .expect("stale interface handle");
        tracing::info!("interface change event: {}", iface.name);

        let Interface { name, listeners, .. } = iface;
        let event = InterfaceEvent { protocol: protocol_name, interface: name, changed };
        for (_, listener) in listeners.iter_mut() {
            listener(&event);
        }
    }

    pub fn has_interface(&self, protocol: &ProtocolRef, name: &str) -> bool {
        self.protocols
            .get(&protocol.key)
            .is_some_and(|p| p.interfaces.contains_key(&NameKey::new(name)))
    }

    pub fn interface_count(&self, protocol: &ProtocolRef) -> usize {
        self.protocols
            .get(&protocol.key)
            .map(|p| p.interfaces.len())
            .unwrap_or(0)
    }

    pub fn interface_refcount(&self, interface: &InterfaceRef) -> Option<u32> {
        self.interface(interface).map(|i| i.refcount)
    }

    /// The cached socket configuration snapshot, as last derived.
    pub fn interface_config(&self, interface: &InterfaceRef) -> Option<&TransportConfig> {
        self.interface(interface).map(|i| &i.cached_config)
    }

    fn interface(&self, interface: &InterfaceRef) -> Option<&Interface> {
        self.protocols
            .get(&interface.protocol)
            .and_then(|p| p.interfaces.get(&interface.interface))
    }

    // -----------------------------------------------------------------
    // Target operations
    // -----------------------------------------------------------------

    /// Find or create the unicast dispatch target for a destination under
    /// an interface. The returned token counts either way. Returns None
    /// when the writer interface registry is exhausted; the interface is
    /// left untouched.
    pub fn add_target(&mut self, interface: &InterfaceRef, dst: IpAddr) -> Option<TargetRef> {
        let Engine { protocols, rng, .. } = self;
        let entry = protocols
            .get_mut(&interface.protocol)
            .expect("stale interface handle");
        let Protocol { assembler, interfaces, .. } = entry;
        let iface = interfaces
            .get_mut(&interface.interface)
            .expect("stale interface handle");

        if let Some(target) = iface.targets.get_mut(&dst) {
            target.refcount += 1;
        } else {
            let target = match create_target(assembler, rng, dst, true) {
                Ok(target) => target,
                Err(e) => {
                    tracing::warn!(
                        "could not create target {dst} on interface {}: {e}",
                        iface.name
                    );
                    return None;
                }
            };
            iface.targets.insert(dst, target);
            iface.refcount += 1;
        }

        Some(TargetRef {
            protocol: interface.protocol.clone(),
            interface: interface.interface.clone(),
            key: TargetKey::Unicast(dst),
        })
    }

    /// Return one target token. On destruction the aggregation timer is
    /// stopped, the writer interface is unregistered, and one interface
    /// token is returned.
    pub fn remove_target(&mut self, target: TargetRef) {
        let TargetKey::Unicast(dst) = target.key else {
            // multicast targets live and die with their interface's
            // configuration, extra tokens only ever decrement
            let entry = self
                .protocols
                .get_mut(&target.protocol)
                .expect("stale target handle");
            let iface = entry
                .interfaces
                .get_mut(&target.interface)
                .expect("stale target handle");
            if let Some(t) = iface.target_mut(&target.key) {
                if t.refcount > 1 {
                    t.refcount -= 1;
                } else {
                    tracing::warn!("multicast target {} is owned by its interface", t.dst);
                }
            }
            return;
        };

        let entry = self
            .protocols
            .get_mut(&target.protocol)
            .expect("stale target handle");
        let iface = entry
            .interfaces
            .get_mut(&target.interface)
            .expect("stale target handle");
        let t = iface.targets.get_mut(&dst).expect("stale target handle");
        if t.refcount > 1 {
            t.refcount -= 1;
            return;
        }

        let t = iface.targets.remove(&dst).expect("just resolved");
        entry.assembler.unregister_interface(t.wif);

        self.remove_interface(
            InterfaceRef { protocol: target.protocol, interface: target.interface },
            None,
        );
    }

    /// The multicast target of an interface for one address family, if the
    /// current configuration has one.
    pub fn multicast_target(&self, interface: &InterfaceRef, family: Family) -> Option<TargetRef> {
        let iface = self.interface(interface)?;
        let present = match family {
            Family::V4 => iface.multicast4.is_some(),
            Family::V6 => iface.multicast6.is_some(),
        };
        present.then(|| TargetRef {
            protocol: interface.protocol.clone(),
            interface: interface.interface.clone(),
            key: TargetKey::Multicast(family),
        })
    }

    pub fn target_count(&self, interface: &InterfaceRef) -> usize {
        self.interface(interface).map(|i| i.targets.len()).unwrap_or(0)
    }

    pub fn target_refcount(&self, target: &TargetRef) -> Option<u32> {
        self.target(target).map(|t| t.refcount)
    }

    fn target(&self, target: &TargetRef) -> Option<&Target> {
        let iface = self.interface(&InterfaceRef {
            protocol: target.protocol.clone(),
            interface: target.interface.clone(),
        })?;
        match &target.key {
            TargetKey::Unicast(dst) => iface.targets.get(dst),
            TargetKey::Multicast(Family::V4) => iface.multicast4.as_ref(),
            TargetKey::Multicast(Family::V6) => iface.multicast6.as_ref(),
        }
    }

    fn target_entry_mut(&mut self, target: &TargetRef) -> Option<&mut Target> {
        self.protocols
            .get_mut(&target.protocol)?
            .interfaces
            .get_mut(&target.interface)?
            .target_mut(&target.key)
    }

    /// Advance and return the target's message sequence number. Wraps at
    /// 2^16; the initial value is random.
    pub fn next_target_seqno(&mut self, target: &TargetRef) -> u16 {
        let t = self.target_entry_mut(target).expect("stale target handle");
        t.seqno = t.seqno.wrapping_add(1);
        t.seqno
    }

    /// Request packet sequence numbers on this target's packet headers.
    /// Sticky until every requester released again.
    pub fn request_packet_seqno(&mut self, target: &TargetRef) {
        let t = self.target_entry_mut(target).expect("stale target handle");
        t.pktseqno_refcount += 1;
    }

    pub fn release_packet_seqno(&mut self, target: &TargetRef) {
        let t = self.target_entry_mut(target).expect("stale target handle");
        t.pktseqno_refcount = t.pktseqno_refcount.saturating_sub(1);
    }

    // -----------------------------------------------------------------
    // Send path
    // -----------------------------------------------------------------

    /// Create one message for a target and arm its aggregation timer. A
    /// target whose socket is down for the destination's address family is
    /// silently skipped; the datagram would have nowhere to go.
    pub fn send(&mut self, target: &TargetRef, msgid: u8, now: Instant) -> Result<(), EmitError> {
        let interval = self.aggregation_interval;
        let entry = self
            .protocols
            .get_mut(&target.protocol)
            .expect("stale target handle");
        let protocol_name = entry.name.clone();
        let Protocol { assembler, interfaces, .. } = entry;
        let iface = interfaces
            .get_mut(&target.interface)
            .expect("stale target handle");

        let family = match &target.key {
            TargetKey::Unicast(dst) => Family::of(*dst),
            TargetKey::Multicast(family) => *family,
        };
        if !iface.transport.is_active(family) {
            return Ok(());
        }

        let interface_name = iface.name.clone();
        let t = iface.target_mut(&target.key).expect("stale target handle");
        if t.flush_at.is_none() {
            t.flush_at = Some(now + interval);
        }

        tracing::info!(
            "create message id {msgid} for protocol {protocol_name}/target {} on interface {interface_name}",
            t.dst
        );
        assembler.create_message(msgid, Selector::Single(t.wif))
    }

    /// Earliest pending aggregation deadline across all targets.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.protocols
            .values()
            .flat_map(|p| p.interfaces.values())
            .flat_map(|i| i.all_targets())
            .filter_map(|t| t.flush_at)
            .min()
    }

    /// Flush every target whose aggregation deadline has passed. Timers are
    /// one-shot: the deadline is cleared before the flush.
    pub fn handle_timeout(&mut self, now: Instant) {
        let mut due = Vec::new();
        for (protocol_key, protocol) in self.protocols.iter_mut() {
            for (interface_key, iface) in protocol.interfaces.iter_mut() {
                for (key, target) in iface.all_targets_mut() {
                    if target.flush_at.is_some_and(|at| at <= now) {
                        target.flush_at = None;
                        due.push(TargetRef {
                            protocol: protocol_key.clone(),
                            interface: interface_key.clone(),
                            key,
                        });
                    }
                }
            }
        }
        for target in due {
            self.flush_target(&target);
        }
    }

    fn flush_target(&mut self, target: &TargetRef) {
        let Engine { protocols, printer, .. } = self;
        let Some(entry) = protocols.get_mut(&target.protocol) else { return };
        let port = entry.port;
        let Protocol { assembler, interfaces, .. } = entry;
        let Some(iface) = interfaces.get_mut(&target.interface) else { return };
        let Interface { name, transport, targets, multicast4, multicast6, .. } = iface;
        let t = match &target.key {
            TargetKey::Unicast(dst) => targets.get_mut(dst),
            TargetKey::Multicast(Family::V4) => multicast4.as_mut(),
            TargetKey::Multicast(Family::V6) => multicast6.as_mut(),
        };
        let Some(t) = t else { return };

        let include_seqno = t.pktseqno_refcount > 0;
        let packets = match assembler.flush(t.wif, false, include_seqno) {
            Ok(packets) => packets,
            Err(e) => {
                tracing::warn!("error while flushing target {} on {name}: {e}", t.dst);
                return;
            }
        };

        let dst = destination_addr(t.dst, port, transport.if_index());
        for packet in &packets {
            printer.print(Direction::Outgoing, dst, name, packet);
            let sent = if t.unicast {
                transport.send_unicast(dst, packet)
            } else {
                transport.send_multicast(Family::of(t.dst), packet)
            };
            if let Err(e) = sent {
                tracing::warn!("could not send packet to {dst} on {name}: {e:#}");
            }
        }
    }

    // -----------------------------------------------------------------
    // Receive path
    // -----------------------------------------------------------------

    /// Entry point for the host event loop: feed one received datagram.
    pub fn handle_inbound(&mut self, datagram: InboundDatagram) {
        self.handle_datagram(
            &datagram.protocol,
            &datagram.interface,
            datagram.from,
            &datagram.payload,
        );
    }

    /// Parse one datagram received on an interface. Parse failures are
    /// logged and the datagram dropped; there is no retry.
    pub fn handle_datagram(
        &mut self,
        protocol: &str,
        interface: &str,
        from: SocketAddr,
        data: &[u8],
    ) {
        let Engine { protocols, printer, .. } = self;
        let Some(entry) = protocols.get_mut(&NameKey::new(protocol)) else {
            tracing::debug!("datagram for unknown protocol {protocol}, dropped");
            return;
        };
        let Protocol { parser, interfaces, .. } = entry;
        let Some(iface) = interfaces.get_mut(&NameKey::new(interface)) else {
            tracing::debug!("datagram for unknown interface {interface}, dropped");
            return;
        };

        printer.print(Direction::Incoming, from, &iface.name, data);

        let input = InputContext { address: from, interface: iface.name.clone() };
        if let Err(e) = parser.handle_packet(&input, data, &mut forward_message) {
            tracing::warn!("error while parsing incoming packet from {from}: {e}");
        }
    }

    // -----------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------

    /// Force-destroy every target, interface, and protocol regardless of
    /// outstanding tokens, in that order. Afterwards the writer message
    /// pool must report nothing outstanding.
    pub fn cleanup(&mut self) {
        let protocol_keys: Vec<NameKey> = self.protocols.keys().cloned().collect();
        for protocol_key in protocol_keys {
            let interface_keys: Vec<NameKey> =
                self.protocols[&protocol_key].interfaces.keys().cloned().collect();
            for interface_key in interface_keys {
                let destinations: Vec<IpAddr> = self.protocols[&protocol_key].interfaces
                    [&interface_key]
                    .targets
                    .keys()
                    .cloned()
                    .collect();
                for dst in destinations {
                    let target = TargetRef {
                        protocol: protocol_key.clone(),
                        interface: interface_key.clone(),
                        key: TargetKey::Unicast(dst),
                    };
                    if let Some(t) = self.target_entry_mut(&target) {
                        t.refcount = 1;
                    }
                    self.remove_target(target);
                }

                let interface = InterfaceRef {
                    protocol: protocol_key.clone(),
                    interface: interface_key.clone(),
                };
                if let Some(p) = self.protocols.get_mut(&protocol_key) {
                    if let Some(i) = p.interfaces.get_mut(&interface_key) {
                        i.refcount = 1;
                    }
                }
                self.remove_interface(interface, None);
            }

            if let Some(p) = self.protocols.get_mut(&protocol_key) {
                p.refcount = 1;
            }
            self.remove_protocol(ProtocolRef { key: protocol_key });
        }
    }

    /// Writer message buffers currently checked out. Zero after
    /// [`Engine::cleanup`].
    pub fn message_pool_outstanding(&self) -> usize {
        self.msg_pool.outstanding()
    }

    #[cfg(test)]
    pub(crate) fn target_writer_interface(&self, target: &TargetRef) -> Option<WriterInterfaceId> {
        self.target(target).map(|t| t.wif)
    }

    #[cfg(test)]
    pub(crate) fn assembler_mut(&mut self, protocol: &ProtocolRef) -> &mut PacketAssembler {
        &mut self.protocols.get_mut(&protocol.key).unwrap().assembler
    }
}

/// Forwarding hook for received messages. Messages without both an
/// originator and a sequence number cannot run through a duplicate check
/// and are dropped.
fn forward_message(msg: &Message<'_>) {
    if msg.originator.is_none() || msg.seqno.is_none() {
        return;
    }
    // TODO: duplicate detection table keyed by (originator, msg type);
    // until it exists, forward candidates are dropped here instead of being
    // handed to the writer's forwarding path
}

fn create_target(
    assembler: &mut PacketAssembler,
    rng: &mut StdRng,
    dst: IpAddr,
    unicast: bool,
) -> Result<Target, EmitError> {
    let wif = assembler.register_interface(rng.gen::<u16>())?;
    Ok(Target {
        dst,
        unicast,
        refcount: 1,
        seqno: rng.gen::<u16>(),
        pktseqno_refcount: 0,
        wif,
        flush_at: None,
    })
}

/// UDP destination for a target: its address, the protocol port, and the
/// kernel interface index as scope for link-local and multicast v6.
fn destination_addr(dst: IpAddr, port: u16, if_index: u32) -> SocketAddr {
    match dst {
        IpAddr::V4(v4) => SocketAddr::V4(SocketAddrV4::new(v4, port)),
        IpAddr::V6(v6) => {
            let scoped = v6.segments()[0] & 0xffc0 == 0xfe80 || v6.is_multicast();
            let scope = if scoped { if_index } else { 0 };
            SocketAddr::V6(SocketAddrV6::new(v6, port, 0, scope))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::testing::{MockState, MockTransport};
    use crate::wire::{MessageFrame, MessageIter, PacketHeader};
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    struct Fixture {
        engine: Engine,
        transports: Arc<Mutex<Vec<MockTransport>>>,
    }

    impl Fixture {
        /// Engine over mock transports. Index 0 of `transports` belongs to
        /// the `_unicast_` interface created at construction.
        fn new() -> Self {
            let transports: Arc<Mutex<Vec<MockTransport>>> = Arc::default();
            let created = transports.clone();
            let factory = move |_protocol: &str, _interface: &str| {
                let mock = MockTransport::active();
                created.lock().unwrap().push(mock.clone());
                Box::new(mock) as Box<dyn PacketTransport>
            };
            let engine = Engine::with_rng(Box::new(factory), StdRng::seed_from_u64(42));
            Self { engine, transports }
        }

        fn transport_state(&self, index: usize) -> Arc<Mutex<MockState>> {
            self.transports.lock().unwrap()[index].state.clone()
        }
    }

    fn body_provider(body: Vec<u8>) -> Box<dyn MessageProvider> {
        Box::new(move |frame: &mut MessageFrame| {
            frame.body = body.clone();
            Ok(())
        })
    }

    fn message_types(packet: &[u8]) -> Vec<u8> {
        let (_, offset) = PacketHeader::decode(packet).unwrap();
        MessageIter::new(&packet[offset..])
            .map(|m| m.unwrap().msg_type)
            .collect()
    }

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn test_default_protocol_and_unicast_interface() {
        let fixture = Fixture::new();
        let engine = &fixture.engine;
        assert!(engine.has_protocol(DEFAULT_PROTOCOL));
        assert!(engine.has_protocol("RFC5444"), "protocol names are case-insensitive");
        assert!(engine.has_interface(&engine.default_protocol(), UNICAST_INTERFACE));
        // one token held by the engine plus one per interface underneath
        assert_eq!(engine.protocol_refcount(&engine.default_protocol()), Some(2));
        assert_eq!(engine.interface_refcount(&engine.unicast_interface()), Some(1));
    }

    #[test]
    fn test_add_protocol_idempotent() {
        let mut fixture = Fixture::new();
        let engine = &mut fixture.engine;
        let first = engine.add_protocol("olsrv2", false);
        let second = engine.add_protocol("OLSRv2", true);
        assert_eq!(first, second);
        assert_eq!(engine.protocol_refcount(&first), Some(2));

        engine.remove_protocol(second);
        assert!(engine.has_protocol("olsrv2"));
        engine.remove_protocol(first);
        assert!(!engine.has_protocol("olsrv2"));
    }

    #[test]
    fn test_protocol_refcount_counts_interfaces() {
        let mut fixture = Fixture::new();
        let engine = &mut fixture.engine;
        let protocol = engine.add_protocol("p", true);
        assert_eq!(engine.protocol_refcount(&protocol), Some(1));

        let (eth0, _) = engine.add_interface(&protocol, None, "eth0");
        let (eth1, _) = engine.add_interface(&protocol, None, "eth1");
        assert_eq!(engine.protocol_refcount(&protocol), Some(3));

        engine.remove_interface(eth0, None);
        engine.remove_interface(eth1, None);
        assert_eq!(engine.protocol_refcount(&protocol), Some(1));
        assert_eq!(engine.interface_count(&protocol), 0);

        engine.remove_protocol(protocol);
        assert!(!engine.has_protocol("p"));
    }

    #[test]
    fn test_add_interface_idempotent_and_case_insensitive() {
        let mut fixture = Fixture::new();
        let engine = &mut fixture.engine;
        let protocol = engine.add_protocol("p", true);
        let (first, _) = engine.add_interface(&protocol, None, "eth0");
        let (second, _) = engine.add_interface(&protocol, None, "ETH0");
        assert_eq!(first, second);
        assert_eq!(engine.interface_refcount(&first), Some(2));
        assert_eq!(engine.interface_count(&protocol), 1);

        engine.remove_interface(second, None);
        assert!(engine.has_interface(&protocol, "eth0"));
        engine.remove_interface(first, None);
        assert!(!engine.has_interface(&protocol, "eth0"));
    }

    #[test]
    fn test_interface_refcount_counts_unicast_targets_only() {
        let mut fixture = Fixture::new();
        let engine = &mut fixture.engine;
        let protocol = engine.add_protocol("p", true);
        engine.reconfigure_protocol(&protocol, 269);
        let (iface, _) = engine.add_interface(&protocol, None, "eth0");
        assert_eq!(engine.interface_refcount(&iface), Some(1));

        let a = engine.add_target(&iface, "10.0.0.1".parse().unwrap()).unwrap();
        let b = engine.add_target(&iface, "10.0.0.2".parse().unwrap()).unwrap();
        assert_eq!(engine.interface_refcount(&iface), Some(3));

        // multicast targets do not contribute to the interface refcount
        let mut config = TransportConfig::default();
        config.multicast_v4 = Some("224.0.0.109".parse().unwrap());
        engine.reconfigure_interface(&iface, Some(&config));
        assert!(engine.multicast_target(&iface, Family::V4).is_some());
        assert_eq!(engine.interface_refcount(&iface), Some(3));
        assert_eq!(engine.target_count(&iface), 2);

        engine.remove_target(a);
        engine.remove_target(b);
        assert_eq!(engine.interface_refcount(&iface), Some(1));
        assert_eq!(engine.target_count(&iface), 0);
    }

    #[test]
    fn test_add_target_idempotent() {
        let mut fixture = Fixture::new();
        let engine = &mut fixture.engine;
        let protocol = engine.add_protocol("p", true);
        let (iface, _) = engine.add_interface(&protocol, None, "eth0");
        let dst: IpAddr = "10.0.0.1".parse().unwrap();

        let first = engine.add_target(&iface, dst).unwrap();
        let second = engine.add_target(&iface, dst).unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.target_refcount(&first), Some(2));
        assert_eq!(engine.target_count(&iface), 1);

        engine.remove_target(second);
        assert_eq!(engine.target_count(&iface), 1);
        engine.remove_target(first);
        assert_eq!(engine.target_count(&iface), 0);
    }

    #[test]
    fn test_add_target_fails_when_writer_registry_full() {
        let mut fixture = Fixture::new();
        let engine = &mut fixture.engine;
        let protocol = engine.add_protocol("p", true);
        let (iface, _) = engine.add_interface(&protocol, None, "eth0");
        engine.assembler_mut(&protocol).set_interface_limit(1);

        let first = engine.add_target(&iface, "10.0.0.1".parse().unwrap());
        assert!(first.is_some());
        assert!(engine.add_target(&iface, "10.0.0.2".parse().unwrap()).is_none());

        // the failed attempt leaves no trace on the interface
        assert_eq!(engine.target_count(&iface), 1);
        assert_eq!(engine.interface_refcount(&iface), Some(2));

        // an existing destination still resolves, registry full or not
        let again = engine.add_target(&iface, "10.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(engine.target_refcount(&again), Some(2));
    }

    #[test]
    fn test_listener_detached_even_when_interface_survives() {
        let mut fixture = Fixture::new();
        let engine = &mut fixture.engine;
        let protocol = engine.add_protocol("p", true);
        let (keeper, _) = engine.add_interface(&protocol, None, "eth0");

        let events: Arc<Mutex<Vec<bool>>> = Arc::default();
        let sink = events.clone();
        let listener: InterfaceListener =
            Box::new(move |event: &InterfaceEvent<'_>| sink.lock().unwrap().push(event.changed));
        let (second, listener_id) = engine.add_interface(&protocol, Some(listener), "eth0");

        engine.notify_interface_changed(&keeper, false);
        assert_eq!(events.lock().unwrap().len(), 1);

        // detaching the listener does not consume extra tokens
        engine.remove_interface(second, listener_id);
        assert!(engine.has_interface(&protocol, "eth0"));
        engine.notify_interface_changed(&keeper, false);
        assert_eq!(events.lock().unwrap().len(), 1);

        engine.remove_interface(keeper, None);
        assert!(!engine.has_interface(&protocol, "eth0"));
    }

    #[test]
    fn test_basic_send_flushes_one_unicast_packet() {
        let mut fixture = Fixture::new();
        let engine = &mut fixture.engine;
        engine.set_aggregation_interval(Duration::from_millis(50));
        let protocol = engine.add_protocol("p", true);
        engine.reconfigure_protocol(&protocol, 269);
        let (iface, _) = engine.add_interface(&protocol, None, "eth0");
        let target = engine.add_target(&iface, "10.0.0.1".parse().unwrap()).unwrap();

        // 4 byte header + 8 byte body = a 12 byte message
        engine.register_provider(&protocol, 1, body_provider(vec![0xab; 8]));

        let t0 = now();
        engine.send(&target, 1, t0).unwrap();
        assert_eq!(engine.poll_timeout(), Some(t0 + Duration::from_millis(50)));

        engine.handle_timeout(t0 + Duration::from_millis(49));
        let state = fixture.transport_state(1);
        assert!(state.lock().unwrap().unicast_sent.is_empty());

        fixture.engine.handle_timeout(t0 + Duration::from_millis(50));
        let sent = state.lock().unwrap().unicast_sent.clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "10.0.0.1:269".parse().unwrap());
        assert_eq!(sent[0].1.len(), 1 + 12);
        assert_eq!(message_types(&sent[0].1), vec![1]);
        assert_eq!(fixture.engine.poll_timeout(), None);
    }

    #[test]
    fn test_aggregation_batches_in_send_order() {
        let mut fixture = Fixture::new();
        let engine = &mut fixture.engine;
        let protocol = engine.add_protocol("p", true);
        engine.reconfigure_protocol(&protocol, 269);
        let (iface, _) = engine.add_interface(&protocol, None, "eth0");
        let target = engine.add_target(&iface, "10.0.0.1".parse().unwrap()).unwrap();
        for msgid in [1u8, 2, 3] {
            engine.register_provider(&protocol, msgid, body_provider(vec![msgid; 4]));
        }

        let t0 = now();
        engine.send(&target, 1, t0).unwrap();
        engine.send(&target, 2, t0 + Duration::from_millis(20)).unwrap();
        engine.send(&target, 3, t0 + Duration::from_millis(40)).unwrap();
        // later sends do not rearm the running timer
        assert_eq!(engine.poll_timeout(), Some(t0 + DEFAULT_AGGREGATION_INTERVAL));

        engine.handle_timeout(t0 + DEFAULT_AGGREGATION_INTERVAL);
        let state = fixture.transport_state(1);
        let sent = state.lock().unwrap().unicast_sent.clone();
        assert_eq!(sent.len(), 1, "exactly one flush with all three messages");
        assert_eq!(message_types(&sent[0].1), vec![1, 2, 3]);
    }

    #[test]
    fn test_send_on_inactive_socket_is_silent_success() {
        let mut fixture = Fixture::new();
        let engine = &mut fixture.engine;
        let protocol = engine.add_protocol("p", true);
        engine.reconfigure_protocol(&protocol, 269);
        let (iface, _) = engine.add_interface(&protocol, None, "eth0");
        let target = engine.add_target(&iface, "10.0.0.1".parse().unwrap()).unwrap();
        engine.register_provider(&protocol, 1, body_provider(vec![1]));

        fixture.transport_state(1).lock().unwrap().active_v4 = false;

        let t0 = now();
        fixture.engine.send(&target, 1, t0).unwrap();
        assert_eq!(fixture.engine.poll_timeout(), None, "no timer armed");

        fixture.engine.handle_timeout(t0 + Duration::from_secs(1));
        assert!(fixture.transport_state(1).lock().unwrap().unicast_sent.is_empty());
    }

    #[test]
    fn test_reconfigure_protocol_rebinds_interfaces() {
        let mut fixture = Fixture::new();
        let engine = &mut fixture.engine;
        let protocol = engine.add_protocol("p", true);
        engine.reconfigure_protocol(&protocol, 269);
        let (iface, _) = engine.add_interface(&protocol, None, "eth0");
        engine.reconfigure_interface(&iface, Some(&TransportConfig::default()));

        let config = engine.interface_config(&iface).unwrap();
        assert_eq!(config.port, 269, "zero port inherits the protocol port");
        assert_eq!(config.multicast_port, 269);
        assert_eq!(config.interface, "eth0");

        engine.reconfigure_protocol(&protocol, 12345);

        let state = fixture.transport_state(1);
        let state = state.lock().unwrap();
        assert!(state.closed.contains(&true), "socket removed with purge");
        assert!(state.applied.len() >= 2, "socket reconfigured after rebind");
        // inheritance only fills zeroes: the cached ports stay at the value
        // inherited first
        let config = fixture.engine.interface_config(&iface).unwrap();
        assert_eq!(config.port, 269);
        assert_eq!(config.multicast_port, 269);
    }

    #[test]
    fn test_reconfigure_protocol_same_port_is_noop() {
        let mut fixture = Fixture::new();
        let engine = &mut fixture.engine;
        let protocol = engine.add_protocol("p", true);
        engine.reconfigure_protocol(&protocol, 269);
        let (iface, _) = engine.add_interface(&protocol, None, "eth0");
        engine.reconfigure_interface(&iface, Some(&TransportConfig::default()));

        let state = fixture.transport_state(1);
        let applied_before = state.lock().unwrap().applied.len();
        fixture.engine.reconfigure_protocol(&protocol, 269);
        assert_eq!(state.lock().unwrap().applied.len(), applied_before);
        assert!(state.lock().unwrap().closed.is_empty());
    }

    #[test]
    fn test_delay_configuration_while_port_unset() {
        let mut fixture = Fixture::new();
        let engine = &mut fixture.engine;
        let protocol = engine.add_protocol("p", true);
        let (iface, _) = engine.add_interface(&protocol, None, "eth0");
        engine.reconfigure_interface(&iface, Some(&TransportConfig::default()));

        let state = fixture.transport_state(1);
        assert!(state.lock().unwrap().applied.is_empty(), "configuration delayed");
    }

    #[test]
    fn test_unicast_interface_special_case() {
        let mut fixture = Fixture::new();
        let engine = &mut fixture.engine;
        let protocol = engine.default_protocol();
        let unicast = engine.unicast_interface();

        let mut config = TransportConfig::default();
        config.multicast_v4 = Some("224.0.0.109".parse().unwrap());
        config.multicast_v6 = Some("ff02::6d".parse().unwrap());
        config.port = 4000;

        engine.reconfigure_protocol(&protocol, 269);
        engine.reconfigure_interface(&unicast, Some(&config));

        let cached = engine.interface_config(&unicast).unwrap();
        assert_eq!(cached.multicast_v4, None);
        assert_eq!(cached.multicast_v6, None);
        assert_eq!(cached.port, 269, "unicast interface always uses the protocol port");
        assert_eq!(cached.interface, "", "not bound to a device");
        assert!(engine.multicast_target(&unicast, Family::V4).is_none());
        assert!(engine.multicast_target(&unicast, Family::V6).is_none());
    }

    #[test]
    fn test_multicast_target_replacement() {
        let mut fixture = Fixture::new();
        let engine = &mut fixture.engine;
        let protocol = engine.add_protocol("p", true);
        engine.reconfigure_protocol(&protocol, 269);
        let (iface, _) = engine.add_interface(&protocol, None, "eth0");

        let mut config = TransportConfig::default();
        config.multicast_v4 = Some("224.0.0.109".parse().unwrap());
        engine.reconfigure_interface(&iface, Some(&config));
        let old = engine.multicast_target(&iface, Family::V4).unwrap();
        let old_wif = engine.target_writer_interface(&old).unwrap();

        config.multicast_v4 = Some("224.0.0.110".parse().unwrap());
        engine.reconfigure_interface(&iface, Some(&config));
        let new = engine.multicast_target(&iface, Family::V4).unwrap();
        let new_wif = engine.target_writer_interface(&new).unwrap();
        assert_ne!(old_wif, new_wif, "replacement registered a fresh writer interface");
        assert_eq!(engine.assembler_mut(&protocol).last_seqno(old_wif), None);
    }

    #[test]
    fn test_failed_multicast_replacement_keeps_old_target() {
        let mut fixture = Fixture::new();
        let engine = &mut fixture.engine;
        let protocol = engine.add_protocol("p", true);
        engine.reconfigure_protocol(&protocol, 269);
        let (iface, _) = engine.add_interface(&protocol, None, "eth0");

        let mut config = TransportConfig::default();
        config.multicast_v4 = Some("224.0.0.109".parse().unwrap());
        engine.reconfigure_interface(&iface, Some(&config));
        let old = engine.multicast_target(&iface, Family::V4).unwrap();
        let old_wif = engine.target_writer_interface(&old).unwrap();

        // force registration failure for the replacement
        engine.assembler_mut(&protocol).set_interface_limit(0);
        config.multicast_v4 = Some("224.0.0.110".parse().unwrap());
        engine.reconfigure_interface(&iface, Some(&config));

        let kept = engine.multicast_target(&iface, Family::V4).unwrap();
        assert_eq!(engine.target_writer_interface(&kept), Some(old_wif));
        assert!(engine.assembler_mut(&protocol).last_seqno(old_wif).is_some());
    }

    #[test]
    fn test_multicast_send_uses_family_addressing() {
        let mut fixture = Fixture::new();
        let engine = &mut fixture.engine;
        let protocol = engine.add_protocol("p", true);
        engine.reconfigure_protocol(&protocol, 269);
        let (iface, _) = engine.add_interface(&protocol, None, "eth0");
        let mut config = TransportConfig::default();
        config.multicast_v4 = Some("224.0.0.109".parse().unwrap());
        engine.reconfigure_interface(&iface, Some(&config));

        engine.register_provider(&protocol, 5, body_provider(vec![5; 4]));
        let target = engine.multicast_target(&iface, Family::V4).unwrap();
        let t0 = now();
        engine.send(&target, 5, t0).unwrap();
        engine.handle_timeout(t0 + DEFAULT_AGGREGATION_INTERVAL);

        let state = fixture.transport_state(1);
        let state = state.lock().unwrap();
        assert!(state.unicast_sent.is_empty());
        assert_eq!(state.multicast_sent.len(), 1);
        assert_eq!(state.multicast_sent[0].0, Family::V4);
    }

    #[test]
    fn test_packet_seqno_request_is_sticky() {
        let mut fixture = Fixture::new();
        let engine = &mut fixture.engine;
        let protocol = engine.add_protocol("p", true);
        engine.reconfigure_protocol(&protocol, 269);
        let (iface, _) = engine.add_interface(&protocol, None, "eth0");
        let target = engine.add_target(&iface, "10.0.0.1".parse().unwrap()).unwrap();
        engine.register_provider(&protocol, 1, body_provider(vec![1]));

        engine.request_packet_seqno(&target);
        engine.request_packet_seqno(&target);
        engine.release_packet_seqno(&target);

        let t0 = now();
        engine.send(&target, 1, t0).unwrap();
        engine.handle_timeout(t0 + DEFAULT_AGGREGATION_INTERVAL);

        let state = fixture.transport_state(1);
        let first = state.lock().unwrap().unicast_sent[0].1.clone();
        let (header, _) = PacketHeader::decode(&first).unwrap();
        let first_seqno = header.seqno.expect("seqno requested");

        // a second packet increments by one
        let t1 = t0 + Duration::from_secs(1);
        fixture.engine.send(&target, 1, t1).unwrap();
        fixture.engine.handle_timeout(t1 + DEFAULT_AGGREGATION_INTERVAL);
        let second = state.lock().unwrap().unicast_sent[1].1.clone();
        let (header, _) = PacketHeader::decode(&second).unwrap();
        assert_eq!(header.seqno, Some(first_seqno.wrapping_add(1)));

        // releasing the last requester stops seqno emission
        fixture.engine.release_packet_seqno(&target);
        let t2 = t1 + Duration::from_secs(1);
        fixture.engine.send(&target, 1, t2).unwrap();
        fixture.engine.handle_timeout(t2 + DEFAULT_AGGREGATION_INTERVAL);
        let third = state.lock().unwrap().unicast_sent[2].1.clone();
        assert_eq!(PacketHeader::decode(&third).unwrap().0.seqno, None);
    }

    #[test]
    fn test_next_target_seqno_is_bijective_over_period() {
        let mut fixture = Fixture::new();
        let engine = &mut fixture.engine;
        let protocol = engine.add_protocol("p", true);
        let (iface, _) = engine.add_interface(&protocol, None, "eth0");
        let target = engine.add_target(&iface, "10.0.0.1".parse().unwrap()).unwrap();

        let mut seen = HashSet::with_capacity(1 << 16);
        for _ in 0..(1u32 << 16) {
            seen.insert(engine.next_target_seqno(&target));
        }
        assert_eq!(seen.len(), 1 << 16);
    }

    #[test]
    fn test_target_seqnos_are_independent() {
        let mut fixture = Fixture::new();
        let engine = &mut fixture.engine;
        let protocol = engine.add_protocol("p", true);
        let (iface, _) = engine.add_interface(&protocol, None, "eth0");
        let a = engine.add_target(&iface, "10.0.0.1".parse().unwrap()).unwrap();
        let b = engine.add_target(&iface, "10.0.0.2".parse().unwrap()).unwrap();

        let a1 = engine.next_target_seqno(&a);
        let a2 = engine.next_target_seqno(&a);
        assert_eq!(a2, a1.wrapping_add(1));

        let b1 = engine.next_target_seqno(&b);
        let a3 = engine.next_target_seqno(&a);
        assert_eq!(a3, a2.wrapping_add(1));
        let b2 = engine.next_target_seqno(&b);
        assert_eq!(b2, b1.wrapping_add(1));
    }

    #[test]
    fn test_forward_hook_never_forwards() {
        let mut fixture = Fixture::new();
        let engine = &mut fixture.engine;
        let protocol = engine.default_protocol();
        engine.reconfigure_protocol(&protocol, 269);
        let (interface, _) = engine.add_interface(&protocol, None, "eth0");
        let target = engine.add_target(&interface, "10.0.0.1".parse().unwrap()).unwrap();
        let wif = engine.target_writer_interface(&target).unwrap();

        // message without originator: not forwardable at all
        let mut packet = Vec::new();
        PacketHeader::default().encode_into(&mut packet);
        let mut frame = MessageFrame::new(9);
        frame.seqno = Some(5);
        packet.extend_from_slice(&frame.encode());
        engine.handle_datagram("rfc5444", "eth0", "10.0.0.9:269".parse().unwrap(), &packet);
        assert!(!engine.assembler_mut(&protocol).has_pending(wif));

        // forwardable message: duplicate detection is unimplemented, so it
        // must not reach the writer either
        let mut packet = Vec::new();
        PacketHeader::default().encode_into(&mut packet);
        let mut frame = MessageFrame::new(9);
        frame.originator = Some(crate::wire::Originator::new(&[10, 0, 0, 9]).unwrap());
        frame.seqno = Some(5);
        packet.extend_from_slice(&frame.encode());
        engine.handle_datagram("rfc5444", "eth0", "10.0.0.9:269".parse().unwrap(), &packet);
        assert!(!engine.assembler_mut(&protocol).has_pending(wif));
    }

    #[test]
    fn test_receive_dispatches_to_consumer() {
        let mut fixture = Fixture::new();
        let engine = &mut fixture.engine;
        let protocol = engine.default_protocol();
        let (iface, _) = engine.add_interface(&protocol, None, "eth0");

        let seen: Arc<Mutex<Vec<(String, SocketAddr)>>> = Arc::default();
        let sink = seen.clone();
        engine.register_consumer(
            &protocol,
            3,
            Box::new(move |input: &InputContext, _msg: &Message<'_>| {
                sink.lock().unwrap().push((input.interface.clone(), input.address));
            }),
        );

        let mut packet = Vec::new();
        PacketHeader::default().encode_into(&mut packet);
        packet.extend_from_slice(&MessageFrame::new(3).encode());
        let from: SocketAddr = "192.0.2.7:269".parse().unwrap();
        engine.handle_datagram("rfc5444", "eth0", from, &packet);

        let seen = seen.lock().unwrap();
        assert_eq!(&*seen, &[("eth0".to_string(), from)]);
        drop(seen);
        engine.remove_interface(iface, None);
    }

    #[test]
    fn test_malformed_datagram_is_dropped() {
        let mut fixture = Fixture::new();
        let engine = &mut fixture.engine;
        // bad version, no consumer, no panic
        engine.handle_datagram(
            "rfc5444",
            UNICAST_INTERFACE,
            "192.0.2.7:269".parse().unwrap(),
            &[0xf0, 0x00],
        );
    }

    #[test]
    fn test_cleanup_releases_everything() {
        let mut fixture = Fixture::new();
        let engine = &mut fixture.engine;
        let protocol = engine.add_protocol("p", true);
        engine.reconfigure_protocol(&protocol, 269);
        let (iface, _) = engine.add_interface(&protocol, None, "eth0");
        let target = engine.add_target(&iface, "10.0.0.1".parse().unwrap()).unwrap();
        let mut config = TransportConfig::default();
        config.multicast_v4 = Some("224.0.0.109".parse().unwrap());
        engine.reconfigure_interface(&iface, Some(&config));

        // leave messages accumulated and the timer armed
        engine.register_provider(&protocol, 1, body_provider(vec![1; 4]));
        engine.send(&target, 1, now()).unwrap();
        assert!(engine.message_pool_outstanding() > 0);

        engine.cleanup();
        assert!(!engine.has_protocol("p"));
        assert!(!engine.has_protocol(DEFAULT_PROTOCOL));
        assert_eq!(engine.message_pool_outstanding(), 0);
        assert_eq!(engine.poll_timeout(), None);
    }

    #[test]
    fn test_remove_target_stops_aggregation_timer() {
        let mut fixture = Fixture::new();
        let engine = &mut fixture.engine;
        let protocol = engine.add_protocol("p", true);
        engine.reconfigure_protocol(&protocol, 269);
        let (iface, _) = engine.add_interface(&protocol, None, "eth0");
        let target = engine.add_target(&iface, "10.0.0.1".parse().unwrap()).unwrap();
        engine.register_provider(&protocol, 1, body_provider(vec![1]));

        engine.send(&target, 1, now()).unwrap();
        assert!(engine.poll_timeout().is_some());
        engine.remove_target(target);
        assert_eq!(engine.poll_timeout(), None);
        assert_eq!(engine.message_pool_outstanding(), 0, "queued messages released");
    }
}
