//! Outbound message assembly and packet flushing.
//!
//! [`PacketAssembler`] keeps a registry of message content providers keyed
//! by message id and one queue of framed messages per registered writer
//! interface (one per dispatch target). `create_message` routes a freshly
//! framed message to the writer interfaces admitted by a selector;
//! `flush` drains a queue into as few packets as fit and stamps each packet
//! header, incrementing the interface's packet sequence number when asked
//! to.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use crate::pool::{BufferPool, PooledBuf};
use crate::wire::{MessageFrame, PacketHeader, MAX_MESSAGE_SIZE, MAX_PACKET_SIZE};

/// Writer-side failure. Mirrors the result codes of a full RFC 5444 writer
/// closely enough for logging and abandon decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitError {
    /// No content provider registered for the message id.
    NoProvider(u8),
    /// Framed message exceeds the maximum message size.
    MessageTooLarge(usize),
    /// Writer interface id is not (or no longer) registered.
    UnknownInterface,
    /// Writer interface registry is at capacity.
    InterfaceLimit,
    /// The content provider refused to produce the message.
    ProviderAborted,
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmitError::NoProvider(id) => write!(f, "no content provider for message id {id}"),
            EmitError::MessageTooLarge(n) => write!(f, "message of {n} bytes exceeds limit"),
            EmitError::UnknownInterface => write!(f, "writer interface not registered"),
            EmitError::InterfaceLimit => write!(f, "writer interface registry full"),
            EmitError::ProviderAborted => write!(f, "content provider aborted"),
        }
    }
}

impl std::error::Error for EmitError {}

/// Produces the content of one message id on demand.
pub trait MessageProvider {
    fn produce(&mut self, frame: &mut MessageFrame) -> Result<(), EmitError>;
}

impl<F> MessageProvider for F
where
    F: FnMut(&mut MessageFrame) -> Result<(), EmitError>,
{
    fn produce(&mut self, frame: &mut MessageFrame) -> Result<(), EmitError> {
        (self)(frame)
    }
}

/// Handle of a registered writer interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WriterInterfaceId(u32);

/// Chooses which writer interfaces receive a created or forwarded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    /// Exactly one writer interface.
    Single(WriterInterfaceId),
    /// Every registered writer interface.
    All,
}

impl Selector {
    fn admits(&self, id: WriterInterfaceId) -> bool {
        match self {
            Selector::Single(single) => *single == id,
            Selector::All => true,
        }
    }
}

struct WifState {
    queue: VecDeque<PooledBuf>,
    last_seqno: u16,
}

pub struct PacketAssembler {
    providers: BTreeMap<u8, Box<dyn MessageProvider>>,
    interfaces: BTreeMap<WriterInterfaceId, WifState>,
    next_id: u32,
    max_interfaces: usize,
    msg_pool: BufferPool,
}

/// Writer interfaces accepted before registration fails. Dispatch targets
/// are bounded by the number of local interfaces and multicast groups, so
/// hitting this means a target leak.
const DEFAULT_INTERFACE_LIMIT: usize = 64;

impl PacketAssembler {
    pub fn new(msg_pool: BufferPool) -> Self {
        Self {
            providers: BTreeMap::new(),
            interfaces: BTreeMap::new(),
            next_id: 0,
            max_interfaces: DEFAULT_INTERFACE_LIMIT,
            msg_pool,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_interface_limit(&mut self, limit: usize) {
        self.max_interfaces = limit;
    }

    pub fn register_provider(&mut self, msgid: u8, provider: Box<dyn MessageProvider>) {
        self.providers.insert(msgid, provider);
    }

    pub fn remove_provider(&mut self, msgid: u8) {
        self.providers.remove(&msgid);
    }

    /// Register a dispatch path. `last_seqno` seeds the packet sequence
    /// counter; the first emitted packet carries `last_seqno + 1`.
    pub fn register_interface(&mut self, last_seqno: u16) -> Result<WriterInterfaceId, EmitError> {
        if self.interfaces.len() >= self.max_interfaces {
            return Err(EmitError::InterfaceLimit);
        }
        let id = WriterInterfaceId(self.next_id);
        self.next_id += 1;
        self.interfaces.insert(id, WifState { queue: VecDeque::new(), last_seqno });
        Ok(id)
    }

    /// Drop a dispatch path together with any accumulated messages.
    pub fn unregister_interface(&mut self, id: WriterInterfaceId) {
        self.interfaces.remove(&id);
    }

    pub fn last_seqno(&self, id: WriterInterfaceId) -> Option<u16> {
        self.interfaces.get(&id).map(|wif| wif.last_seqno)
    }

    /// Whether a dispatch path has accumulated messages awaiting a flush.
    pub fn has_pending(&self, id: WriterInterfaceId) -> bool {
        self.interfaces.get(&id).is_some_and(|wif| !wif.queue.is_empty())
    }

    /// Frame one message from the provider registered for `msgid` and queue
    /// it on every admitted writer interface.
    pub fn create_message(&mut self, msgid: u8, selector: Selector) -> Result<(), EmitError> {
        let provider = self
            .providers
            .get_mut(&msgid)
            .ok_or(EmitError::NoProvider(msgid))?;

        let mut frame = MessageFrame::new(msgid);
        provider.produce(&mut frame)?;
        frame.msg_type = msgid;
        let encoded = frame.encode();
        if encoded.len() > MAX_MESSAGE_SIZE {
            return Err(EmitError::MessageTooLarge(encoded.len()));
        }

        self.enqueue(&encoded, selector);
        Ok(())
    }

    /// Queue an already framed message (a received one being retransmitted)
    /// on every admitted writer interface.
    pub fn forward_msg(&mut self, raw: &[u8], selector: Selector) -> Result<(), EmitError> {
        if raw.len() > MAX_MESSAGE_SIZE {
            return Err(EmitError::MessageTooLarge(raw.len()));
        }
        self.enqueue(raw, selector);
        Ok(())
    }

    fn enqueue(&mut self, encoded: &[u8], selector: Selector) {
        for (id, wif) in self.interfaces.iter_mut() {
            if selector.admits(*id) {
                wif.queue.push_back(self.msg_pool.acquire_from(encoded));
            }
        }
    }

    /// Drain the queue of one writer interface into finished packets, FIFO.
    /// Messages are packed greedily up to the packet size limit unless
    /// `fragmented` forces one message per packet. With `include_seqno` each
    /// packet header carries the incremented packet sequence number.
    pub fn flush(
        &mut self,
        id: WriterInterfaceId,
        fragmented: bool,
        include_seqno: bool,
    ) -> Result<Vec<Vec<u8>>, EmitError> {
        let wif = self.interfaces.get_mut(&id).ok_or(EmitError::UnknownInterface)?;

        let mut packets = Vec::new();
        while !wif.queue.is_empty() {
            let seqno = include_seqno.then(|| {
                wif.last_seqno = wif.last_seqno.wrapping_add(1);
                wif.last_seqno
            });
            let header = PacketHeader { seqno };

            let mut packet = Vec::with_capacity(MAX_PACKET_SIZE);
            header.encode_into(&mut packet);
            while let Some(msg) = wif.queue.front() {
                if packet.len() + msg.len() > MAX_PACKET_SIZE {
                    break;
                }
                packet.extend_from_slice(msg);
                wif.queue.pop_front();
                if fragmented {
                    break;
                }
            }
            packets.push(packet);
        }
        Ok(packets)
    }
}
