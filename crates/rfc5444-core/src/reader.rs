//! Inbound packet parsing and message dispatch.
//!
//! [`PacketParser`] validates the packet header, walks the contained
//! messages, and hands each one to the consumers registered for its message
//! type. Message bodies stay opaque; consumers bring their own TLV and
//! address-block handling. Every parsed message is additionally offered to
//! a forwarding hook supplied by the caller.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::wire::{Message, MessageIter, PacketHeader, ParseError};

/// Where the packet being handled came from. Published to consumers for the
/// duration of packet handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputContext {
    pub address: SocketAddr,
    pub interface: String,
}

/// Handler for messages of one registered type.
pub trait MessageConsumer {
    fn on_message(&mut self, input: &InputContext, msg: &Message<'_>);
}

impl<F> MessageConsumer for F
where
    F: FnMut(&InputContext, &Message<'_>),
{
    fn on_message(&mut self, input: &InputContext, msg: &Message<'_>) {
        (self)(input, msg)
    }
}

/// Token returned by consumer registration, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerId(u64);

pub struct PacketParser {
    consumers: BTreeMap<u8, Vec<(ConsumerId, Box<dyn MessageConsumer>)>>,
    next_id: u64,
}

impl Default for PacketParser {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketParser {
    pub fn new() -> Self {
        Self { consumers: BTreeMap::new(), next_id: 0 }
    }

    pub fn register_consumer(
        &mut self,
        msg_type: u8,
        consumer: Box<dyn MessageConsumer>,
    ) -> ConsumerId {
        let id = ConsumerId(self.next_id);
        self.next_id += 1;
        self.consumers.entry(msg_type).or_default().push((id, consumer));
        id
    }

    pub fn remove_consumer(&mut self, id: ConsumerId) {
        for list in self.consumers.values_mut() {
            list.retain(|(cid, _)| *cid != id);
        }
        self.consumers.retain(|_, list| !list.is_empty());
    }

    /// Parse one packet. Consumers run per message in wire order; `forward`
    /// is offered every message afterwards so the engine can decide about
    /// retransmission. Messages without a registered consumer are skipped
    /// silently.
    pub fn handle_packet(
        &mut self,
        input: &InputContext,
        data: &[u8],
        forward: &mut dyn FnMut(&Message<'_>),
    ) -> Result<(), ParseError> {
        let (_header, offset) = PacketHeader::decode(data)?;
        for item in MessageIter::new(&data[offset..]) {
            let msg = item?;
            if let Some(list) = self.consumers.get_mut(&msg.msg_type) {
                for (_, consumer) in list.iter_mut() {
                    consumer.on_message(input, &msg);
                }
            }
            forward(&msg);
        }
        Ok(())
    }
}
