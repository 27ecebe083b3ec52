pub mod acl;
pub mod config;
pub mod engine;
pub mod pool;
pub mod printer;
pub mod reader;
pub mod socket;
pub mod wire;
pub mod writer;

pub use acl::Acl;
pub use config::{Config, ConfigApplier};
pub use engine::{
    Engine, InterfaceEvent, InterfaceListener, InterfaceRef, ListenerId, ProtocolRef, TargetRef,
    DEFAULT_PROTOCOL, UNICAST_INTERFACE,
};
pub use pool::BufferPool;
pub use reader::{ConsumerId, InputContext, MessageConsumer, PacketParser};
pub use socket::{
    udp_factory, Family, InboundDatagram, PacketTransport, TransportConfig, TransportFactory,
    UdpTransport,
};
pub use wire::{Message, MessageFrame, Originator, ParseError};
pub use writer::{EmitError, MessageProvider, PacketAssembler, Selector, WriterInterfaceId};
