//! Live updates for running extension contexts.

mod broker;
mod protocol;

pub use broker::{plan_updates, BrokerPaths, ChangeSet, HmrBroker};
pub use protocol::{
    hot_module_path, ClientMessage, ConnectionId, ModuleUpdate, PacketKind, ServerMessage,
    Targets, UpdatePacket,
};
