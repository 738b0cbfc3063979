//! Symswarm transfer engine: wire codec, block/symbol model, symbol scheduler and the
//! peer session state machine.
//! Host-driven: no sockets; host passes events and receives actions.

pub mod block;
pub mod descriptor;
pub mod identity;
pub mod integrity;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod tracker;
pub mod wire;

pub use block::{BlockAssembly, BlockLayout, CodingParams, Encoder, FileAssembly};
pub use descriptor::ContentDescriptor;
pub use identity::{InfoHash, PeerId};
pub use protocol::Message;
pub use scheduler::SymbolScheduler;
pub use session::{PeerSession, Role, SendOrder, SessionAction, SessionState, SymbolFeed};
pub use store::AssemblyStore;
pub use wire::{decode_frame, decode_handshake, encode_frame, encode_handshake, Frame};
