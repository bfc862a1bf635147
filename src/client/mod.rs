//! QuorumKV's client functionality modules.

mod apistub;
mod kvclient;

pub use apistub::{ClientApiStub, ClientRecvStub, ClientSendStub};
pub use kvclient::KvClient;

/// Client stub ID type.
pub type ClientId = u64;
