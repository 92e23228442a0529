//! privhelper-daemon - the privileged helper and the channel that reaches it.
//!
//! - [`protocol`]: framing, handshake, versioned request/reply messages,
//!   server-side dispatch and the [`ChannelClient`]
//! - [`listener`]: the helper's [`ServiceListener`] with its accept policy
//!   and connection registry
//! - [`operations`]: the privileged operation the shipped helper performs
//!
//! The `privhelperd` binary wires these together from an installed service
//! descriptor.

pub mod listener;
pub mod operations;
pub mod protocol;

pub use listener::{
    AcceptDecision, AcceptPolicy, CallerPolicy, ConnectionObserver, DenyAll, ListenerConfig,
    ListenerState, ServiceListener,
};
pub use operations::ProtectedFileAccess;
pub use protocol::{
    ChannelClient, ClientConfig, ConnectError, HelperDispatcher, PrivilegedOperation, Reply,
    Request, RequestHandler, RpcError,
};
