//! Local tunnelling proxy for interactive apps running inside compute
//! sessions. Each tunnel is a local TCP listener whose connections are
//! bridged to the cluster gateway over an authenticated WebSocket.

pub mod bind;
pub mod credentials;
pub mod manager;
pub mod page;
pub mod port;
pub mod sign;
pub mod transport;
pub mod tunnel;
pub mod upstream;

#[cfg(test)]
mod testing;

pub use credentials::{AuthMode, CredentialState, Credentials, SessionHeader};
pub use manager::{Manager, ManagerConfig, ManagerError, TunnelInfo};
pub use port::PortRange;
pub use upstream::{AppRequest, EndpointKind};
