//! SSH tunneling for database connections behind a bastion.
//!
//! - `TunnelManager` - one tunnel per connection id, shared by concurrent callers
//! - `SystemSshConnector` - sessions backed by the system ssh binary
//! - `ActiveTunnel` - local listener forwarding each connection through a session

mod keys;
mod manager;
mod session;
mod system;
mod tunnel;
mod types;

pub use keys::{read_private_key, resolve_key_path};
pub use manager::{DEFAULT_BASE_PORT, TunnelManager};
pub use session::{ForwardedChannel, SecureSession, SessionConnector, SessionTarget};
pub use system::{SystemSshConnector, classify_ssh_stderr};
pub use tunnel::ActiveTunnel;
pub use types::{DEFAULT_SSH_PORT, SshTunnelConfig, TunnelState, TunnelStatus};
