//! WebDriverAgent Protocol Types
//!
//! Defines the JSON shapes exchanged with a running WebDriverAgent and the
//! configuration of the two proxy channels that talk to it.

pub mod channel;
pub mod error;
pub mod response;
pub mod status;

pub use channel::{ChannelRole, ProxyConfig};
pub use error::AgentError;
pub use response::AgentResponse;
pub use status::{AgentStatus, BuildInfo, IosInfo, OsInfo};

/// Port WebDriverAgent listens on inside the device.
pub const WDA_AGENT_PORT: u16 = 8100;

/// Host used when the agent is reached through a local port.
pub const WDA_BASE_HOST: &str = "localhost";

/// Bundle identifier of the installed runner application.
pub const WDA_BUNDLE_ID: &str = "com.apple.test.WebDriverAgentRunner-Runner";

/// Route polled to decide whether the agent is reachable.
pub const STATUS_PATH: &str = "/status";
