pub mod codec;
pub mod config;
pub mod conn;
pub mod error;
pub mod frame;
pub mod poller;
pub mod protocol;
pub mod retry;
pub mod seq;
pub mod session;
pub mod shots;
pub mod sim;

pub use config::PollerConfig;
pub use conn::{ConnError, Correlator, Inbound, LinkState, Transport};
pub use error::WireError;
pub use frame::LineSplitter;
pub use poller::{PollPhase, Poller, PollerEvent, StopReason};
pub use protocol::{Command, DeviceError, ErrorKind, Message, SessionState};
pub use retry::RetryPolicy;
pub use session::{SessionToken, Snapshot};
pub use shots::{FillError, ShotBook, ShotSlot, format_seconds};
