mod command;
mod dispatch;
mod host;
mod ssh;
mod transport;

pub use command::{Command, FileUpload};
pub use dispatch::{dispatch, DispatchResult};
pub use host::{Credential, Host};
pub use ssh::SshConnector;
pub use transport::{Connect, ExecOutput, Session, TransportError};
