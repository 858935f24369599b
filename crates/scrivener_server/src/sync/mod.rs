mod connection;
mod manager;
mod session;

pub use connection::ClientConnection;
pub use manager::{Admission, Connect, SessionManager, SyncStats};
pub use session::{
    DocumentSession, IdleCompaction, JoinedState, SessionConfig, SessionEvent, SessionStores,
};
