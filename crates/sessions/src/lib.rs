//! Session machinery: the session-key algebra, the single-flight registry,
//! the opaque key/value store, and the agent session directory.

pub mod directory;
pub mod kv;
pub mod registry;
pub mod session_key;

pub use directory::{AgentDirectory, DirectoryEntry, RouteFilter};
pub use kv::{KvStore, MemoryKv};
pub use registry::{AlreadyRegistered, SessionRegistry};
pub use session_key::SessionKey;
