//! Sessions, credentials and the turns that run through them

mod credential;
mod error;
mod orchestrator;
mod pool;
mod registry;
mod tier;

pub use credential::{Credential, CredentialSpec, TurnGuard, TurnState};
pub use error::{ChatError, OVERLOAD_MESSAGE, RATE_LIMIT_MESSAGE};
pub use orchestrator::{Delta, Deltas, FragmentStream, Orchestrator};
pub use pool::CredentialPool;
pub use registry::{DEFAULT_STALE_AFTER, SessionRegistry, UserSession};
pub use tier::{ModelTier, TierSelection};

pub use crate::upstream::Cursor;
