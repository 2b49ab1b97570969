//! Engine orchestration around the consensus core: storage, locking,
//! dependency tracking and event delivery.

pub mod core;
pub mod dependencies;
pub mod events;
pub mod locks;
pub mod storage;

pub use self::core::{Engine, EngineConfig, EngineError, HandleOutcome};
pub use self::events::{ConsensusEvent, EventBus};
pub use self::storage::{SledStorage, Storage, StorageError};
