pub mod animation;
pub mod clock_sync;
pub mod cycle;
pub mod cycle_store;
pub mod engine;
pub mod error;
pub mod history;
pub mod ledger;
pub mod outcome;
pub mod remote;

pub use engine::{
    Engine,
    EngineConfig,
    EngineEvent,
    EngineSnapshot,
};
