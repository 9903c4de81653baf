//! Engine adapter layer.
//!
//! Each supported coding-agent backend is wrapped by an adapter implementing
//! the [`EngineAdapter`] contract: process lifecycle, protocol translation
//! into the canonical part/message model, and event publication. The gateway
//! crate registers adapters with its engine manager and never talks to a
//! backend directly.

pub mod assembler;
pub mod engine;
pub mod error;
pub mod events;
pub mod http;
pub mod ids;
pub mod mock;
pub mod model;
pub mod process;
pub mod stdio;

pub use engine::{EngineAdapter, EngineCapabilities, EngineInfo, EngineState, SendOptions};
pub use error::{EngineError, Result};
pub use events::{EngineEvent, EventBus};
