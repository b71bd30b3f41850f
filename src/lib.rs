//! Plugin-extensible text generation engine.
//!
//! Requests run through an ordered chain of plugin hooks around a single
//! text-generation backend: pre-process hooks shape the prompt, the backend
//! generates, post-process hooks shape the answer.

pub mod backends;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod plugins;
pub mod process;

pub use backends::{Backend, BackendStrategy, GenerationParams, TokenIter, TokenStream};
pub use config::EngineConfig;
pub use error::{EngineError, Stage};
pub use pipeline::{Executor, PipelineState};
pub use plugins::{ModuleCatalog, Plugin, PluginModule, PluginRegistry, PluginSettings, PluginStore};
