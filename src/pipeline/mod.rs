pub mod executor;
pub mod state;

pub use executor::Executor;
pub use state::PipelineState;
