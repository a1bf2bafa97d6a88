pub mod clock_sync;
pub mod conflated_state;
pub mod consumer;
pub mod heartbeat;
pub mod history_loader;
pub mod knobs;
pub mod mock;
pub mod producer;
pub mod shutdown;
pub mod telemetry;
pub mod types;

pub use conflated_state::ConflatedState;
pub use knobs::SessionKnobs;
pub use telemetry::PipelineTelemetry;
