pub mod config;
pub mod dispatcher;
pub mod estimate;
pub mod execution_control;
pub mod progress_bus;
pub mod research_engine;
pub mod research_events;
