#![deny(clippy::print_stdout, clippy::print_stderr)]

mod facade;
mod telemetry;

pub use facade::ClaimsFacade;
pub use facade::FacadeError;
pub use facade::FacadeResult;
pub use telemetry::ClaimsTelemetry;
pub use telemetry::TelemetryCounters;
pub use telemetry::TelemetryRouterEventSink;
