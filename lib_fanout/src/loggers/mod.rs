/// Tracing subscriber initialisation for binaries embedding the library.
pub mod setup;

pub use setup::setup_logging;
