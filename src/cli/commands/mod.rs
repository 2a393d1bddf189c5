//! CLI command implementations

pub mod build;
pub mod config;
pub mod restore;
pub mod save;

pub use build::execute as build;
pub use config::execute as config;
pub use restore::execute as restore;
pub use save::execute as save;

/// Emit a phase output for the pipeline runner.
///
/// One `key=value` per line on stdout; everything else kiln prints goes
/// through tracing on stderr, so stdout stays machine-readable.
pub(crate) fn emit_output(key: &str, value: &str) {
    println!("{}={}", key, value);
}
