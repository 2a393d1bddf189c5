//! Kiln - CI build-cache orchestrator
//!
//! Coordinates a content-addressed remote cache with docker buildx,
//! exposing restore/build/save lifecycle hooks to a pipeline runner. The
//! centerpiece is the registry-proxy backend: a locally spawned process
//! that impersonates a container registry so buildx's native registry
//! cache driver transparently reads and writes the remote store.

pub mod buildx;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod proxy;
pub mod refs;
pub mod state;
pub mod topology;

pub use error::{KilnError, KilnResult};
