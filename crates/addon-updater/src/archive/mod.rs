//! ZIP-archive update provider.

pub mod discovery;
mod provider;

pub use provider::ArchiveProvider;
