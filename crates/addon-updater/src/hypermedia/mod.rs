//! Hypermedia catalog provider.

pub mod catalog;
mod provider;

pub use provider::HypermediaProvider;
