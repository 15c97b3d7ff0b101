//! Fallback providers: remote config polling and the fallback registry

pub mod fetcher;
pub mod handoff;
pub mod registry;

pub use fetcher::{ConfigFetcher, ConfigSource, HttpConfigSource};
pub use handoff::{ConfigPublisher, ConfigReceiver};
pub use registry::{
    policy_for, FallbackRegistry, FirstFallback, RoundRobin, SelectionPolicy, TrustedFallback,
};
