//! Fan-out coordinator for Concord.
//!
//! A prediction request is normalized and fingerprinted, then answered from
//! the response cache or by exactly one in-flight computation that calls every
//! backend concurrently under a shared deadline. Partial results are scored,
//! optionally handed to a secondary analyzer, and composed into one response.
//!
//! ```text
//! raw input -> Normalizer -> FingerprintCache -> FanOutDispatcher
//!           -> ScoreAggregator -> SecondaryStage -> ResponseComposer
//! ```

pub mod aggregator;
pub mod cache;
pub mod circuit_breaker;
pub mod composer;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod normalizer;
pub mod secondary;
pub mod status;

pub use aggregator::{NEUTRAL_COHERENCE, ScoreAggregator, Scores, coherence};
pub use cache::{CacheConfig, CacheConfigError, CacheLookup, CacheStats, FingerprintCache};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use composer::{ComposedResponse, PipelineState, ResponseComposer, SecondaryStatus};
pub use config::{ConfigError, CoordinatorConfig};
pub use coordinator::Coordinator;
pub use dispatcher::FanOutDispatcher;
pub use error::{CoordinatorError, ErrorReport, Result};
pub use health::{BackendHealth, HealthRegistry};
pub use normalizer::{Normalizer, fingerprint, normalize};
pub use secondary::{SecondaryOutcome, SecondaryStage};
pub use status::{BackendReport, CoordinatorStatus};
