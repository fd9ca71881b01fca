//! The generator boundary.
//!
//! The text-generation engine is an external collaborator. Its entire
//! contract with this subsystem: given a query, produce a lazy stream of
//! text fragments terminated by stream end (success) or an error item, and
//! tolerate being dropped mid-stream (cooperative cancellation — the caller
//! simply stops polling).
//!
//! The trait returns a boxed [`Stream`], so the engine may run on any
//! execution context; the streamer never assumes it shares one with
//! connection I/O.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::errors::GeneratorError;

/// Boxed stream of text fragments produced for one query.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, GeneratorError>> + Send>>;

/// The external text-generation engine.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Engine name for logs and metrics labels.
    fn name(&self) -> &str;

    /// Start generating for `query`.
    ///
    /// Returns the fragment stream, or an error if generation could not
    /// start at all. Dropping the stream cancels generation; an engine
    /// must not require further polling to release resources.
    async fn generate(&self, query: &str) -> Result<FragmentStream, GeneratorError>;
}
