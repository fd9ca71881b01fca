//! Demo generator for local runs.

use std::time::Duration;

use async_trait::async_trait;
use millrace_core::errors::GeneratorError;
use millrace_core::generator::{FragmentStream, Generator};

/// Streams the query back word by word with a configurable delay, so the
/// gateway's chunking, buffering, and replay paths can be watched live.
pub struct DemoGenerator {
    delay: Duration,
}

impl DemoGenerator {
    /// Create a demo generator emitting one word per `delay`.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Generator for DemoGenerator {
    fn name(&self) -> &str {
        "demo"
    }

    async fn generate(&self, query: &str) -> Result<FragmentStream, GeneratorError> {
        let words: Vec<String> = std::iter::once("Echoing:".to_owned())
            .chain(query.split_whitespace().map(str::to_owned))
            .collect();
        let delay = self.delay;
        Ok(Box::pin(async_stream::stream! {
            for (i, word) in words.into_iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(delay).await;
                    yield Ok(format!(" {word}"));
                } else {
                    yield Ok(word);
                }
            }
        }))
    }
}
