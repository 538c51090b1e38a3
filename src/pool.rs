//! Article pool interface — the NNTP client capability this crate consumes.
//!
//! The pool itself (connection pooling, NNTP protocol, yEnc/UU decoding) is
//! an external collaborator; the read path only depends on this trait.

use async_trait::async_trait;

use crate::error::{ReaderError, Result};

/// Opaque capability for fetching a decoded article body.
///
/// Implementations are responsible for connection pooling and protocol
/// decoding; callers treat the result as an opaque byte stream.
#[async_trait]
pub trait ArticlePool: Send + Sync {
    /// Fetch the decoded body of `message_id`, writing it into `sink`.
    /// Returns the number of bytes written.
    ///
    /// Errors: `ReaderError::ArticleNotFound` is permanent and must never be
    /// retried by the caller; `ReaderError::DataCorruption` indicates the
    /// pool detected corruption while decoding; any other error is
    /// transient (timeout, connectivity, pool exhaustion).
    async fn body_stream(&self, message_id: &str, sink: &mut Vec<u8>) -> Result<usize>;
}

/// In-memory test double for `ArticlePool`, used by the test suite to
/// inject out-of-order completions and specific failure modes without a
/// real NNTP connection.
#[cfg(any(test, feature = "test-util"))]
pub mod stub {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Clone)]
    pub enum Behavior {
        Ok(Vec<u8>),
        NotFound,
        Corrupt,
        Transient,
        Delay(Duration, Box<Behavior>),
    }

    /// A stub article pool whose per-message behavior is configured ahead
    /// of time. Useful for simulating out-of-order completion and permanent
    /// vs. transient failures.
    #[derive(Default)]
    pub struct StubPool {
        behaviors: Mutex<HashMap<String, Behavior>>,
        attempts: Mutex<HashMap<String, u32>>,
    }

    impl StubPool {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub async fn set(&self, message_id: impl Into<String>, behavior: Behavior) {
            self.behaviors.lock().await.insert(message_id.into(), behavior);
        }

        pub async fn attempts_for(&self, message_id: &str) -> u32 {
            self.attempts.lock().await.get(message_id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl ArticlePool for StubPool {
        async fn body_stream(&self, message_id: &str, sink: &mut Vec<u8>) -> Result<usize> {
            {
                let mut attempts = self.attempts.lock().await;
                *attempts.entry(message_id.to_string()).or_insert(0) += 1;
            }

            let behavior = {
                let behaviors = self.behaviors.lock().await;
                behaviors.get(message_id).cloned().unwrap_or(Behavior::NotFound)
            };

            Self::resolve(message_id, behavior, sink).await
        }
    }

    impl StubPool {
        fn resolve<'a>(
            message_id: &'a str,
            behavior: Behavior,
            sink: &'a mut Vec<u8>,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<usize>> + Send + 'a>>
        {
            Box::pin(async move {
                match behavior {
                    Behavior::Ok(bytes) => {
                        sink.extend_from_slice(&bytes);
                        Ok(bytes.len())
                    }
                    Behavior::NotFound => Err(ReaderError::ArticleNotFound {
                        message_id: message_id.to_string(),
                    }),
                    Behavior::Corrupt => Err(ReaderError::DataCorruption {
                        reason: format!("corrupt article {message_id}"),
                    }),
                    Behavior::Transient => {
                        Err(ReaderError::Transient(format!("transient failure for {message_id}")))
                    }
                    Behavior::Delay(d, inner) => {
                        tokio::time::sleep(d).await;
                        Self::resolve(message_id, *inner, sink).await
                    }
                }
            })
        }
    }
}
