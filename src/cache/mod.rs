use anyhow::Result;
use async_trait::async_trait;

/// Tells whether a model's assets are already materialized locally.
///
/// Only a UX signal: a miss never blocks initialization, it just changes
/// the first progress message from "loading" to "downloading".
#[async_trait]
pub trait CacheProbe: Send + Sync {
    async fn lookup(&self, model: &str) -> Result<bool>;

    /// Like [`lookup`](Self::lookup), but any error reads as a miss.
    async fn is_cached(&self, model: &str) -> bool {
        match self.lookup(model).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::debug!(model, error = %e, "cache probe failed; assuming not cached");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    struct Broken;

    #[async_trait]
    impl CacheProbe for Broken {
        async fn lookup(&self, _model: &str) -> Result<bool> {
            bail!("storage exploded")
        }
    }

    struct Always;

    #[async_trait]
    impl CacheProbe for Always {
        async fn lookup(&self, _model: &str) -> Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn errors_resolve_to_miss() {
        assert!(!Broken.is_cached("m").await);
    }

    #[tokio::test]
    async fn hits_pass_through() {
        assert!(Always.is_cached("m").await);
    }
}
