//! Identity/ownership resolver trait.

use async_trait::async_trait;

use crate::error::Result;

/// Makes sure an owner/target identifier exists (e.g. upserts a user row)
/// before a task references it.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn ensure(&self, id: &str) -> Result<()>;
}

/// Resolver that accepts every identifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopResolver;

#[async_trait]
impl IdentityResolver for NoopResolver {
    async fn ensure(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}
