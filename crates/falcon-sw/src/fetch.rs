//! Network capability injected into the controller.

use async_trait::async_trait;
use falcon_net::{NetError, Request, ResourceLoader, Response};

/// Performs a real network request on the controller's behalf.
///
/// A returned `Response` may carry any status; only transport failures are
/// errors.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: Request) -> Result<Response, NetError>;
}

#[async_trait]
impl Fetcher for ResourceLoader {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        ResourceLoader::fetch(self, request).await
    }
}
