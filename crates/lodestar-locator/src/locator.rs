use async_trait::async_trait;
use lodestar_common::protocol::{Endpoint, Identity, LodestarError, Reference, Result};

/// Client view of a locator service.
///
/// `find_adapter_by_id` and `find_object_by_id` are understood by every
/// locator. `resolve_location` and `resolve_well_known_proxy` are newer; the
/// default implementations answer `OperationNotExist`, which makes the
/// resolver fall back to the older calls.
///
/// "Not found" may be reported either as `Ok(None)` or as an
/// `AdapterNotFound`/`ObjectNotFound` error; both mean "no endpoints".
#[async_trait]
pub trait Locator: Send + Sync {
    async fn find_adapter_by_id(&self, adapter_id: &str) -> Result<Option<Reference>>;

    async fn find_object_by_id(&self, identity: &Identity, facet: &str) -> Result<Option<Reference>>;

    async fn resolve_location(&self, _location: &[String]) -> Result<Vec<Endpoint>> {
        Err(LodestarError::OperationNotExist("resolve_location".to_string()))
    }

    /// Returns endpoints, or a location to resolve further when there are none.
    async fn resolve_well_known_proxy(
        &self,
        _identity: &Identity,
        _facet: &str,
    ) -> Result<(Vec<Endpoint>, Vec<String>)> {
        Err(LodestarError::OperationNotExist(
            "resolve_well_known_proxy".to_string(),
        ))
    }
}
