//! Azure Resource Manager access for the VMAccess extension.
//!
//! [`ControlPlane`] is the seam the lifecycle and fleet code drive; the
//! production implementation is [`ArmClient`], tests use a scripted mock.

mod client;
#[cfg(test)]
pub(crate) mod mock;
mod types;

use async_trait::async_trait;

use crate::error::RotatorError;

pub use client::{ArmClient, ArmClientConfig};
pub use types::{
    EXTENSION_NAME, EXTENSION_PUBLISHER, EXTENSION_TYPE, EXTENSION_TYPE_HANDLER_VERSION,
    ExtensionDescriptor, ExtensionProperties, ExtensionStatusRecord, PROVISIONING_SUCCEEDED,
    ProtectedSettings, PutResponse, Scope,
};

pub const VM_LIST_API_VERSION: &str = "2018-06-01";
pub const VM_API_VERSION: &str = "2018-10-01";

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Names of every VM in the scope, in listing order.
    async fn list_vms(&self, scope: &Scope) -> Result<Vec<String>, RotatorError>;

    /// Delete the `enablevmaccess` extension. An absent extension is success.
    async fn delete_extension(&self, scope: &Scope, vm_name: &str) -> Result<u16, RotatorError>;

    /// Submit the extension. Acceptance only; completion is observed by polling.
    async fn put_extension(
        &self,
        scope: &Scope,
        vm_name: &str,
        descriptor: &ExtensionDescriptor,
    ) -> Result<PutResponse, RotatorError>;

    async fn get_extension_status(
        &self,
        scope: &Scope,
        vm_name: &str,
    ) -> Result<ExtensionStatusRecord, RotatorError>;
}
