use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const EXTENSION_NAME: &str = "enablevmaccess";
pub const EXTENSION_PUBLISHER: &str = "Microsoft.OSTCExtensions";
pub const EXTENSION_TYPE: &str = "VMAccessForLinux";
pub const EXTENSION_TYPE_HANDLER_VERSION: &str = "1.4";
pub const PROVISIONING_SUCCEEDED: &str = "Succeeded";

/// Subscription and resource group every call is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub subscription_id: String,
    pub resource_group: String,
}

impl Scope {
    pub fn new(subscription_id: impl Into<String>, resource_group: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            resource_group: resource_group.into(),
        }
    }

    /// Path of the VM collection below the management endpoint.
    pub fn vm_collection_path(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines",
            self.subscription_id, self.resource_group
        )
    }

    pub fn vm_path(&self, vm_name: &str) -> String {
        format!("{}/{}", self.vm_collection_path(), vm_name)
    }

    pub fn extension_path(&self, vm_name: &str) -> String {
        format!("{}/extensions/{}", self.vm_path(vm_name), EXTENSION_NAME)
    }
}

/// Credentials shipped to the VMAccess extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtectedSettings {
    pub username: String,
    #[serde(rename = "ssh_key")]
    pub ssh_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionProperties {
    pub publisher: String,
    #[serde(rename = "type")]
    pub extension_type: String,
    pub type_handler_version: String,
    pub settings: serde_json::Value,
    pub protected_settings: ProtectedSettings,
}

/// PUT body for the `enablevmaccess` extension resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtensionDescriptor {
    pub location: String,
    pub properties: ExtensionProperties,
}

impl ExtensionDescriptor {
    pub fn vm_access(location: &str, username: &str, ssh_key: &str) -> Self {
        Self {
            location: location.to_string(),
            properties: ExtensionProperties {
                publisher: EXTENSION_PUBLISHER.to_string(),
                extension_type: EXTENSION_TYPE.to_string(),
                type_handler_version: EXTENSION_TYPE_HANDLER_VERSION.to_string(),
                settings: serde_json::Value::Object(serde_json::Map::new()),
                protected_settings: ProtectedSettings {
                    username: username.to_string(),
                    ssh_key: ssh_key.to_string(),
                },
            },
        }
    }

    pub fn extension_type(&self) -> &str {
        &self.properties.extension_type
    }
}

/// Provisioning state per extension type, as seen in one VM GET.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionStatusRecord {
    states: BTreeMap<String, String>,
}

impl ExtensionStatusRecord {
    pub fn insert(&mut self, extension_type: impl Into<String>, state: impl Into<String>) {
        self.states.insert(extension_type.into(), state.into());
    }

    pub fn state_of(&self, extension_type: &str) -> Option<&str> {
        self.states.get(extension_type).map(String::as_str)
    }

    pub fn is_succeeded(&self, extension_type: &str) -> bool {
        self.state_of(extension_type) == Some(PROVISIONING_SUCCEEDED)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.states.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ExtensionStatusRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Self::default();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

/// Status and raw body of an accepted PUT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResponse {
    pub status: u16,
    pub body: String,
}

// Wire shapes. Only the fields the rotator reads are declared; serde skips
// the rest of the VM document.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VmListPage {
    #[serde(default)]
    pub value: Vec<VmSummary>,
    #[serde(default)]
    pub next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VmSummary {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VirtualMachine {
    #[serde(default)]
    pub resources: Vec<ExtensionResource>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ExtensionResource {
    #[serde(default)]
    pub properties: Option<ExtensionResourceProperties>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ExtensionResourceProperties {
    #[serde(rename = "type", default)]
    pub extension_type: Option<String>,
    #[serde(default)]
    pub provisioning_state: Option<String>,
}

impl From<VirtualMachine> for ExtensionStatusRecord {
    fn from(vm: VirtualMachine) -> Self {
        vm.resources
            .into_iter()
            .filter_map(|r| r.properties)
            .filter_map(|p| {
                let extension_type = p.extension_type?;
                Some((extension_type, p.provisioning_state.unwrap_or_default()))
            })
            .collect()
    }
}
