use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::Path;
use std::time::Duration;

use crate::azure::{ArmClientConfig, ExtensionDescriptor, Scope};
use crate::lifecycle::{LifecyclePolicy, PollPolicy};

const PUBLIC_KEY_PREFIXES: [&str; 3] = ["ssh-", "ecdsa-sha2-", "sk-"];

#[derive(Parser, Debug, Clone)]
#[command(
    name = "vmaccess-rotator",
    version,
    about = "Re-provision the VMAccess extension with a fresh SSH key on every VM in a resource group"
)]
pub struct Config {
    /// Azure subscription ID
    #[arg(value_name = "SUBSCRIPTION_ID")]
    pub subscription_id: String,

    /// Resource group holding the virtual machines
    #[arg(value_name = "RESOURCE_GROUP")]
    pub resource_group: String,

    /// Bearer token for the management API
    #[arg(value_name = "BEARER_TOKEN")]
    pub bearer_token: String,

    /// SSH public key, or a path to a file containing it
    #[arg(value_name = "SSH_KEY")]
    pub ssh_key: String,

    /// Location of the VMs (e.g. westeurope)
    #[arg(value_name = "LOCATION")]
    pub location: String,

    /// User account the extension provisions
    #[arg(long, env = "VMACCESS_USERNAME", default_value = "azureuser")]
    pub username: String,

    /// Management API base URL
    #[arg(long, env = "MANAGEMENT_ENDPOINT", default_value = "https://management.azure.com")]
    pub management_endpoint: String,

    /// Seconds to wait after deleting the existing extension
    #[arg(long, env = "DELETE_SETTLE_SECONDS", default_value = "20")]
    pub delete_settle_seconds: u64,

    /// Seconds to wait after submitting the new extension
    #[arg(long, env = "INSTALL_SETTLE_SECONDS", default_value = "10")]
    pub install_settle_seconds: u64,

    /// Seconds between extension status reads
    #[arg(long, env = "POLL_INTERVAL_SECONDS", default_value = "10")]
    pub poll_interval_seconds: u64,

    /// Status reads per VM before giving up
    #[arg(long, env = "POLL_MAX_ATTEMPTS", default_value = "30")]
    pub poll_max_attempts: u32,

    /// Timeout for each management API call in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECONDS", default_value = "60")]
    pub request_timeout_seconds: u64,

    /// Number of VMs processed in parallel
    #[arg(long, env = "CONCURRENCY", default_value = "1")]
    pub concurrency: usize,

    /// Abort the run after this many seconds
    #[arg(long, env = "DEADLINE_SECONDS")]
    pub deadline_seconds: Option<u64>,

    /// Disable TLS certificate validation (test environments only)
    #[arg(long, env = "INSECURE_SKIP_TLS_VERIFY", default_value = "false")]
    pub insecure_skip_tls_verify: bool,

    /// Do not poll a VM whose install request failed
    #[arg(long, env = "SKIP_POLL_AFTER_FAILED_PUT", default_value = "false")]
    pub skip_poll_after_failed_put: bool,

    /// Log format: json or pretty
    #[arg(long, env = "LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("subscription ID", &self.subscription_id),
            ("resource group", &self.resource_group),
            ("bearer token", &self.bearer_token),
            ("SSH key", &self.ssh_key),
            ("location", &self.location),
            ("username", &self.username),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                bail!("{name} must not be empty");
            }
        }

        if !self.management_endpoint.starts_with("https://")
            && !self.management_endpoint.starts_with("http://")
        {
            bail!(
                "management endpoint must be an http(s) URL, got '{}'",
                self.management_endpoint
            );
        }
        if self.poll_max_attempts == 0 {
            bail!("poll max attempts must be at least 1");
        }
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.request_timeout_seconds == 0 {
            bail!("request timeout must be at least 1 second");
        }

        Ok(())
    }

    /// The public key itself, read from disk when the argument names a file.
    pub fn resolve_ssh_key(&self) -> Result<String> {
        let path = Path::new(&self.ssh_key);
        let key = if path.is_file() {
            let key = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read SSH key from {}", path.display()))?;
            if key.trim().is_empty() {
                bail!("SSH key file {} is empty", path.display());
            }
            key.trim().to_string()
        } else {
            self.ssh_key.trim().to_string()
        };

        if key.contains("PRIVATE KEY") {
            bail!("SSH key argument holds a private key, pass the public key instead");
        }
        if !PUBLIC_KEY_PREFIXES.iter().any(|prefix| key.starts_with(prefix)) {
            bail!(
                "SSH key '{}' is neither a readable file nor an OpenSSH public key",
                self.ssh_key
            );
        }
        Ok(key)
    }

    pub fn scope(&self) -> Scope {
        Scope::new(&self.subscription_id, &self.resource_group)
    }

    pub fn descriptor(&self, ssh_key: &str) -> ExtensionDescriptor {
        ExtensionDescriptor::vm_access(&self.location, &self.username, ssh_key)
    }

    pub fn arm_client_config(&self) -> ArmClientConfig {
        ArmClientConfig {
            endpoint: self.management_endpoint.clone(),
            bearer_token: self.bearer_token.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_seconds),
            insecure_skip_tls_verify: self.insecure_skip_tls_verify,
        }
    }

    pub fn lifecycle_policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            delete_settle: Duration::from_secs(self.delete_settle_seconds),
            install_settle: Duration::from_secs(self.install_settle_seconds),
            poll: PollPolicy {
                max_attempts: self.poll_max_attempts,
                interval: Duration::from_secs(self.poll_interval_seconds),
            },
            poll_after_failed_put: !self.skip_poll_after_failed_put,
        }
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_seconds.map(Duration::from_secs)
    }

    pub fn display(&self) {
        tracing::info!(
            subscription_id = %self.subscription_id,
            resource_group = %self.resource_group,
            location = %self.location,
            username = %self.username,
            management_endpoint = %self.management_endpoint,
            bearer_token = "<redacted>",
            delete_settle_seconds = self.delete_settle_seconds,
            install_settle_seconds = self.install_settle_seconds,
            poll_interval_seconds = self.poll_interval_seconds,
            poll_max_attempts = self.poll_max_attempts,
            request_timeout_seconds = self.request_timeout_seconds,
            concurrency = self.concurrency,
            deadline_seconds = ?self.deadline_seconds,
            poll_after_failed_put = !self.skip_poll_after_failed_put,
            log_format = %self.log_format,
            log_level = %self.log_level,
            "Configuration initialized"
        );

        if self.insecure_skip_tls_verify {
            tracing::warn!("INSECURE MODE ENABLED - TLS certificates of the management endpoint are not validated");
        }
    }
}
