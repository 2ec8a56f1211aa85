//! Configuration management for the IMS service
//!
//! Assembled once at startup from defaults, the environment (a `.env`
//! file is loaded first) and command line flags, then shared read-only.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};

/// Application configuration
#[derive(Debug, Clone, Parser)]
#[command(name = "ims-service", about = "Image management control plane", version)]
pub struct Config {
    /// API server host
    #[arg(long, env = "IMS_HOST", default_value = "0.0.0.0")]
    pub api_host: String,

    /// API server port
    #[arg(long, env = "IMS_PORT", default_value_t = 9100)]
    pub api_port: u16,

    /// Directory holding the record store files
    #[arg(long, env = "IMS_DATA_DIR", default_value = "/var/ims/data")]
    pub data_dir: PathBuf,

    /// Directory of job templates overriding the built-in ones
    #[arg(long, env = "IMS_TEMPLATES_DIR")]
    pub templates_dir: Option<PathBuf>,

    /// Namespace jobs are launched in
    #[arg(long, env = "DEFAULT_IMS_JOB_NAMESPACE", default_value = "ims")]
    pub job_namespace: String,

    /// URL jobs use to report status back to this service
    #[arg(
        long,
        env = "IMS_CALLBACK_URL",
        default_value = "http://cray-ims.services.svc.cluster.local"
    )]
    pub callback_url: String,

    #[arg(long, env = "KUBERNETES_API_URL", default_value = "https://kubernetes.default.svc")]
    pub kubernetes_api_url: String,

    /// Bearer token for the Kubernetes API, read at startup if present
    #[arg(
        long,
        env = "KUBERNETES_TOKEN_FILE",
        default_value = "/var/run/secrets/kubernetes.io/serviceaccount/token"
    )]
    pub kubernetes_token_file: PathBuf,

    /// Bound on a single job submission, in seconds
    #[arg(long, env = "IMS_SUBMIT_TIMEOUT_SECS", default_value_t = 30)]
    pub submit_timeout_secs: u64,

    /// Offload customize jobs to remote build nodes when any are enabled
    #[arg(long, env = "IMS_REMOTE_OFFLOAD", default_value_t = false, action = ArgAction::Set)]
    pub remote_offload: bool,

    #[arg(long, env = "IMS_REMOTE_SSH_USER", default_value = "root")]
    pub remote_ssh_user: String,

    #[arg(long, env = "IMS_REMOTE_SSH_KEY", default_value = "/app/id_ecdsa")]
    pub remote_ssh_key: PathBuf,

    /// Root of the filesystem object store
    #[arg(long, env = "IMS_OBJECT_STORE_ROOT", default_value = "/var/ims/objects")]
    pub object_store_root: PathBuf,

    /// Owner tag of objects written through this service
    #[arg(long, env = "IMS_SERVICE_OWNER", default_value = "ims")]
    pub service_owner: String,

    /// Owner tag of objects written through the administrative path
    #[arg(long, env = "IMS_ADMIN_OWNER", default_value = "sts")]
    pub admin_owner: String,

    #[arg(long, env = "S3_BOOT_IMAGES_BUCKET", default_value = "boot-images")]
    pub boot_images_bucket: String,

    /// Whether jobs need DKMS when neither the request nor the recipe says
    #[arg(long, env = "JOB_ENABLE_DKMS", default_value_t = false, action = ArgAction::Set)]
    pub job_enable_dkms: bool,

    /// Runtime class for jobs that need DKMS
    #[arg(long, env = "JOB_KATA_RUNTIME", default_value = "kata-qemu")]
    pub job_kata_runtime: String,

    /// Runtime class for aarch64 jobs
    #[arg(long, env = "JOB_AARCH64_RUNTIME", default_value = "kata-qemu")]
    pub job_aarch64_runtime: String,

    #[arg(long, env = "JOB_CUSTOMER_ACCESS_SUBNET_NAME", default_value = "nmnlb")]
    pub customer_access_subnet_name: String,

    #[arg(long, env = "JOB_CUSTOMER_ACCESS_NETWORK_DOMAIN", default_value = "local")]
    pub customer_access_network_domain: String,

    #[arg(long, env = "JOB_CUSTOMER_ACCESS_NETWORK_ACCESS_POOL", default_value = "node-management")]
    pub customer_access_address_pool: String,
}

impl Config {
    /// Load configuration from `.env`, the environment and the command line
    pub fn load() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        let config = Config::parse();
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            anyhow::bail!("IMS_PORT must be greater than 0");
        }

        if self.submit_timeout_secs == 0 {
            anyhow::bail!("IMS_SUBMIT_TIMEOUT_SECS must be greater than 0");
        }

        if self.job_namespace.trim().is_empty() {
            anyhow::bail!("DEFAULT_IMS_JOB_NAMESPACE must not be empty");
        }

        if self.service_owner == self.admin_owner {
            anyhow::bail!("IMS_SERVICE_OWNER and IMS_ADMIN_OWNER must differ");
        }

        Ok(())
    }

    /// Get the API server address
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    /// Kubernetes API token, if the token file exists
    pub fn kubernetes_token(&self) -> Result<Option<String>> {
        if !self.kubernetes_token_file.exists() {
            return Ok(None);
        }
        let token = std::fs::read_to_string(&self.kubernetes_token_file).with_context(|| {
            format!(
                "Failed to read Kubernetes token: {}",
                self.kubernetes_token_file.display()
            )
        })?;
        Ok(Some(token.trim().to_string()))
    }

    /// External hostname a job's SSH container is reachable at
    pub fn job_hostname(&self, job_id: &uuid::Uuid) -> String {
        format!(
            "{}.ims.{}.{}",
            job_id, self.customer_access_subnet_name, self.customer_access_network_domain
        )
    }

    /// Ensure data directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir).with_context(|| {
            format!("Failed to create data directory: {}", self.data_dir.display())
        })?;
        std::fs::create_dir_all(&self.object_store_root).with_context(|| {
            format!(
                "Failed to create object store directory: {}",
                self.object_store_root.display()
            )
        })?;

        if let Some(dir) = &self.templates_dir {
            if !dir.is_dir() {
                anyhow::bail!("Templates directory does not exist: {}", dir.display());
            }
        }

        Ok(())
    }

    /// Configuration for tests and tools: defaults with the given data paths
    pub fn for_paths(
        data_dir: impl Into<PathBuf>,
        object_store_root: impl Into<PathBuf>,
    ) -> Result<Self> {
        let mut config = Config::try_parse_from(["ims-service"])?;
        config.data_dir = data_dir.into();
        config.object_store_root = object_store_root.into();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::try_parse_from(["ims-service"]).expect("Failed to parse config");

        assert_eq!(config.api_port, 9100);
        assert_eq!(config.job_namespace, "ims");
        assert_eq!(config.submit_timeout(), Duration::from_secs(30));
        assert!(!config.remote_offload);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flags_override() {
        let config = Config::try_parse_from([
            "ims-service",
            "--api-host",
            "127.0.0.1",
            "--api-port",
            "9000",
            "--remote-offload",
            "true",
            "--job-enable-dkms",
            "true",
        ])
        .unwrap();

        assert_eq!(config.api_address(), "127.0.0.1:9000");
        assert!(config.remote_offload);
        assert!(config.job_enable_dkms);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::try_parse_from(["ims-service"]).unwrap();
        config.submit_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::try_parse_from(["ims-service"]).unwrap();
        config.admin_owner = config.service_owner.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_job_hostname() {
        let mut config = Config::try_parse_from(["ims-service"]).unwrap();
        config.customer_access_subnet_name = "can".to_string();
        config.customer_access_network_domain = "shasta.local".to_string();
        let id = uuid::Uuid::nil();

        assert_eq!(
            config.job_hostname(&id),
            "00000000-0000-0000-0000-000000000000.ims.can.shasta.local"
        );
    }

    #[test]
    fn test_missing_token_file() {
        let mut config = Config::try_parse_from(["ims-service"]).unwrap();
        config.kubernetes_token_file = PathBuf::from("/nonexistent/token");
        assert_eq!(config.kubernetes_token().unwrap(), None);
    }
}
