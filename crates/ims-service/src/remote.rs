//! Running jobs on remote build nodes
//!
//! A remote job gets a gzipped tar build context holding the rendered job
//! specification and its environment. The context is copied to the node
//! with `scp` and unpacked into `/tmp/ims_<job id>`, and the job container
//! is started there with `podman`. The working directory is what marks a
//! job as running on a node.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use ims_common::models::RemoteBuildNode;
use ims_common::{Error, Result};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

/// Seconds `ssh` and `scp` wait for a node to accept the connection
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// What a remote node needs to start a job container
#[derive(Debug, Clone)]
pub struct RemoteLaunch {
    pub job_id: Uuid,
    /// Container image to run
    pub image: String,
    /// Gzipped tar build context
    pub context: Vec<u8>,
}

impl RemoteLaunch {
    pub fn container_name(&self) -> String {
        container_name(self.job_id)
    }

    pub fn work_dir(&self) -> String {
        format!("/tmp/ims_{}", self.job_id)
    }
}

pub fn container_name(job_id: Uuid) -> String {
    format!("ims-{}", job_id)
}

/// Starts and stops job containers on remote build nodes
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Transfer the build context and start the container, returning its name
    async fn launch(&self, node: &RemoteBuildNode, launch: &RemoteLaunch) -> Result<String>;

    /// Stop and remove a job container
    async fn stop(&self, node: &RemoteBuildNode, container_name: &str) -> Result<()>;
}

/// Environment of the job's main container, flattened from the rendered spec
pub fn container_env(spec: &Value) -> BTreeMap<String, String> {
    spec.pointer("/spec/template/spec/containers")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|container| container.get("env").and_then(Value::as_array))
        .flatten()
        .filter_map(|var| {
            let name = var.get("name")?.as_str()?;
            let value = match var.get("value")? {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            Some((name.to_string(), value))
        })
        .collect()
}

/// Main container image of the rendered spec
pub fn container_image(spec: &Value) -> Result<String> {
    spec.pointer("/spec/template/spec/containers/0/image")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Template("Job specification names no container image".to_string()))
}

fn append_file(
    tar: &mut tar::Builder<GzEncoder<Vec<u8>>>,
    path: &str,
    contents: &[u8],
) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    tar.append_data(&mut header, path, contents)
}

/// Package `job.json` and a podman `env` file into a tar.gz
pub fn package_build_context(spec: &Value) -> Result<Vec<u8>> {
    let job = serde_json::to_vec_pretty(spec)?;

    let mut env = Vec::new();
    for (name, value) in container_env(spec) {
        // podman env files are line based
        writeln!(env, "{}={}", name, value.replace('\n', "\\n"))?;
    }

    let enc = GzEncoder::new(Vec::new(), Compression::default());
    let mut tar = tar::Builder::new(enc);
    append_file(&mut tar, "job.json", &job)?;
    append_file(&mut tar, "env", &env)?;

    let enc = tar.into_inner()?;
    Ok(enc.finish()?)
}

/// Reaches build nodes with the system `ssh` and `scp` clients
pub struct SshExecutor {
    user: String,
    key_path: PathBuf,
}

impl SshExecutor {
    pub fn new(user: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            key_path: key_path.into(),
        }
    }

    fn destination(&self, node: &RemoteBuildNode) -> String {
        format!("{}@{}", self.user, node.hostname)
    }

    fn ssh_options(&self) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.key_path.display().to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", CONNECT_TIMEOUT_SECS),
        ]
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        debug!("Running {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::RemoteExecution(format!("Failed to execute {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::RemoteExecution(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn ssh(&self, node: &RemoteBuildNode, command: String) -> Result<String> {
        let mut args = self.ssh_options();
        args.push(self.destination(node));
        args.push(command);
        self.run("ssh", &args).await
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn launch(&self, node: &RemoteBuildNode, launch: &RemoteLaunch) -> Result<String> {
        let work_dir = launch.work_dir();
        let name = launch.container_name();

        let mut context = tempfile::NamedTempFile::new()?;
        context.write_all(&launch.context)?;
        context.as_file().sync_all()?;

        self.ssh(node, format!("mkdir -p {}", work_dir)).await?;

        let mut args = self.ssh_options();
        args.push(context.path().display().to_string());
        args.push(format!("{}:{}/context.tar.gz", self.destination(node), work_dir));
        self.run("scp", &args).await?;

        let start = format!(
            "cd {dir} && tar -xzf context.tar.gz && podman run -d --name {name} \
             --privileged --env-file {dir}/env -v {dir}:/mnt/image {image}",
            dir = work_dir,
            name = name,
            image = launch.image,
        );
        let container_id = self.ssh(node, start).await?;

        info!(
            "Started container {} ({}) on remote build node {}",
            name, container_id, node.hostname
        );
        Ok(name)
    }

    async fn stop(&self, node: &RemoteBuildNode, container_name: &str) -> Result<()> {
        let command = format!(
            "podman rm -f {name}; rm -rf /tmp/ims_{id}",
            name = container_name,
            id = container_name.trim_start_matches("ims-"),
        );
        self.ssh(node, command).await?;
        info!("Stopped container {} on remote build node {}", container_name, node.hostname);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use serde_json::json;
    use std::io::Read;

    fn spec() -> Value {
        json!({
            "spec": {"template": {"spec": {"containers": [
                {"name": "sshd", "image": "cray-ims-sshd:latest", "env": [
                    {"name": "IMS_JOB_ID", "value": "abc"},
                    {"name": "PUBLIC_KEY", "value": "ssh-ed25519 AAAA me"}
                ]},
                {"name": "sidecar", "image": "sidecar:latest", "env": [
                    {"name": "ENABLE_DEBUG", "value": "False"},
                    {"name": "REMOTE_BUILD_NODE", "value": null}
                ]}
            ]}}}
        })
    }

    #[test]
    fn test_container_env_and_image() {
        let env = container_env(&spec());
        assert_eq!(env.get("IMS_JOB_ID").map(String::as_str), Some("abc"));
        assert_eq!(env.get("REMOTE_BUILD_NODE").map(String::as_str), Some(""));
        assert_eq!(env.len(), 4);
        assert_eq!(container_image(&spec()).unwrap(), "cray-ims-sshd:latest");
        assert!(container_image(&json!({})).is_err());
    }

    #[test]
    fn test_build_context_contents() {
        let bytes = package_build_context(&spec()).unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(bytes.as_slice()));
        let mut files = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().display().to_string();
            let mut contents = String::new();
            entry.read_to_string(&mut contents).unwrap();
            files.insert(path, contents);
        }

        let job: Value = serde_json::from_str(&files["job.json"]).unwrap();
        assert_eq!(job, spec());
        assert!(files["env"].contains("PUBLIC_KEY=ssh-ed25519 AAAA me\n"));
    }

    #[test]
    fn test_launch_names() {
        let job_id = Uuid::new_v4();
        let launch = RemoteLaunch {
            job_id,
            image: "img".to_string(),
            context: Vec::new(),
        };
        assert_eq!(launch.container_name(), format!("ims-{}", job_id));
        assert_eq!(launch.work_dir(), format!("/tmp/ims_{}", job_id));
    }

    #[test]
    fn test_ssh_options_bound_connection_time() {
        let executor = SshExecutor::new("root", "/etc/ims/ssh/id_ecdsa");
        let options = executor.ssh_options();
        assert_eq!(&options[..2], ["-i", "/etc/ims/ssh/id_ecdsa"]);
        assert!(options.contains(&"BatchMode=yes".to_string()));
        assert!(options.contains(&format!("ConnectTimeout={}", CONNECT_TIMEOUT_SECS)));
    }
}
