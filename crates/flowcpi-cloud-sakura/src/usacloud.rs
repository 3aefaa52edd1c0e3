//! usacloud CLI wrapper
//!
//! Wraps the usacloud CLI commands for Sakura Cloud operations.
//! Every invocation is bounded by the configured timeout.

use crate::error::{Result, SakuraError};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Tag marking disks created as scratch space for a single server
pub const EPHEMERAL_TAG: &str = "flowcpi-ephemeral";

/// usacloud CLI wrapper
pub struct Usacloud {
    binary: String,
    zone: String,
    timeout: Duration,
}

impl Usacloud {
    pub fn new(zone: impl Into<String>) -> Self {
        Self {
            binary: "usacloud".to_string(),
            zone: zone.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// Run a usacloud command and return stdout
    async fn run_command(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--zone").arg(&self.zone);
        cmd.args(args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        tracing::debug!("Running: {} --zone {} {}", self.binary, self.zone, args.join(" "));

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(output) => output.map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => SakuraError::UsacloudNotFound,
                _ => SakuraError::IoError(e),
            })?,
            Err(_) => {
                return Err(SakuraError::Timeout {
                    command: args.iter().take(2).copied().collect::<Vec<_>>().join(" "),
                    secs: self.timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if is_unauthorized(&stderr) {
                return Err(SakuraError::AuthenticationFailed(stderr));
            }
            return Err(SakuraError::CommandFailed(stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Read a resource, mapping a "not found" failure to `None`
    async fn read<T: serde::de::DeserializeOwned>(&self, resource: &str, id: &str) -> Result<Option<T>> {
        match self
            .run_command(&[resource, "read", id, "--output-type", "json"])
            .await
        {
            Ok(output) => Ok(Some(parse_single(&output)?)),
            Err(SakuraError::CommandFailed(stderr)) if is_not_found(&stderr) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Get server by ID
    pub async fn get_server(&self, id: &str) -> Result<Option<ServerInfo>> {
        self.read("server", id).await
    }

    /// Create a server booting from a stemcell archive
    pub async fn create_server(&self, config: &CreateServerConfig) -> Result<ServerInfo> {
        let core_str = config.core.to_string();
        let memory_str = config.memory.to_string();
        let disk_size_str = config.disk_size.to_string();

        let mut args = vec![
            "server",
            "create",
            "--name",
            config.name.as_str(),
            "--core",
            core_str.as_str(),
            "--memory",
            memory_str.as_str(),
            "--disk-source-archive-id",
            config.source_archive_id.as_str(),
            "--disk-size",
            disk_size_str.as_str(),
            "--output-type",
            "json",
            "--yes",
        ];

        for tag in &config.tags {
            args.push("--tags");
            args.push(tag.as_str());
        }

        let output = self.run_command(&args).await?;
        parse_single(&output)
    }

    /// Delete a server, keeping its disks
    pub async fn delete_server(&self, id: &str) -> Result<()> {
        self.run_command(&["server", "delete", id, "--force", "--yes"])
            .await?;
        Ok(())
    }

    /// Replace the tags of a server
    pub async fn set_server_tags(&self, id: &str, tags: &[String]) -> Result<()> {
        let mut args = vec!["server", "update", id, "--yes"];
        for tag in tags {
            args.push("--tags");
            args.push(tag.as_str());
        }
        self.run_command(&args).await?;
        Ok(())
    }

    /// Hard reset a server
    pub async fn reset_server(&self, id: &str) -> Result<()> {
        self.run_command(&["server", "reset", id, "--yes"]).await?;
        Ok(())
    }

    /// Get disk by ID
    pub async fn get_disk(&self, id: &str) -> Result<Option<DiskInfo>> {
        self.read("disk", id).await
    }

    /// List all disks in the zone
    pub async fn list_disks(&self) -> Result<Vec<DiskInfo>> {
        let output = self
            .run_command(&["disk", "list", "--output-type", "json"])
            .await?;

        if output.trim().is_empty() || output.trim() == "[]" {
            return Ok(Vec::new());
        }

        let disks: Vec<DiskInfo> = serde_json::from_str(&output)?;
        Ok(disks)
    }

    /// Create a blank disk
    pub async fn create_disk(&self, config: &CreateDiskConfig) -> Result<DiskInfo> {
        let size_str = config.size_gb.to_string();
        let mut args = vec![
            "disk",
            "create",
            "--name",
            config.name.as_str(),
            "--size",
            size_str.as_str(),
            "--output-type",
            "json",
            "--yes",
        ];

        if let Some(ref plan) = config.plan {
            args.push("--disk-plan");
            args.push(plan.as_str());
        }

        for tag in &config.tags {
            args.push("--tags");
            args.push(tag.as_str());
        }

        let output = self.run_command(&args).await?;
        parse_single(&output)
    }

    pub async fn delete_disk(&self, id: &str) -> Result<()> {
        self.run_command(&["disk", "delete", id, "--yes"]).await?;
        Ok(())
    }

    pub async fn connect_disk(&self, disk_id: &str, server_id: &str) -> Result<()> {
        self.run_command(&[
            "disk",
            "connect-to-server",
            disk_id,
            "--server-id",
            server_id,
            "--yes",
        ])
        .await?;
        Ok(())
    }

    pub async fn disconnect_disk(&self, disk_id: &str) -> Result<()> {
        self.run_command(&["disk", "disconnect-from-server", disk_id, "--yes"])
            .await?;
        Ok(())
    }

    /// Create an archive (snapshot) from a disk
    pub async fn create_archive(
        &self,
        name: &str,
        source_disk_id: &str,
        tags: &[String],
    ) -> Result<ArchiveInfo> {
        let mut args = vec![
            "archive",
            "create",
            "--name",
            name,
            "--source-disk-id",
            source_disk_id,
            "--output-type",
            "json",
            "--yes",
        ];
        for tag in tags {
            args.push("--tags");
            args.push(tag.as_str());
        }

        let output = self.run_command(&args).await?;
        parse_single(&output)
    }

    pub async fn get_archive(&self, id: &str) -> Result<Option<ArchiveInfo>> {
        self.read("archive", id).await
    }

    pub async fn delete_archive(&self, id: &str) -> Result<()> {
        self.run_command(&["archive", "delete", id, "--yes"]).await?;
        Ok(())
    }
}

/// usacloud prints either a single object or a one-element array
fn parse_single<T: serde::de::DeserializeOwned>(output: &str) -> Result<T> {
    let value: serde_json::Value = serde_json::from_str(output)?;
    let value = match value {
        serde_json::Value::Array(mut items) if items.len() == 1 => items.remove(0),
        other => other,
    };
    Ok(serde_json::from_value(value)?)
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("not found") || lower.contains("404")
}

fn is_unauthorized(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("unauthorized") || lower.contains("401")
}

/// Sakura ids come back as numbers or strings depending on the command
fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("unexpected id: {}", other))),
    }
}

/// Server information from usacloud
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(rename = "ID", deserialize_with = "deserialize_id")]
    pub id: String,

    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "InstanceStatus")]
    pub instance_status: Option<String>,

    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,
}

impl ServerInfo {
    /// Check if server is running
    pub fn is_running(&self) -> bool {
        self.instance_status.as_deref() == Some("up")
    }
}

/// Disk information from usacloud
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskInfo {
    #[serde(rename = "ID", deserialize_with = "deserialize_id")]
    pub id: String,

    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "SizeMB")]
    pub size_mb: Option<u64>,

    #[serde(rename = "ServerID", default)]
    pub server_id: Option<serde_json::Value>,

    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,
}

impl DiskInfo {
    /// Server the disk is connected to, if any
    pub fn server(&self) -> Option<String> {
        match self.server_id.as_ref()? {
            serde_json::Value::String(s) if !s.is_empty() && s != "0" => Some(s.clone()),
            serde_json::Value::Number(n) if n.as_u64() != Some(0) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        self.tags.iter().any(|t| t == EPHEMERAL_TAG)
    }
}

/// Archive information from usacloud
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveInfo {
    #[serde(rename = "ID", deserialize_with = "deserialize_id")]
    pub id: String,

    #[serde(rename = "Name")]
    pub name: String,
}

/// Configuration for creating a server
#[derive(Debug, Clone)]
pub struct CreateServerConfig {
    pub name: String,
    pub core: i32,
    pub memory: i32,
    pub disk_size: i32,
    pub source_archive_id: String,
    pub tags: Vec<String>,
}

/// Configuration for creating a disk
#[derive(Debug, Clone)]
pub struct CreateDiskConfig {
    pub name: String,
    pub size_gb: u32,
    pub plan: Option<String>,
    pub tags: Vec<String>,
}
