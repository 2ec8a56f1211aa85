//! Remote build nodes: hosts outside the cluster that run jobs under podman

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{require_non_empty, Arch, ExtraFields, Record};
use crate::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Enabled,
    Disabled,
}

/// Remote build node record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteBuildNode {
    pub id: Uuid,

    pub created: DateTime<Utc>,

    /// Host reached over ssh
    pub hostname: String,

    #[serde(default)]
    pub arch: Arch,

    #[serde(default)]
    pub status: NodeStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub extra: ExtraFields,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteBuildNodeRequest {
    pub hostname: String,

    #[serde(default)]
    pub arch: Arch,

    #[serde(default)]
    pub status: NodeStatus,
}

impl RemoteBuildNode {
    pub fn from_request(request: RemoteBuildNodeRequest) -> Result<Self> {
        let node = Self {
            id: Uuid::new_v4(),
            created: Utc::now(),
            hostname: request.hostname.trim().to_string(),
            arch: request.arch,
            status: request.status,
            deleted: None,
            extra: ExtraFields::new(),
        };
        node.validate()?;
        Ok(node)
    }

    /// Live and accepting jobs
    pub fn is_enabled(&self) -> bool {
        !self.is_deleted() && self.status == NodeStatus::Enabled
    }
}

impl Record for RemoteBuildNode {
    const KIND: &'static str = "remote build node";
    const COLLECTION: &'static str = "remote_build_nodes";
    const PATCHABLE: &'static [&'static str] = &["status", "arch"];

    fn id(&self) -> Uuid {
        self.id
    }

    fn created(&self) -> DateTime<Utc> {
        self.created
    }

    fn deleted(&self) -> Option<DateTime<Utc>> {
        self.deleted
    }

    fn set_deleted(&mut self, deleted: Option<DateTime<Utc>>) {
        self.deleted = deleted;
    }

    fn validate(&self) -> Result<()> {
        require_non_empty("hostname", &self.hostname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_defaults() {
        let request: RemoteBuildNodeRequest =
            serde_json::from_value(json!({"hostname": "ncn-w001"})).unwrap();
        let node = RemoteBuildNode::from_request(request).unwrap();
        assert_eq!(node.arch, Arch::X86_64);
        assert!(node.is_enabled());
    }

    #[test]
    fn test_disabled_or_deleted_nodes_are_not_enabled() {
        let request: RemoteBuildNodeRequest = serde_json::from_value(
            json!({"hostname": "ncn-w002", "arch": "aarch64", "status": "disabled"}),
        )
        .unwrap();
        let mut node = RemoteBuildNode::from_request(request).unwrap();
        assert!(!node.is_enabled());

        node.status = NodeStatus::Enabled;
        node.set_deleted(Some(Utc::now()));
        assert!(!node.is_enabled());
    }

    #[test]
    fn test_blank_hostname() {
        let request: RemoteBuildNodeRequest =
            serde_json::from_value(json!({"hostname": "  "})).unwrap();
        assert!(RemoteBuildNode::from_request(request).is_err());
    }
}
