use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

use crate::types::{NodeId, Subject};

/// Settings of a member node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's identifier.
    pub node_identifier: NodeId,
    /// Locally configured trusted subjects.
    pub trusted_subjects: BTreeSet<Subject>,
    /// Subjects of the coordinating nodes. Always trusted.
    pub cn_subjects: BTreeSet<Subject>,
    /// Subject of the node's own client certificate. Trusted when set.
    pub client_cert_subject: Option<Subject>,
    /// Failed attempts after which a queued replication is given up.
    pub replication_max_attempts: u32,
    /// Require whitelisting for updates as well as creates.
    pub require_whitelist_for_update: bool,
    /// Let untrusted callers read the event log.
    pub public_log_records: bool,
    /// Timeout for calls to remote nodes.
    pub network_timeout_secs: u64,
    /// Upper bound on records returned by one log query.
    pub max_log_records: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_identifier: NodeId::from("urn:node:mnDefault"),
            trusted_subjects: BTreeSet::new(),
            cn_subjects: BTreeSet::new(),
            client_cert_subject: None,
            replication_max_attempts: 24,
            require_whitelist_for_update: true,
            public_log_records: true,
            network_timeout_secs: 30,
            max_log_records: 5000,
        }
    }
}

impl NodeConfig {
    /// Loads settings from a `.toml` or `.json` file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: NodeConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the node cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_identifier.as_str().is_empty() {
            anyhow::bail!("node_identifier must not be empty");
        }
        if self.replication_max_attempts == 0 {
            anyhow::bail!("replication_max_attempts must be at least 1");
        }
        if self.max_log_records == 0 {
            anyhow::bail!("max_log_records must be at least 1");
        }
        Ok(())
    }

    /// Union of coordinating node subjects, configured trusted subjects and
    /// the client certificate subject.
    pub fn all_trusted_subjects(&self) -> BTreeSet<Subject> {
        self.cn_subjects
            .iter()
            .chain(self.trusted_subjects.iter())
            .chain(self.client_cert_subject.iter())
            .cloned()
            .collect()
    }
}
