use serde::Deserialize;

pub const APPLICATION_TAG_KEY: &str = "application";
pub const SERVICE_TAG_KEY: &str = "service";
pub const CLUSTER_TAG_KEY: &str = "cluster";
pub const SHARD_TAG_KEY: &str = "shard";
pub const SOURCE_KEY: &str = "source";

/// Stands in for an unset cluster, shard or component.
pub const NULL_TAG_VAL: &str = "none";

/// Identifies the reporting application. Every span and derived metric carries these tags.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ApplicationTags {
    pub application: String,
    pub service: String,
    pub cluster: Option<String>,
    pub shard: Option<String>,
    pub custom_tags: Vec<(String, String)>,
}

impl Default for ApplicationTags {
    fn default() -> Self {
        Self::new("unnamed_application", "unnamed_service")
    }
}

impl ApplicationTags {
    pub fn new(application: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            service: service.into(),
            cluster: None,
            shard: None,
            custom_tags: Vec::new(),
        }
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    pub fn with_shard(mut self, shard: impl Into<String>) -> Self {
        self.shard = Some(shard.into());
        self
    }

    pub fn with_custom_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_tags.push((key.into(), value.into()));
        self
    }

    pub fn cluster_or_none(&self) -> &str {
        self.cluster.as_deref().unwrap_or(NULL_TAG_VAL)
    }

    pub fn shard_or_none(&self) -> &str {
        self.shard.as_deref().unwrap_or(NULL_TAG_VAL)
    }

    /// The tags seeded onto every span: application, service, cluster, shard, then the custom tags.
    pub fn default_tags(&self) -> Vec<(String, String)> {
        let mut tags = Vec::with_capacity(4 + self.custom_tags.len());
        tags.push((APPLICATION_TAG_KEY.to_string(), self.application.clone()));
        tags.push((SERVICE_TAG_KEY.to_string(), self.service.clone()));
        tags.push((CLUSTER_TAG_KEY.to_string(), self.cluster_or_none().to_string()));
        tags.push((SHARD_TAG_KEY.to_string(), self.shard_or_none().to_string()));
        tags.extend(self.custom_tags.iter().cloned());
        tags
    }
}
