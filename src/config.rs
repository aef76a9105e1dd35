use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::claim::SAFE_CLAIM_RETRIES_COUNT;

fn default_safe_claim_retries() -> u32 {
    SAFE_CLAIM_RETRIES_COUNT
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZookeeperConfig {
    pub connect: String,
    #[serde(default)]
    pub chroot: Option<String>,
    #[serde(with = "humantime_serde")]
    pub session_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub cluster: String,
    pub group: String,
    pub member_id: String,
    pub zookeeper: ZookeeperConfig,
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub rebalance_delay: Duration,
    #[serde(default = "default_safe_claim_retries")]
    pub safe_claim_retries: u32,
}

impl Config {
    pub fn parse(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        Self::from_str(&raw)
    }

    pub fn from_str(raw: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(raw).context("failed to parse config")
    }

    /// The ZooKeeper connect string with the configured chroot appended,
    /// as `zookeeper-async` expects it (`host:port/chroot`).
    pub fn zk_connect_string(&self) -> String {
        match &self.zookeeper.chroot {
            Some(chroot) if !chroot.is_empty() => {
                format!("{}{}", self.zookeeper.connect, chroot)
            }
            _ => self.zookeeper.connect.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let raw = r#"
cluster: prod
group: orders-consumer
member_id: orders-consumer-1
zookeeper:
  connect: "zk1:2181,zk2:2181"
  session_timeout: 6s
retry_backoff: 500ms
rebalance_delay: 2s
"#;

        let config = Config::from_str(raw).unwrap();
        assert_eq!(config.cluster, "prod");
        assert_eq!(config.group, "orders-consumer");
        assert_eq!(config.retry_backoff, Duration::from_millis(500));
        assert_eq!(config.rebalance_delay, Duration::from_secs(2));
        assert_eq!(config.safe_claim_retries, SAFE_CLAIM_RETRIES_COUNT);
        assert_eq!(config.zk_connect_string(), "zk1:2181,zk2:2181");
    }

    #[test]
    fn chroot_is_appended_to_connect_string() {
        let raw = r#"
cluster: prod
group: g
member_id: m1
zookeeper:
  connect: "zk1:2181"
  chroot: "/pixy/prod"
  session_timeout: 6s
retry_backoff: 500ms
rebalance_delay: 2s
safe_claim_retries: 3
"#;

        let config = Config::from_str(raw).unwrap();
        assert_eq!(config.zk_connect_string(), "zk1:2181/pixy/prod");
        assert_eq!(config.safe_claim_retries, 3);
    }

    #[test]
    fn rejects_malformed_yaml() {
        assert!(Config::from_str("not: [valid").is_err());
    }
}
