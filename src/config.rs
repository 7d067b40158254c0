use std::{collections::HashSet, path::{Path, PathBuf}, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    codec::CodecPolicy,
    error::{Error, Result},
    node::NodeOptions,
};

/// Deployment description, read from a JSON file.
///
/// ```json
/// {
///   "rings": [["10.0.0.1:3840", "10.0.0.2:3840"], ["10.1.0.1:3840"]],
///   "threshold": 1.25,
///   "codec": "seal",
///   "checkpoint": "nodes.ckpt"
/// }
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Each inner list is one local ring in `next` order.
    pub rings: Vec<Vec<String>>,
    pub threshold: f64,
    pub tick_interval_ms: u64,
    pub jitter: (f64, f64),
    pub regional_tick_interval_ms: u64,
    pub rpc_timeout_ms: u64,
    pub traversal_cap: usize,
    pub codec: CodecPolicy,
    pub checkpoint: Option<PathBuf>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            rings: Vec::new(),
            threshold: 1.25,
            tick_interval_ms: 15_000,
            jitter: (0.5, 1.5),
            regional_tick_interval_ms: 120_000,
            rpc_timeout_ms: 5_000,
            traversal_cap: 1024,
            codec: CodecPolicy::default(),
            checkpoint: None,
        }
    }
}

/// Where one configured node sits in the rings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodePlan {
    pub address: String,
    pub next: String,
    /// Set on the representative (first member) of each ring when there is
    /// more than one ring.
    pub regional_next: Option<String>,
}

impl NetworkConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rings.is_empty() || self.rings.iter().any(Vec::is_empty) {
            return Err(Error::Config("every ring needs at least one address".into()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.rings.iter().flatten().find(|a| !seen.insert(a.as_str())) {
            return Err(Error::Config(format!("{} is configured twice", dup)));
        }
        if !(self.threshold >= 1.0) {
            return Err(Error::Config("threshold must be at least 1".into()));
        }
        let (low, high) = self.jitter;
        if !(low > 0.0 && low <= high) {
            return Err(Error::Config("jitter must satisfy 0 < low <= high".into()));
        }
        if self.traversal_cap == 0 {
            return Err(Error::Config("traversal_cap must be positive".into()));
        }
        Ok(())
    }

    /// Resolves the rings into per-node pointers. Within a ring each address
    /// points at the following one and the last wraps to the first. With two
    /// or more rings the first members form the regional ring in ring order.
    pub fn plan(&self) -> Vec<NodePlan> {
        let representatives: Vec<&String> = self.rings.iter().filter_map(|ring| ring.first()).collect();
        let regional = representatives.len() > 1;
        self.rings
            .iter()
            .enumerate()
            .flat_map(|(r, ring)| {
                let regional_next = regional
                    .then(|| representatives[(r + 1) % representatives.len()].clone());
                ring.iter().enumerate().map(move |(i, address)| NodePlan {
                    address: address.clone(),
                    next: ring[(i + 1) % ring.len()].clone(),
                    regional_next: if i == 0 { regional_next.clone() } else { None },
                })
            })
            .collect()
    }

    pub fn node_options(&self) -> NodeOptions {
        NodeOptions::builder()
            .threshold(self.threshold)
            .tick_interval(Duration::from_millis(self.tick_interval_ms))
            .jitter(self.jitter)
            .regional_tick_interval(Duration::from_millis(self.regional_tick_interval_ms))
            .rpc_timeout(Duration::from_millis(self.rpc_timeout_ms))
            .traversal_cap(self.traversal_cap)
            .codec(self.codec)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in() {
        let config = NetworkConfig::parse(r#"{"rings": [["a", "b", "c"]]}"#).unwrap();
        assert_eq!(config.threshold, 1.25);
        assert_eq!(config.codec, CodecPolicy::Obfuscate);
        let options = config.node_options();
        assert_eq!(options.tick_interval, Duration::from_secs(15));
        assert_eq!(options.traversal_cap, 1024);
    }

    #[test]
    fn one_ring_has_no_regional_tier() {
        let config = NetworkConfig::parse(r#"{"rings": [["a", "b", "c"]]}"#).unwrap();
        let plan = config.plan();
        let pointers: Vec<_> = plan.iter().map(|p| (p.address.as_str(), p.next.as_str())).collect();
        assert_eq!(pointers, vec![("a", "b"), ("b", "c"), ("c", "a")]);
        assert!(plan.iter().all(|p| p.regional_next.is_none()));
    }

    #[test]
    fn representatives_form_the_regional_ring() {
        let config = NetworkConfig::parse(
            r#"{"rings": [["a1", "a2"], ["b1"], ["c1", "c2"]], "codec": "seal"}"#,
        )
        .unwrap();
        assert_eq!(config.codec, CodecPolicy::Seal);
        let regional: Vec<_> = config
            .plan()
            .into_iter()
            .filter_map(|p| p.regional_next.map(|r| (p.address, r)))
            .collect();
        assert_eq!(
            regional,
            vec![
                ("a1".to_string(), "b1".to_string()),
                ("b1".to_string(), "c1".to_string()),
                ("c1".to_string(), "a1".to_string()),
            ]
        );
    }

    #[test]
    fn bad_configs_are_rejected() {
        for text in [
            r#"{"rings": []}"#,
            r#"{"rings": [[]]}"#,
            r#"{"rings": [["a"], ["a"]]}"#,
            r#"{"rings": [["a"]], "threshold": 0.5}"#,
            r#"{"rings": [["a"]], "jitter": [1.5, 0.5]}"#,
            r#"{"rings": [["a"]], "codec": "rot13"}"#,
        ] {
            assert!(matches!(NetworkConfig::parse(text), Err(Error::Config(_))), "{}", text);
        }
    }
}
