//! Best-effort persistence of the node list.
//!
//! A checkpoint is written when a process shuts down and read back when it
//! starts. It is not a log: whatever happened after the last write is lost.
//!
//! File layout: `b"ORBK" | key: [u8; 16] | document`, where the document is
//! the JSON checkpoint concealed with [`obfuscate`] under `key`. The key sits
//! in the clear, so a checkpoint is compact and unreadable at a glance but
//! not secret. Secret keys are never written.

use std::{io, path::Path};

use chrono::Utc;
use tracing::{debug, info};

use crate::{
    codec::{from_document, obfuscate, to_document, CodecError, CorrelationId},
    error::{Error, Result},
    identity::{NodeIdentity, VERSION},
    work::WorkUnit,
};

const MAGIC: &[u8; 4] = b"ORBK";
const KEY_LEN: usize = 16;

/// Everything needed to bring one node back.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub identity: NodeIdentity,
    pub next: String,
    #[serde(default)]
    pub regional_next: Option<String>,
    #[serde(default)]
    pub queue: Vec<WorkUnit>,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub version: String,
    /// Microseconds since the unix epoch.
    pub taken_at: i64,
    pub nodes: Vec<NodeSnapshot>,
}

impl Checkpoint {
    pub fn new(nodes: Vec<NodeSnapshot>) -> Self {
        Self {
            version: VERSION.into(),
            taken_at: Utc::now().timestamp_micros(),
            nodes,
        }
    }

    pub fn node(&self, address: &str) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|n| n.identity.address == address)
    }

    pub fn unit_count(&self) -> usize {
        self.nodes.iter().map(|n| n.queue.len()).sum()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let key = CorrelationId::new();
        let document = obfuscate::conceal(&key, &to_document(self)?);
        let mut buf = Vec::with_capacity(MAGIC.len() + KEY_LEN + document.len());
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&key.0);
        buf.extend_from_slice(&document);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let header = MAGIC.len() + KEY_LEN;
        if buf.len() < header || &buf[..MAGIC.len()] != MAGIC {
            return Err(Error::Checkpoint("not a checkpoint file".into()));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&buf[MAGIC.len()..header]);
        let text = obfuscate::reveal(&CorrelationId(key), &buf[header..])?;
        from_document(&text).map_err(|e| match e {
            CodecError::Document(e) => Error::Checkpoint(e.to_string()),
            other => other.into(),
        })
    }

    /// Writes the checkpoint next to `path` and renames it into place.
    pub async fn write(&self, path: &Path) -> Result<()> {
        let buf = self.encode()?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &buf).await?;
        tokio::fs::rename(&tmp, path).await?;
        info!(path = %path.display(), nodes = self.nodes.len(), units = self.unit_count(), "checkpoint written");
        Ok(())
    }

    /// Reads a checkpoint. A missing file is `Ok(None)`.
    pub async fn read(path: &Path) -> Result<Option<Self>> {
        let buf = match tokio::fs::read(path).await {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no checkpoint");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        Self::decode(&buf).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{identity::Keypair, work::PackageRef};

    fn sample() -> Checkpoint {
        let keypair = Keypair::generate();
        Checkpoint::new(vec![
            NodeSnapshot {
                identity: NodeIdentity::anonymous("10.0.0.1:3840"),
                next: "10.0.0.2:3840".into(),
                regional_next: Some("10.1.0.1:3840".into()),
                queue: vec![WorkUnit::new("a", "emit a").with_package(PackageRef::new("json"))],
            },
            NodeSnapshot {
                identity: NodeIdentity::keyed("10.0.0.2:3840", &keypair),
                next: "10.0.0.1:3840".into(),
                regional_next: None,
                queue: vec![],
            },
        ])
    }

    #[test]
    fn encoded_checkpoints_decode() {
        let checkpoint = sample();
        let buf = checkpoint.encode().unwrap();
        assert_eq!(&buf[..4], MAGIC);
        assert_eq!(Checkpoint::decode(&buf).unwrap(), checkpoint);
        assert_eq!(checkpoint.unit_count(), 1);
        assert!(checkpoint.node("10.0.0.2:3840").is_some());
    }

    #[test]
    fn damaged_files_are_rejected() {
        assert!(matches!(
            Checkpoint::decode(b"nope"),
            Err(Error::Checkpoint(_))
        ));
        let mut buf = sample().encode().unwrap();
        buf[5] ^= 0x55;
        assert!(Checkpoint::decode(&buf).is_err());
    }

    #[tokio::test]
    async fn files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.ckpt");
        assert!(Checkpoint::read(&path).await.unwrap().is_none());

        let checkpoint = sample();
        checkpoint.write(&path).await.unwrap();
        assert_eq!(Checkpoint::read(&path).await.unwrap(), Some(checkpoint));
        assert!(!path.with_extension("tmp").exists());
    }
}
