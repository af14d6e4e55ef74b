use crate::traits::PolicyHooks;
use glob::Pattern;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tideway_base::{err, Id, Result};
use tracing::{info, warn};

/// Pattern-list access policy plus the trust-on-first-use record of
/// server keys. The default permits everything; a deployment narrows
/// it with explicit patterns.
#[derive(Clone, Debug)]
pub struct StandardPolicy {
    allow_read: Vec<Pattern>,
    deny_read: Vec<Pattern>,
    allow_write: Vec<Pattern>,
    known_servers: BTreeMap<String, Id>,
    known_servers_path: Option<PathBuf>,
}

impl Default for StandardPolicy {
    fn default() -> Self {
        StandardPolicy {
            allow_read: vec![Pattern::new("*").expect("literal pattern")],
            deny_read: Vec::new(),
            allow_write: vec![Pattern::new("*").expect("literal pattern")],
            known_servers: BTreeMap::new(),
            known_servers_path: None,
        }
    }
}

impl StandardPolicy {
    pub fn new() -> StandardPolicy {
        StandardPolicy::default()
    }

    pub fn allow_read(mut self, patterns: &[String]) -> Result<StandardPolicy> {
        self.allow_read = parse_patterns(patterns)?;
        Ok(self)
    }

    pub fn deny_read(mut self, patterns: &[String]) -> Result<StandardPolicy> {
        self.deny_read = parse_patterns(patterns)?;
        Ok(self)
    }

    pub fn allow_write(mut self, patterns: &[String]) -> Result<StandardPolicy> {
        self.allow_write = parse_patterns(patterns)?;
        Ok(self)
    }

    /// Persist the known-servers record at `path`, loading whatever is
    /// already there.
    pub fn with_known_servers_file(mut self, path: PathBuf) -> Result<StandardPolicy> {
        if path.exists() {
            let bytes = std::fs::read(&path)?;
            let entries: BTreeMap<String, [u8; 20]> = rmp_serde::from_slice(&bytes)?;
            self.known_servers = entries.into_iter().map(|(k, v)| (k, Id(v))).collect();
        }
        self.known_servers_path = Some(path);
        Ok(self)
    }

    fn persist_known_servers(&self) -> Result<()> {
        let Some(path) = &self.known_servers_path else {
            return Ok(());
        };
        let entries: BTreeMap<&String, [u8; 20]> = self
            .known_servers
            .iter()
            .map(|(k, v)| (k, v.0))
            .collect();
        std::fs::write(path, rmp_serde::to_vec(&entries)?)?;
        Ok(())
    }
}

fn parse_patterns(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| Pattern::new(p).map_err(|e| err(format!("bad pattern '{}': {}", p, e))))
        .collect()
}

impl PolicyHooks for StandardPolicy {
    fn read_allowed(&self, branch: &str, _client: Option<&Id>) -> bool {
        if self.deny_read.iter().any(|p| p.matches(branch)) {
            return false;
        }
        self.allow_read.iter().any(|p| p.matches(branch))
    }

    fn write_allowed(&self, branch: &str, _client: &Id) -> bool {
        self.allow_write.iter().any(|p| p.matches(branch))
    }

    fn known_server_key(&self, peer: &str) -> Option<Id> {
        self.known_servers.get(peer).copied()
    }

    fn remember_server_key(&mut self, peer: &str, fingerprint: &Id) -> Result<()> {
        match self.known_servers.insert(peer.to_string(), *fingerprint) {
            None => info!(target: "tideway", peer, %fingerprint,
                          "first time connecting to this server; recording its key"),
            Some(old) if old != *fingerprint => {
                warn!(target: "tideway", peer, "replacing recorded server key");
            }
            Some(_) => {}
        }
        self.persist_known_servers()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn test_pattern_decisions() {
        let pol = StandardPolicy::new()
            .allow_read(&["branch.*".into()])
            .unwrap()
            .deny_read(&["branch.private*".into()])
            .unwrap()
            .allow_write(&["branch.dev".into()])
            .unwrap();
        let k = Id::of(b"k");
        assert!(pol.read_allowed("branch.main", None));
        assert!(!pol.read_allowed("branch.private.x", Some(&k)));
        assert!(!pol.read_allowed("other", None));
        assert!(pol.write_allowed("branch.dev", &k));
        assert!(!pol.write_allowed("branch.main", &k));
    }

    #[test]
    fn test_known_servers_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_servers.tw");
        let fp = Id::of(b"server key");
        {
            let mut pol = StandardPolicy::new()
                .with_known_servers_file(path.clone())
                .unwrap();
            assert_eq!(pol.known_server_key("host:4691"), None);
            pol.remember_server_key("host:4691", &fp).unwrap();
        }
        let pol = StandardPolicy::new().with_known_servers_file(path).unwrap();
        assert_eq!(pol.known_server_key("host:4691"), Some(fp));
    }
}
