//! Host and path-prefix routing tables
//!
//! Built once from repeatable `--host-pair` / `--prefix-pair` flags and
//! read-only afterwards. Host comparisons always go through [`host_key`]
//! so the two canonical local spellings a dev server may report
//! (`127.0.0.1` vs `localhost`) hit the same entry.

use std::collections::HashMap;

/// Normalize a host for table lookups: strip a literal `http://` prefix and
/// unify the loopback alias.
pub fn host_key(host: &str) -> String {
  host
    .strip_prefix("http://")
    .unwrap_or(host)
    .replace("127.0.0.1", "localhost")
}

/// A `<remote>,<local>` mapping between a production host and the dev server
/// masquerading as it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPair {
  pub remote: String,
  pub local: String,
}

impl HostPair {
  /// Parse from the comma-separated flag form; exactly two fields required.
  pub fn parse(value: &str) -> Option<Self> {
    let mut parts = value.split(',');
    match (parts.next(), parts.next(), parts.next()) {
      (Some(remote), Some(local), None) if !remote.is_empty() && !local.is_empty() => {
        Some(HostPair {
          remote: remote.to_string(),
          local: local.to_string(),
        })
      }
      _ => None,
    }
  }
}

/// A `<remote>,<prefix>` rule: paths under `prefix` bypass the masquerade and
/// go to the real host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixPair {
  pub host: String,
  pub prefix: String,
}

impl PrefixPair {
  pub fn parse(value: &str) -> Option<Self> {
    let mut parts = value.split(',');
    match (parts.next(), parts.next(), parts.next()) {
      (Some(host), Some(prefix), None) if !host.is_empty() && !prefix.is_empty() => {
        Some(PrefixPair {
          host: host.to_string(),
          prefix: prefix.to_string(),
        })
      }
      _ => None,
    }
  }
}

/// Read-only routing tables for the dispatcher and terminators.
#[derive(Debug, Default)]
pub struct HostRouter {
  local_to_remote: HashMap<String, String>,
  remote_to_local: HashMap<String, String>,
  prefixes: HashMap<String, Vec<String>>,
  skipped: usize,
}

impl HostRouter {
  /// Build the tables from raw flag values. Malformed entries are rejected
  /// with a warning and counted; well-formed entries are unaffected.
  pub fn from_flags(host_pairs: &[String], prefix_pairs: &[String]) -> Self {
    let mut router = HostRouter::default();

    for value in host_pairs {
      match HostPair::parse(value) {
        Some(pair) => {
          let local = host_key(&pair.local);
          router
            .local_to_remote
            .insert(local.clone(), pair.remote.clone());
          router.remote_to_local.insert(pair.remote, local);
        }
        None => {
          tracing::warn!("ignoring malformed host pair {:?} (want <remote>,<local>)", value);
          router.skipped += 1;
        }
      }
    }

    for value in prefix_pairs {
      match PrefixPair::parse(value) {
        Some(pair) => {
          router.prefixes.entry(pair.host).or_default().push(pair.prefix);
        }
        None => {
          tracing::warn!("ignoring malformed prefix pair {:?} (want <remote>,<prefix>)", value);
          router.skipped += 1;
        }
      }
    }

    if router.skipped > 0 {
      tracing::warn!("{} malformed pair flag(s) ignored", router.skipped);
    }

    router
  }

  /// Production host masqueraded by `local`, if any. `local` is normalized
  /// before lookup.
  pub fn remote_for_local(&self, local: &str) -> Option<&str> {
    self.local_to_remote.get(&host_key(local)).map(String::as_str)
  }

  /// Local dev host masquerading as `remote`, if any.
  pub fn local_for_remote(&self, remote: &str) -> Option<&str> {
    self.remote_to_local.get(remote).map(String::as_str)
  }

  /// Path prefixes that must pass through to the real `remote` host.
  pub fn prefixes_for(&self, remote: &str) -> &[String] {
    self.prefixes.get(remote).map(Vec::as_slice).unwrap_or(&[])
  }

  /// Number of malformed flag values that were rejected at construction.
  pub fn skipped(&self) -> usize {
    self.skipped
  }
}
