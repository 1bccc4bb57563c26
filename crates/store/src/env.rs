use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Environment variables visible to reducers. Keys are case-sensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvMap(BTreeMap<String, String>);

impl EnvMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of the process environment.
    pub fn from_os() -> Self {
        Self(std::env::vars().collect())
    }

    /// Returns a copy with `k` set to `v`.
    pub fn add(&self, k: impl Into<String>, v: impl Into<String>) -> Self {
        let mut m = self.clone();
        m.0.insert(k.into(), v.into());
        m
    }

    pub fn set(&mut self, k: impl Into<String>, v: impl Into<String>) {
        self.0.insert(k.into(), v.into());
    }

    /// Returns a copy where every entry of `other` overrides this map.
    pub fn merge(&self, other: &EnvMap) -> Self {
        let mut m = self.clone();
        m.0.extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        m
    }

    pub fn get(&self, k: &str) -> Option<&str> {
        self.0.get(k).map(String::as_str)
    }

    /// Returns the value of `k`, or `def` when it is unset or empty.
    pub fn get_or<'a>(&'a self, k: &str, def: &'a str) -> &'a str {
        match self.get(k) {
            Some(v) if !v.is_empty() => v,
            _ => def,
        }
    }

    /// `KEY=value` pairs suitable for a child process.
    pub fn environ(&self) -> Vec<String> {
        self.0.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Splits a list-valued variable such as `GOPATH` on the platform separator.
    pub fn list(&self, k: &str) -> Vec<String> {
        let Some(v) = self.get(k) else {
            return Vec::new();
        };
        std::env::split_paths(v)
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|p| !p.is_empty())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn add_does_not_mutate_the_original() {
        let a = EnvMap::new().add("GOOS", "linux");
        let b = a.add("GOOS", "js");
        assert_eq!(a.get("GOOS"), Some("linux"));
        assert_eq!(b.get("GOOS"), Some("js"));
    }

    #[test]
    fn get_or_treats_empty_as_unset() {
        let env: EnvMap = [("GOPATH", "")].into_iter().collect();
        assert_eq!(env.get_or("GOPATH", "/go"), "/go");
        assert_eq!(env.get_or("GOROOT", "/usr/go"), "/usr/go");
    }

    #[test]
    fn list_splits_paths() {
        let sep = if cfg!(windows) { ";" } else { ":" };
        let env = EnvMap::new().add("GOPATH", format!("/a{sep}/b"));
        assert_eq!(env.list("GOPATH"), vec!["/a".to_string(), "/b".to_string()]);
        assert_eq!(env.environ(), vec![format!("GOPATH=/a{sep}/b")]);
    }

    #[test]
    fn merge_prefers_the_other_map() {
        let base = EnvMap::new().add("A", "1").add("B", "2");
        let merged = base.merge(&EnvMap::new().add("B", "3"));
        assert_eq!(merged.get("A"), Some("1"));
        assert_eq!(merged.get("B"), Some("3"));
    }
}
