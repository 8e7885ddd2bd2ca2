//! Android package registry (`/data/system/packages.list`).
//!
//! Each line reads `<package> <uid> <debuggable> <data dir> <seinfo> <gids>`.
//! Several packages may share a uid; the first one listed is reported.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::Sock2ProcError;

pub const DEFAULT_PACKAGES_LIST: &str = "/data/system/packages.list";

/// Uids are `user_id * PER_USER_RANGE + app_id`
const PER_USER_RANGE: u32 = 100_000;

#[derive(Debug, Clone, Default)]
pub struct PackageRegistry {
    by_uid: HashMap<u32, Vec<String>>,
    by_package: HashMap<String, u32>,
}

impl PackageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(content: &str) -> Self {
        let mut registry = Self::new();
        for line in content.lines() {
            let mut fields = line.split_whitespace();
            let (Some(package), Some(uid)) = (fields.next(), fields.next()) else {
                continue;
            };
            match uid.parse::<u32>() {
                Ok(uid) => registry.insert(package, uid),
                Err(_) => debug!("Skipping package entry with bad uid: {}", line),
            }
        }
        registry
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Sock2ProcError> {
        let content = fs::read_to_string(path.as_ref())?;
        let registry = Self::parse(&content);
        debug!(
            "Loaded {} packages from {}",
            registry.len(),
            path.as_ref().display()
        );
        Ok(registry)
    }

    pub fn load_default() -> Result<Self, Sock2ProcError> {
        Self::load(DEFAULT_PACKAGES_LIST)
    }

    pub fn insert(&mut self, package: &str, uid: u32) {
        self.by_uid.entry(uid).or_default().push(package.to_string());
        self.by_package.entry(package.to_string()).or_insert(uid);
    }

    /// Package owning `uid`, folding secondary users onto the app id
    pub fn package_for_uid(&self, uid: u32) -> Option<&str> {
        self.by_uid
            .get(&uid)
            .or_else(|| self.by_uid.get(&(uid % PER_USER_RANGE)))
            .and_then(|pkgs| pkgs.first())
            .map(|s| s.as_str())
    }

    pub fn uid_for_package(&self, package: &str) -> Option<u32> {
        self.by_package.get(package).copied()
    }

    pub fn contains(&self, package: &str) -> bool {
        self.by_package.contains_key(package)
    }

    pub fn len(&self) -> usize {
        self.by_package.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_package.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
com.example.browser 10123 0 /data/user/0/com.example.browser default:targetSdkVersion=33 3003
com.example.mail 10124 0 /data/user/0/com.example.mail default:targetSdkVersion=33 none
com.android.shared.a 1000 0 /data/system default none
com.android.shared.b 1000 0 /data/system default none
broken-line
com.bad.uid notanumber 0 /data none
";

    #[test]
    fn test_parse_packages() {
        let registry = PackageRegistry::parse(SAMPLE);
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.package_for_uid(10123), Some("com.example.browser"));
        assert_eq!(registry.uid_for_package("com.example.mail"), Some(10124));
        assert!(!registry.contains("com.bad.uid"));
    }

    #[test]
    fn test_shared_uid_reports_first() {
        let registry = PackageRegistry::parse(SAMPLE);
        assert_eq!(registry.package_for_uid(1000), Some("com.android.shared.a"));
    }

    #[test]
    fn test_secondary_user_uid() {
        let registry = PackageRegistry::parse(SAMPLE);
        assert_eq!(registry.package_for_uid(1_010_123), Some("com.example.browser"));
        assert_eq!(registry.package_for_uid(99_999), None);
    }
}
