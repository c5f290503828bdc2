//! Routing identifiers and the identifier -> destination table

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StationError};

/// Width of the routing identifier embedded in batch names
pub const IDENTIFIER_WIDTH: usize = 3;

// Three digits between dashes: "BOOK-123-A" matches, "BOOK-1234-A",
// "BOOK_456" and "BOOK-123A" do not.
static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"-(\d{{{IDENTIFIER_WIDTH}}})-"))
        .expect("identifier pattern is valid")
});

/// First dash-delimited fixed-width digit token in a batch name
pub fn parse_identifier(batch_name: &str) -> Option<&str> {
    IDENTIFIER
        .captures(batch_name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Read-only mapping from routing identifier to destination root
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingTable(BTreeMap<String, PathBuf>);

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identifier: impl Into<String>, root: impl Into<PathBuf>) {
        self.0.insert(identifier.into(), root.into());
    }

    pub fn resolve(&self, identifier: &str) -> Option<&Path> {
        self.0.get(identifier).map(PathBuf::as_path)
    }

    /// Parse the identifier out of `batch_name` and look up its destination root
    pub fn route(&self, batch_name: &str) -> Result<(String, PathBuf)> {
        let identifier = parse_identifier(batch_name)
            .ok_or_else(|| StationError::NoRoutingIdentifier(batch_name.to_string()))?;

        let root = self
            .resolve(identifier)
            .ok_or_else(|| StationError::MissingRoute {
                identifier: identifier.to_string(),
                batch: batch_name.to_string(),
            })?;

        Ok((identifier.to_string(), root.to_path_buf()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.0.iter().map(|(id, root)| (id.as_str(), root.as_path()))
    }
}

impl<K: Into<String>, V: Into<PathBuf>> FromIterator<(K, V)> for RoutingTable {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identifier() {
        assert_eq!(parse_identifier("BOOK-123-A"), Some("123"));
        assert_eq!(parse_identifier("X-123-BOOK-456-B"), Some("123"));
        assert_eq!(parse_identifier("BOOK-1234-007-B"), Some("007"));
        assert_eq!(parse_identifier("BOOK-12-A"), None);
        assert_eq!(parse_identifier("BOOK"), None);
    }

    #[test]
    fn test_identifier_must_sit_between_dashes() {
        assert_eq!(parse_identifier("BOOK_456"), None);
        assert_eq!(parse_identifier("BOOK-123A"), None);
        assert_eq!(parse_identifier("123-BOOK"), None);
        assert_eq!(parse_identifier("BOOK-123"), None);
    }

    #[test]
    fn test_route_resolves_destination() {
        let table: RoutingTable = [("123", "/archive/123")].into_iter().collect();

        let (id, root) = table.route("BOOK-123-A").unwrap();
        assert_eq!(id, "123");
        assert_eq!(root, PathBuf::from("/archive/123"));
    }

    #[test]
    fn test_route_failures() {
        let table: RoutingTable = [("123", "/archive/123")].into_iter().collect();

        assert!(matches!(
            table.route("BOOK-A"),
            Err(StationError::NoRoutingIdentifier(_))
        ));
        assert!(matches!(
            table.route("BOOK-999-A"),
            Err(StationError::MissingRoute { .. })
        ));
    }
}
