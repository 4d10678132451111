//! NPS — the normalized, source-agnostic package record.
//!
//! The sole artifact crossing the orchestrator → exporter boundary. Its JSON
//! shape is fixed and versioned so exporters never need source-specific
//! knowledge.

use serde::{Deserialize, Serialize};

/// Schema version tag stamped on every record.
pub const NPS_VERSION: &str = "1.0.0";

/// Canonical package metadata, normalized from any source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NpsPackage {
    /// Stable, source-prefixed identifier (e.g. `nix:firefox`).
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    /// One of `flathub`, `nix`, `arch`.
    pub source_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub build_dependencies: Vec<String>,
    #[serde(default)]
    pub frameworks: Vec<String>,
    /// Free-form bag carrying source-specific raw fields.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub nps_version: String,
}

impl NpsPackage {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        source_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: None,
            source_type: source_type.into(),
            description: None,
            dependencies: Vec::new(),
            build_dependencies: Vec::new(),
            frameworks: Vec::new(),
            metadata: serde_json::Map::new(),
            nps_version: NPS_VERSION.to_string(),
        }
    }

    pub fn with_version(mut self, version: Option<String>) -> Self {
        self.version = version;
        self
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_build_dependencies(mut self, deps: Vec<String>) -> Self {
        self.build_dependencies = deps;
        self
    }

    /// Replace the metadata bag. Non-object values are ignored.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = metadata {
            self.metadata = map;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_shape_is_stable() {
        let pkg = NpsPackage::new("arch:firefox", "firefox", "arch")
            .with_version(Some("133.0".into()))
            .with_dependencies(vec!["gtk3".into()])
            .with_metadata(serde_json::json!({"popularity": 42}));

        let json = serde_json::to_value(&pkg).unwrap();
        assert_eq!(json["id"], "arch:firefox");
        assert_eq!(json["source_type"], "arch");
        assert_eq!(json["dependencies"], serde_json::json!(["gtk3"]));
        assert_eq!(json["metadata"]["popularity"], 42);
        assert_eq!(json["nps_version"], NPS_VERSION);
        assert!(json.as_object().unwrap().contains_key("frameworks"));
    }

    #[test]
    fn roundtrip_preserves_fields() {
        let pkg = NpsPackage::new("nix:glib", "glib", "nix")
            .with_build_dependencies(vec!["meson".into()]);
        let text = serde_json::to_string(&pkg).unwrap();
        let back: NpsPackage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, pkg);
    }

    #[test]
    fn non_object_metadata_is_ignored() {
        let pkg = NpsPackage::new("x:y", "y", "x").with_metadata(serde_json::json!([1, 2]));
        assert!(pkg.metadata.is_empty());
    }
}
