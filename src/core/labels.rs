// Static instrument catalog: class-id → name lookup plus tray reference data.
//
// Loaded once from a JSON file at process start; immutable afterwards. A class
// id the model can emit that is missing from the map is a configuration
// defect, which is why contiguity is enforced at load time rather than
// discovered mid-request.

use crate::core::errors::{ConfigError, ConfigResult, DetectionError, DetectionResult};
use crate::core::types::TrayConfiguration;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// What to do when the model emits a class id with no catalog entry.
///
/// `Reject` fails the request (missing entries are configuration errors and
/// should surface loudly); `Degrade` emits the raw numeric id as the label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnmappedLabelPolicy {
    #[default]
    Reject,
    Degrade,
}

impl UnmappedLabelPolicy {
    pub fn parse(value: &str) -> ConfigResult<Self> {
        match value.trim().to_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "degrade" => Ok(Self::Degrade),
            other => Err(ConfigError::UnknownLabelPolicy(other.to_string())),
        }
    }
}

/// Immutable class-id → instrument-name map.
///
/// Ids are contiguous from 0, so the map is stored as a dense vector.
#[derive(Debug, Clone)]
pub struct InstrumentLabelMap {
    names: Vec<String>,
}

impl InstrumentLabelMap {
    fn from_raw(raw: HashMap<String, String>) -> ConfigResult<Self> {
        if raw.is_empty() {
            return Err(ConfigError::EmptyLabelMap);
        }

        let expected = raw.len();
        let mut by_id = HashMap::with_capacity(expected);
        for (key, name) in raw {
            let class_id: usize = key
                .trim()
                .parse()
                .map_err(|_| ConfigError::NonNumericClassId(key.clone()))?;
            if name.trim().is_empty() {
                return Err(ConfigError::EmptyInstrumentName { class_id });
            }
            by_id.insert(class_id, name);
        }

        let mut names = Vec::with_capacity(expected);
        for class_id in 0..expected {
            match by_id.remove(&class_id) {
                Some(name) => names.push(name),
                None => {
                    return Err(ConfigError::NonContiguousLabelMap {
                        expected,
                        missing: class_id,
                    })
                }
            }
        }

        Ok(Self { names })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, class_id: usize) -> Option<&str> {
        self.names.get(class_id).map(String::as_str)
    }

    /// Resolve a class id to its instrument name under the given policy.
    pub fn resolve(
        &self,
        class_id: usize,
        policy: UnmappedLabelPolicy,
    ) -> DetectionResult<String> {
        match self.get(class_id) {
            Some(name) => Ok(name.to_string()),
            None => match policy {
                UnmappedLabelPolicy::Reject => {
                    Err(DetectionError::UnmappedLabel { class_id })
                }
                UnmappedLabelPolicy::Degrade => Ok(class_id.to_string()),
            },
        }
    }
}

/// The static configuration file: instrument label map + tray reference data.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub instruments: InstrumentLabelMap,
    pub trays: HashMap<String, TrayConfiguration>,
}

#[derive(Debug, Deserialize)]
struct RawCatalog {
    instruments: HashMap<String, String>,
    #[serde(default)]
    trays: HashMap<String, TrayConfiguration>,
}

impl Catalog {
    /// Load and validate the catalog file. Called once at startup.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::CatalogRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text, &path.display().to_string())
    }

    fn from_json(text: &str, path: &str) -> ConfigResult<Self> {
        let raw: RawCatalog =
            serde_json::from_str(text).map_err(|source| ConfigError::CatalogParse {
                path: path.to_string(),
                source,
            })?;

        Ok(Self {
            instruments: InstrumentLabelMap::from_raw(raw.instruments)?,
            trays: raw.trays,
        })
    }

    pub fn tray(&self, name: &str) -> ConfigResult<&TrayConfiguration> {
        self.trays
            .get(name)
            .ok_or_else(|| ConfigError::UnknownTray(name.to_string()))
    }

    /// Tray names in a stable order, for client selectors.
    pub fn tray_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.trays.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn raw_map(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn label_map_resolves_known_ids() {
        let map =
            InstrumentLabelMap::from_raw(raw_map(&[("0", "Scalpel"), ("1", "Probe")])).unwrap();

        assert_eq!(map.len(), 2);
        assert_eq!(map.get(0), Some("Scalpel"));
        assert_eq!(
            map.resolve(1, UnmappedLabelPolicy::Reject).unwrap(),
            "Probe"
        );
    }

    #[test]
    fn label_map_rejects_gaps() {
        let err = InstrumentLabelMap::from_raw(raw_map(&[("0", "Scalpel"), ("2", "Probe")]))
            .unwrap_err();

        match err {
            ConfigError::NonContiguousLabelMap { expected, missing } => {
                assert_eq!(expected, 2);
                assert_eq!(missing, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn label_map_rejects_empty() {
        assert!(matches!(
            InstrumentLabelMap::from_raw(HashMap::new()),
            Err(ConfigError::EmptyLabelMap)
        ));
    }

    #[test]
    fn label_map_rejects_blank_names() {
        assert!(matches!(
            InstrumentLabelMap::from_raw(raw_map(&[("0", "  ")])),
            Err(ConfigError::EmptyInstrumentName { class_id: 0 })
        ));
    }

    #[test]
    fn unmapped_id_follows_policy() {
        let map = InstrumentLabelMap::from_raw(raw_map(&[("0", "Scalpel")])).unwrap();

        assert!(matches!(
            map.resolve(7, UnmappedLabelPolicy::Reject),
            Err(DetectionError::UnmappedLabel { class_id: 7 })
        ));
        assert_eq!(map.resolve(7, UnmappedLabelPolicy::Degrade).unwrap(), "7");
    }

    #[test]
    fn policy_parses_from_config_values() {
        assert_eq!(
            UnmappedLabelPolicy::parse("Reject").unwrap(),
            UnmappedLabelPolicy::Reject
        );
        assert_eq!(
            UnmappedLabelPolicy::parse(" degrade ").unwrap(),
            UnmappedLabelPolicy::Degrade
        );
        assert!(UnmappedLabelPolicy::parse("drop").is_err());
    }

    #[test]
    fn catalog_loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "instruments": {{ "0": "Scalpel", "1": "Probe" }},
                "trays": {{
                    "Minor Set": {{
                        "expected_weight_kg": 1.5,
                        "items": [ {{ "name": "Scalpel", "expected_count": 1 }} ]
                    }}
                }}
            }}"#
        )
        .unwrap();

        let catalog = Catalog::load(file.path()).unwrap();
        assert_eq!(catalog.instruments.len(), 2);
        assert_eq!(catalog.tray_names(), vec!["Minor Set".to_string()]);

        let tray = catalog.tray("Minor Set").unwrap();
        assert_eq!(tray.items.len(), 1);
        assert_eq!(tray.expected_weight_kg, Some(1.5));

        assert!(matches!(
            catalog.tray("Cardiac Set"),
            Err(ConfigError::UnknownTray(_))
        ));
    }

    #[test]
    fn catalog_rejects_invalid_json() {
        assert!(matches!(
            Catalog::from_json("not json", "config.json"),
            Err(ConfigError::CatalogParse { .. })
        ));
    }
}
