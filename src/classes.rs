//! Class registry: stable mapping between encapsulin variant names and ids.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};

pub type ClassId = u32;

static GLOBAL_REGISTRY: OnceCell<ClassRegistry> = OnceCell::new();

/// On-disk layout of `class_info.json`.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ClassInfo {
    pub class_ids: BTreeMap<String, ClassId>,
    #[serde(default)]
    pub class_groups: BTreeMap<String, Vec<String>>,
}

/// Read-only mapping from class name to id (and back).
///
/// Id 0 is reserved for background and never names a class.
#[derive(Debug, Clone)]
pub struct ClassRegistry {
    ids: BTreeMap<String, ClassId>,
    names: BTreeMap<ClassId, String>,
    groups: BTreeMap<String, Vec<String>>,
}

impl ClassRegistry {
    pub fn from_info(info: ClassInfo) -> Result<Self> {
        if info.class_ids.is_empty() {
            return Err(AnalysisError::configuration("class registry defines no classes"));
        }

        let mut names = BTreeMap::new();
        for (name, &id) in &info.class_ids {
            if name.is_empty() || name.contains(',') || name.contains('"') {
                return Err(AnalysisError::configuration(format!(
                    "invalid class name {:?}",
                    name
                )));
            }
            if id == 0 {
                return Err(AnalysisError::configuration(format!(
                    "class {} uses id 0, which is reserved for background",
                    name
                )));
            }
            if let Some(other) = names.insert(id, name.clone()) {
                return Err(AnalysisError::configuration(format!(
                    "classes {} and {} share id {}",
                    other, name, id
                )));
            }
        }

        for (group, members) in &info.class_groups {
            if let Some(unknown) = members.iter().find(|m| !info.class_ids.contains_key(*m)) {
                return Err(AnalysisError::configuration(format!(
                    "class group {} names unknown class {}",
                    group, unknown
                )));
            }
        }

        Ok(Self {
            ids: info.class_ids,
            names,
            groups: info.class_groups,
        })
    }

    /// Build a registry from `(name, id)` pairs without groups.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, ClassId)>,
    {
        let class_ids = pairs
            .into_iter()
            .map(|(name, id)| (name.to_string(), id))
            .collect();
        Self::from_info(ClassInfo {
            class_ids,
            class_groups: BTreeMap::new(),
        })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            AnalysisError::configuration(format!(
                "cannot open class registry {}: {}",
                path.display(),
                e
            ))
        })?;
        let info: ClassInfo = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            AnalysisError::configuration(format!(
                "malformed class registry {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_info(info)
    }

    /// Load the process-wide registry. Later calls return the first one loaded.
    pub fn init_global<P: AsRef<Path>>(path: P) -> Result<&'static ClassRegistry> {
        GLOBAL_REGISTRY.get_or_try_init(|| {
            let registry = Self::from_file(path.as_ref())?;
            log::info!(
                "Loaded {} classes from {}",
                registry.len(),
                path.as_ref().display()
            );
            Ok(registry)
        })
    }

    pub fn global() -> Option<&'static ClassRegistry> {
        GLOBAL_REGISTRY.get()
    }

    pub fn id(&self, name: &str) -> Option<ClassId> {
        self.ids.get(name).copied()
    }

    pub fn name(&self, id: ClassId) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Class ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = ClassId> + '_ {
        self.names.keys().copied()
    }

    pub fn max_id(&self) -> ClassId {
        self.names.keys().next_back().copied().unwrap_or(0)
    }

    pub fn group(&self, name: &str) -> Option<&[String]> {
        self.groups.get(name).map(Vec::as_slice)
    }

    /// Resolve a list of class or group names into sorted, unique class ids.
    ///
    /// An empty list means every registered class is allowed.
    pub fn resolve_allowed(&self, names: &[String]) -> Result<Vec<ClassId>> {
        if names.is_empty() {
            return Ok(self.ids().collect());
        }

        let mut ids = Vec::new();
        for name in names {
            if let Some(id) = self.id(name) {
                ids.push(id);
            } else if let Some(members) = self.group(name) {
                ids.extend(members.iter().filter_map(|m| self.id(m)));
            } else {
                return Err(AnalysisError::configuration(format!(
                    "unknown class or class group: {}",
                    name
                )));
            }
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }
}

/// Color assigned to a class id in overlays and shape layers.
pub fn class_color(id: ClassId) -> [u8; 3] {
    let palette = colorous::CATEGORY10;
    let color = palette[id as usize % palette.len()];
    [color.r, color.g, color.b]
}

/// Class id → RGB color map used by the overlay renderer.
#[derive(Debug, Clone, Default)]
pub struct ClassColors {
    colors: BTreeMap<ClassId, [u8; 3]>,
}

impl ClassColors {
    pub fn for_registry(registry: &ClassRegistry) -> Self {
        Self {
            colors: registry.ids().map(|id| (id, class_color(id))).collect(),
        }
    }

    pub fn insert(&mut self, id: ClassId, color: [u8; 3]) {
        self.colors.insert(id, color);
    }

    /// Color for a label. Labels without an explicit entry fall back to the palette.
    pub fn get(&self, id: ClassId) -> [u8; 3] {
        self.colors.get(&id).copied().unwrap_or_else(|| class_color(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ClassRegistry {
        let mut info = ClassInfo::default();
        info.class_ids.insert("1xMT3-MxEnc".to_string(), 1);
        info.class_ids.insert("1xMT3-QtEnc".to_string(), 2);
        info.class_ids.insert("1xTmEnc-BC2".to_string(), 6);
        info.class_groups.insert(
            "mt3".to_string(),
            vec!["1xMT3-MxEnc".to_string(), "1xMT3-QtEnc".to_string()],
        );
        ClassRegistry::from_info(info).unwrap()
    }

    #[test]
    fn test_lookup_both_directions() {
        let reg = registry();
        assert_eq!(reg.id("1xMT3-QtEnc"), Some(2));
        assert_eq!(reg.name(6), Some("1xTmEnc-BC2"));
        assert_eq!(reg.name(3), None);
        assert_eq!(reg.max_id(), 6);
        assert_eq!(reg.ids().collect::<Vec<_>>(), vec![1, 2, 6]);
    }

    #[test]
    fn test_rejects_background_id_and_duplicates() {
        assert!(ClassRegistry::from_pairs([("bg", 0)]).is_err());
        assert!(ClassRegistry::from_pairs([("a", 1), ("b", 1)]).is_err());
        assert!(ClassRegistry::from_pairs([("a,b", 1)]).is_err());
        assert!(ClassRegistry::from_pairs(std::iter::empty()).is_err());
    }

    #[test]
    fn test_resolve_allowed_groups_and_names() {
        let reg = registry();
        let ids = reg
            .resolve_allowed(&["mt3".to_string(), "1xTmEnc-BC2".to_string(), "1xMT3-MxEnc".to_string()])
            .unwrap();
        assert_eq!(ids, vec![1, 2, 6]);
        assert_eq!(reg.resolve_allowed(&[]).unwrap(), vec![1, 2, 6]);
        assert!(matches!(
            reg.resolve_allowed(&["nope".to_string()]),
            Err(AnalysisError::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let err = ClassRegistry::from_file("/nonexistent/class_info.json").unwrap_err();
        assert!(matches!(err, AnalysisError::Configuration(_)));
    }

    #[test]
    fn test_colors_are_stable() {
        let colors = ClassColors::for_registry(&registry());
        assert_eq!(colors.get(1), class_color(1));
        assert_eq!(colors.get(11), class_color(1));
    }
}
