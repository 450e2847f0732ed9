//! Resolution of dotted entity paths and opcode groups to metadata sets.
//!
//! The factory is initialized from three YAML documents in the policy
//! directory:
//!
//! - `policy_meta.yml` — `Metadata`: list of `{name, id}` label encodings.
//! - `policy_init.yml` — `Require`: tree of dotted entity paths whose leaves
//!   carry a `metadata` list of label names.
//! - `policy_group.yml` — `Groups`: map of opcode-group name to label-name
//!   list, plus an optional `Rules` map of operand-pattern refinements.

use crate::config::ConfigError;
use crate::meta_set::{MetaSet, MAX_LABELS};
use crate::opgroup::{OperandMatcher, OpgroupRule};
use crate::decoder::InsnFlags;
use log::debug;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Builds [`MetaSet`]s from the names used by policy definitions.
#[derive(Debug)]
pub struct MetadataFactory {
    encoding_map: HashMap<String, u32>,
    reverse_encoding_map: HashMap<u32, String>,
    // Entity path -> label names, flattened from the policy_init tree.
    entity_initializers: BTreeMap<String, Vec<String>>,
    // Memoized lookup_metadata results.
    path_map: HashMap<String, MetaSet>,
    group_map: HashMap<String, MetaSet>,
    opgroup_rules: HashMap<String, Vec<OpgroupRule>>,
}

#[derive(Debug, Deserialize)]
struct MetaDoc {
    #[serde(rename = "Metadata")]
    metadata: Vec<MetaEncoding>,
}

#[derive(Debug, Deserialize)]
struct MetaEncoding {
    name: String,
    id: u32,
}

#[derive(Debug, Deserialize)]
struct GroupDoc {
    #[serde(rename = "Groups", default)]
    groups: BTreeMap<String, Vec<String>>,
    #[serde(rename = "Rules", default)]
    rules: BTreeMap<String, Vec<RuleSpec>>,
}

#[derive(Debug, Deserialize)]
struct RuleSpec {
    #[serde(default)]
    r#match: MatchSpec,
    metadata: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MatchSpec {
    rd: Option<MatcherSpec>,
    rs1: Option<MatcherSpec>,
    rs2: Option<MatcherSpec>,
    rs3: Option<MatcherSpec>,
    imm: Option<MatcherSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum MatcherSpec {
    Any(bool),
    Equal(Vec<i64>),
    NotEqual(Vec<i64>),
    Range([i64; 2]),
    NotRange([i64; 2]),
}

impl MatcherSpec {
    fn build(spec: Option<&MatcherSpec>) -> OperandMatcher {
        match spec {
            None | Some(MatcherSpec::Any(_)) => OperandMatcher::Any,
            Some(MatcherSpec::Equal(values)) => OperandMatcher::Equal(values.clone()),
            Some(MatcherSpec::NotEqual(values)) => OperandMatcher::NotEqual(values.clone()),
            Some(MatcherSpec::Range([lo, hi])) => OperandMatcher::Range(*lo, *hi),
            Some(MatcherSpec::NotRange([lo, hi])) => OperandMatcher::NotRange(*lo, *hi),
        }
    }
}

impl MetadataFactory {
    /// Loads the three policy documents from `policy_dir`.
    pub fn new(policy_dir: &Path) -> Result<Self, ConfigError> {
        let meta: MetaDoc = load_yaml(&policy_dir.join("policy_meta.yml"))?;
        let init: serde_yaml::Value = load_yaml(&policy_dir.join("policy_init.yml"))?;
        let group: GroupDoc = load_yaml(&policy_dir.join("policy_group.yml"))?;

        let mut factory = Self {
            encoding_map: HashMap::new(),
            reverse_encoding_map: HashMap::new(),
            entity_initializers: BTreeMap::new(),
            path_map: HashMap::new(),
            group_map: HashMap::new(),
            opgroup_rules: HashMap::new(),
        };

        for encoding in meta.metadata {
            if encoding.id as usize >= MAX_LABELS {
                return Err(ConfigError::Schema(format!(
                    "label id {} of `{}` out of range",
                    encoding.id, encoding.name
                )));
            }
            factory
                .reverse_encoding_map
                .insert(encoding.id, encoding.name.clone());
            factory.encoding_map.insert(encoding.name, encoding.id);
        }

        let require = init
            .get("Require")
            .ok_or_else(|| ConfigError::Schema("policy_init.yml has no Require root".into()))?;
        factory.init_entity_initializers(require, String::new())?;
        for names in factory.entity_initializers.values() {
            for name in names {
                if !factory.encoding_map.contains_key(name) {
                    return Err(ConfigError::UnknownLabel(name.clone()));
                }
            }
        }
        debug!(
            "loaded {} label encodings and {} entity initializers",
            factory.encoding_map.len(),
            factory.entity_initializers.len()
        );

        for (name, labels) in group.groups {
            let set = factory.meta_set_of_names(&labels)?;
            factory.group_map.insert(name, set);
        }
        for (name, specs) in group.rules {
            let mut rules = Vec::with_capacity(specs.len());
            for spec in &specs {
                let matchers = vec![
                    MatcherSpec::build(spec.r#match.rd.as_ref()),
                    MatcherSpec::build(spec.r#match.rs1.as_ref()),
                    MatcherSpec::build(spec.r#match.rs2.as_ref()),
                    MatcherSpec::build(spec.r#match.rs3.as_ref()),
                    MatcherSpec::build(spec.r#match.imm.as_ref()),
                ];
                rules.push(OpgroupRule::new(
                    matchers,
                    factory.meta_set_of_names(&spec.metadata)?,
                ));
            }
            factory.opgroup_rules.insert(name, rules);
        }

        Ok(factory)
    }

    fn init_entity_initializers(
        &mut self,
        node: &serde_yaml::Value,
        prefix: String,
    ) -> Result<(), ConfigError> {
        let mapping = node.as_mapping().ok_or_else(|| {
            ConfigError::Schema(format!("entity `{prefix}` is not a mapping"))
        })?;
        for (key, value) in mapping {
            let key = key
                .as_str()
                .ok_or_else(|| ConfigError::Schema(format!("non-string key under `{prefix}`")))?;
            if key == "metadata" {
                let list = value.as_sequence().ok_or_else(|| {
                    ConfigError::Schema(format!("metadata of `{prefix}` is not a list"))
                })?;
                let mut names = Vec::with_capacity(list.len());
                for item in list {
                    let name = item
                        .get("name")
                        .and_then(|n| n.as_str())
                        .ok_or_else(|| {
                            ConfigError::Schema(format!("metadata of `{prefix}` lacks a name"))
                        })?;
                    names.push(name.to_owned());
                }
                self.entity_initializers.insert(prefix.clone(), names);
            } else {
                let child = if prefix.is_empty() {
                    key.to_owned()
                } else {
                    format!("{prefix}.{key}")
                };
                self.init_entity_initializers(value, child)?;
            }
        }
        Ok(())
    }

    fn meta_set_of_names(&self, names: &[String]) -> Result<MetaSet, ConfigError> {
        let mut set = MetaSet::new();
        for name in names {
            let id = self
                .encoding_map
                .get(name)
                .ok_or_else(|| ConfigError::UnknownLabel(name.clone()))?;
            set.insert(*id);
        }
        Ok(set)
    }

    /// The metadata set of the entity at `dotted_path`, or `None` if the
    /// policy defines no such entity. Memoized.
    pub fn lookup_metadata(&mut self, dotted_path: &str) -> Option<&MetaSet> {
        if !self.path_map.contains_key(dotted_path) {
            let names = self.entity_initializers.get(dotted_path)?;
            let mut set = MetaSet::new();
            for name in names {
                // Encodings were validated at load time.
                set.insert(*self.encoding_map.get(name)?);
            }
            self.path_map.insert(dotted_path.to_owned(), set);
        }
        self.path_map.get(dotted_path)
    }

    /// All entities at or under `prefix`, keyed by their full dotted path.
    pub fn lookup_metadata_map(&mut self, prefix: &str) -> BTreeMap<String, MetaSet> {
        let paths: Vec<String> = self
            .entity_initializers
            .keys()
            .filter(|path| {
                path.as_str() == prefix
                    || (path.starts_with(prefix) && path[prefix.len()..].starts_with('.'))
            })
            .cloned()
            .collect();
        paths
            .into_iter()
            .filter_map(|path| {
                let set = self.lookup_metadata(&path)?.clone();
                Some((path, set))
            })
            .collect()
    }

    /// The metadata of an opcode group, refined by its opgroup rules.
    ///
    /// Rules are consulted first, in order; the first rule matching the
    /// instruction's operand fields wins. Without a matching rule the
    /// unconditional group metadata applies. Unknown groups yield `None`.
    #[allow(clippy::too_many_arguments)]
    pub fn lookup_group_metadata(
        &self,
        opgroup: &str,
        flags: InsnFlags,
        rs1: u32,
        rs2: u32,
        rs3: u32,
        rd: u32,
        imm: i32,
    ) -> Option<&MetaSet> {
        if let Some(rules) = self.opgroup_rules.get(opgroup) {
            for rule in rules {
                if let Some(metadata) = rule.matches(flags, rs1, rs2, rs3, rd, imm) {
                    return Some(metadata);
                }
            }
        }
        self.group_map.get(opgroup)
    }

    /// Renders one label id as its (optionally abbreviated) name.
    pub fn render_label(&self, label: u32, abbrev: bool) -> String {
        match self.reverse_encoding_map.get(&label) {
            Some(name) if abbrev => abbreviate(name).to_owned(),
            Some(name) => name.clone(),
            None => format!("<unknown: {label}>"),
        }
    }

    /// Renders a whole set as a comma-joined name list.
    pub fn render(&self, set: &MetaSet, abbrev: bool) -> String {
        set.iter()
            .map(|label| self.render_label(label, abbrev))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Iterates all known entity paths.
    pub fn entities(&self) -> impl Iterator<Item = &str> {
        self.entity_initializers.keys().map(String::as_str)
    }
}

fn load_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: PathBuf::from(path),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
        path: PathBuf::from(path),
        source,
    })
}

/// Last segment of a dotted name.
fn abbreviate(dotted: &str) -> &str {
    dotted.rsplit('.').next().unwrap_or(dotted)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    pub(crate) const POLICY_META: &str = "\
Metadata:
  - name: requires.test.Reg.Default
    id: 1
  - name: requires.test.Reg.RZero
    id: 2
  - name: requires.test.Reg.Env
    id: 3
  - name: requires.test.CSR.Default
    id: 4
  - name: requires.test.Code.ElfSection.SHF_EXECINSTR
    id: 5
  - name: requires.test.og.storeGrp
    id: 6
  - name: requires.test.og.storeRestricted
    id: 7
  - name: requires.test.CSR.MEPC
    id: 8
  - name: requires.test.CSR.MTVal
    id: 9
  - name: requires.test.CSR.MTVec
    id: 10
  - name: requires.test.RAM
    id: 11
";

    pub(crate) const POLICY_INIT: &str = "\
Require:
  ISA:
    RISCV:
      Reg:
        Default:
          metadata:
            - name: requires.test.Reg.Default
        RZero:
          metadata:
            - name: requires.test.Reg.RZero
        Env:
          metadata:
            - name: requires.test.Reg.Env
      CSR:
        Default:
          metadata:
            - name: requires.test.CSR.Default
        MEPC:
          metadata:
            - name: requires.test.CSR.MEPC
        MTVal:
          metadata:
            - name: requires.test.CSR.MTVal
        MTVec:
          metadata:
            - name: requires.test.CSR.MTVec
      Code:
        ElfSection:
          SHF_EXECINSTR:
            metadata:
              - name: requires.test.Code.ElfSection.SHF_EXECINSTR
  SOC:
    RAM:
      metadata:
        - name: requires.test.RAM
";

    pub(crate) const POLICY_GROUP: &str = "\
Groups:
  storeGrp:
    - requires.test.og.storeGrp
Rules:
  storeGrp:
    - match:
        rs1: {equal: [2]}
        imm: {range: [0, 255]}
      metadata:
        - requires.test.og.storeRestricted
";

    pub(crate) fn write_policy_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("policy_meta.yml"), POLICY_META).unwrap();
        fs::write(dir.path().join("policy_init.yml"), POLICY_INIT).unwrap();
        fs::write(dir.path().join("policy_group.yml"), POLICY_GROUP).unwrap();
        dir
    }

    #[test]
    fn test_lookup_metadata() {
        let dir = write_policy_dir();
        let mut factory = MetadataFactory::new(dir.path()).unwrap();
        let set = factory.lookup_metadata("ISA.RISCV.Reg.Default").unwrap();
        assert_eq!(vec![1], set.iter().collect::<Vec<_>>());
        assert!(factory.lookup_metadata("ISA.RISCV.Reg.NoSuch").is_none());
        // Memoized lookups stay stable.
        let again = factory.lookup_metadata("ISA.RISCV.Reg.Default").unwrap();
        assert_eq!(vec![1], again.iter().collect::<Vec<_>>());
    }

    #[test]
    fn test_lookup_metadata_map() {
        let dir = write_policy_dir();
        let mut factory = MetadataFactory::new(dir.path()).unwrap();
        let map = factory.lookup_metadata_map("ISA.RISCV.Reg");
        assert_eq!(
            vec![
                "ISA.RISCV.Reg.Default",
                "ISA.RISCV.Reg.Env",
                "ISA.RISCV.Reg.RZero"
            ],
            map.keys().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_group_rule_first_match_wins() {
        let dir = write_policy_dir();
        let factory = MetadataFactory::new(dir.path()).unwrap();
        let flags = InsnFlags::RS1 | InsnFlags::RS2 | InsnFlags::IMM | InsnFlags::STORE;
        // rs1 == 2 and imm in range: refined metadata.
        let refined = factory
            .lookup_group_metadata("storeGrp", flags, 2, 5, 0, 0, 16)
            .unwrap();
        assert_eq!(vec![7], refined.iter().collect::<Vec<_>>());
        // rs1 != 2: fall through to the unconditional group metadata.
        let base = factory
            .lookup_group_metadata("storeGrp", flags, 3, 5, 0, 0, 16)
            .unwrap();
        assert_eq!(vec![6], base.iter().collect::<Vec<_>>());
        assert!(factory
            .lookup_group_metadata("noSuchGrp", flags, 0, 0, 0, 0, 0)
            .is_none());
    }

    #[test]
    fn test_render() {
        let dir = write_policy_dir();
        let factory = MetadataFactory::new(dir.path()).unwrap();
        let set: MetaSet = [1, 3].into_iter().collect();
        assert_eq!(
            "requires.test.Reg.Default, requires.test.Reg.Env",
            factory.render(&set, false)
        );
        assert_eq!("Default, Env", factory.render(&set, true));
        let unknown: MetaSet = [63].into_iter().collect();
        assert_eq!("<unknown: 63>", factory.render(&unknown, false));
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            MetadataFactory::new(dir.path()),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_unknown_label_name_is_fatal() {
        let dir = write_policy_dir();
        fs::write(
            dir.path().join("policy_group.yml"),
            "Groups:\n  g: [no.such.label]\n",
        )
        .unwrap();
        assert!(matches!(
            MetadataFactory::new(dir.path()),
            Err(ConfigError::UnknownLabel(_))
        ));
    }
}
