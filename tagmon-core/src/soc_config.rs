//! SoC memory-map configuration: YAML regions applied as tag-bus providers.

use crate::config::ConfigError;
use crate::factory::MetadataFactory;
use crate::meta_cache::MetaSetCache;
use crate::tag_bus::{BackedTagProvider, TagBus, UniformTagProvider};
use crate::{Address, MIN_TAG_GRANULARITY};
use log::debug;
use serde::Deserialize;
use std::path::Path;

/// One SoC element: an address range, its tag granularity, and the entity
/// whose metadata seeds the region.
///
/// ```yaml
/// SOC:
///   ram:
///     name: SOC.RAM
///     start: 0x80000000
///     end: 0x80100000
///     tag_granularity: 4
///     heterogeneous: true
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SocElement {
    /// Dotted entity path naming the region's initial metadata.
    pub name: String,
    pub start: Address,
    pub end: Address,
    #[serde(default = "default_granularity")]
    pub tag_granularity: Address,
    /// Heterogeneous regions get a per-word provider; others a uniform one.
    #[serde(default)]
    pub heterogeneous: bool,
}

fn default_granularity() -> Address {
    MIN_TAG_GRANULARITY
}

// The SOC node is kept as a raw mapping so elements apply in document order;
// the element key is only used for error reporting.
#[derive(Debug, Deserialize)]
struct SocDoc {
    #[serde(rename = "SOC")]
    soc: serde_yaml::Mapping,
}

/// The parsed SoC configuration.
#[derive(Debug)]
pub struct SocConfig {
    elements: Vec<SocElement>,
}

impl SocConfig {
    /// Loads and validates an SoC configuration document.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let doc: SocDoc = serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
            path: path.to_owned(),
            source,
        })?;
        let mut elements = Vec::with_capacity(doc.soc.len());
        for (key, value) in doc.soc {
            let element_name = key.as_str().unwrap_or("<non-string>").to_owned();
            let element: SocElement =
                serde_yaml::from_value(value).map_err(|source| {
                    ConfigError::Schema(format!("SOC element {element_name}: {source}"))
                })?;
            if element.start >= element.end {
                return Err(ConfigError::Schema(format!(
                    "SOC element {element_name}: empty range [{:#x}, {:#x})",
                    element.start, element.end
                )));
            }
            if !element.tag_granularity.is_power_of_two()
                || element.tag_granularity < MIN_TAG_GRANULARITY
            {
                return Err(ConfigError::Schema(format!(
                    "SOC element {element_name}: bad tag_granularity {}",
                    element.tag_granularity
                )));
            }
            elements.push(element);
        }
        Ok(Self { elements })
    }

    pub fn elements(&self) -> &[SocElement] {
        &self.elements
    }

    /// Installs one provider per element on `tag_bus`, seeded with each
    /// element's entity metadata (empty if the policy defines none).
    pub fn apply(
        &self,
        tag_bus: &mut TagBus,
        factory: &mut MetadataFactory,
        ms_cache: &mut MetaSetCache,
    ) -> Result<(), ConfigError> {
        for element in &self.elements {
            let set = factory.lookup_metadata(&element.name).cloned().unwrap_or_default();
            let tag = ms_cache.canonize(&set);
            let size = element.end - element.start;
            debug!(
                "tag region [{:#x}, {:#x}) <- {} (granularity {}, heterogeneous {})",
                element.start, element.end, element.name, element.tag_granularity, element.heterogeneous
            );
            let result = if element.heterogeneous {
                tag_bus.add_provider(
                    element.start,
                    element.end,
                    Box::new(BackedTagProvider::new(size, tag, element.tag_granularity)),
                )
            } else {
                tag_bus.add_provider(
                    element.start,
                    element.end,
                    Box::new(UniformTagProvider::new(size, tag)),
                )
            };
            result.map_err(|e| {
                ConfigError::Schema(format!("SOC element {}: {e}", element.name))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::tests::write_policy_dir;
    use std::fs;
    use tempfile::TempDir;

    const SOC_YML: &str = "\
SOC:
  ram:
    name: SOC.RAM
    start: 0x80000000
    end: 0x80001000
    heterogeneous: true
  rom:
    name: SOC.ROM
    start: 0x1000
    end: 0x2000
";

    #[test]
    fn test_parse_and_apply() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("soc.yml");
        fs::write(&path, SOC_YML).unwrap();
        let config = SocConfig::from_file(&path).unwrap();
        assert_eq!(2, config.elements().len());
        assert_eq!(MIN_TAG_GRANULARITY, config.elements()[0].tag_granularity);

        let policy = write_policy_dir();
        let mut factory = MetadataFactory::new(policy.path()).unwrap();
        let mut ms_cache = MetaSetCache::new();
        let mut bus = TagBus::new();
        config.apply(&mut bus, &mut factory, &mut ms_cache).unwrap();
        // SOC.RAM is a policy entity; SOC.ROM is not and seeds empty.
        let ram_tag = bus.data_tag_at(0x8000_0000).unwrap();
        assert_eq!(
            vec![11],
            ms_cache.deref(ram_tag).iter().collect::<Vec<_>>()
        );
        let rom_tag = bus.data_tag_at(0x1000).unwrap();
        assert!(ms_cache.deref(rom_tag).is_empty());
    }

    #[test]
    fn test_bad_granularity_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("soc.yml");
        fs::write(
            &path,
            "SOC:\n  ram:\n    name: SOC.RAM\n    start: 0\n    end: 0x100\n    tag_granularity: 3\n",
        )
        .unwrap();
        assert!(matches!(
            SocConfig::from_file(&path),
            Err(ConfigError::Schema(_))
        ));
    }
}
