//! Address-range routing of tag loads and stores to per-region providers.

use crate::meta_cache::Tag;
use crate::{Address, MIN_TAG_GRANULARITY};
use std::cmp::Ordering;
use std::fmt::Debug;
use thiserror::Error;

/// Per-region tag storage.
///
/// Offsets are relative to the region start. Both access paths must reject
/// out-of-range offsets; `insn_*` accessors address the region at
/// [`MIN_TAG_GRANULARITY`] regardless of the provider's data granularity, so
/// instruction words can be tagged at word resolution even in regions with
/// coarser data tags.
pub trait TagProvider: Debug {
    fn data_tag(&self, offset: Address) -> Result<Tag, TagBusError>;
    fn set_data_tag(&mut self, offset: Address, tag: Tag) -> Result<(), TagBusError>;
    fn insn_tag(&self, offset: Address) -> Result<Tag, TagBusError>;
    fn set_insn_tag(&mut self, offset: Address, tag: Tag) -> Result<(), TagBusError>;
}

/// A provider holding one tag for its whole region.
///
/// Reads always return that tag; a write replaces it for every address of the
/// region.
#[derive(Debug)]
pub struct UniformTagProvider {
    size: Address,
    tag: Tag,
}

impl UniformTagProvider {
    pub fn new(size: Address, tag: Tag) -> Self {
        Self { size, tag }
    }

    fn check(&self, offset: Address) -> Result<(), TagBusError> {
        if offset < self.size {
            Ok(())
        } else {
            Err(TagBusError::OutOfRange { offset })
        }
    }
}

impl TagProvider for UniformTagProvider {
    fn data_tag(&self, offset: Address) -> Result<Tag, TagBusError> {
        self.check(offset)?;
        Ok(self.tag)
    }

    fn set_data_tag(&mut self, offset: Address, tag: Tag) -> Result<(), TagBusError> {
        self.check(offset)?;
        self.tag = tag;
        Ok(())
    }

    fn insn_tag(&self, offset: Address) -> Result<Tag, TagBusError> {
        self.data_tag(offset)
    }

    fn set_insn_tag(&mut self, offset: Address, tag: Tag) -> Result<(), TagBusError> {
        self.set_data_tag(offset, tag)
    }
}

/// A provider backed by one tag per `tag_granularity` bytes.
#[derive(Debug)]
pub struct BackedTagProvider {
    size: Address,
    tag_granularity: Address,
    tags: Vec<Tag>,
}

impl BackedTagProvider {
    /// Creates a provider for `size` bytes, every cell initialized to `tag`.
    ///
    /// # Panics
    ///
    /// Panics if `tag_granularity` is not a power of two of at least
    /// [`MIN_TAG_GRANULARITY`].
    pub fn new(size: Address, tag: Tag, tag_granularity: Address) -> Self {
        if !tag_granularity.is_power_of_two() || tag_granularity < MIN_TAG_GRANULARITY {
            panic!("invalid tag granularity {tag_granularity}");
        }
        // Backing is always at the finest granularity so instruction tags can
        // diverge from the region's coarser data tags.
        let len = (size / MIN_TAG_GRANULARITY) as usize + 1;
        Self {
            size,
            tag_granularity,
            tags: vec![tag; len],
        }
    }

    fn check(&self, offset: Address) -> Result<(), TagBusError> {
        if offset < self.size {
            Ok(())
        } else {
            Err(TagBusError::OutOfRange { offset })
        }
    }

    fn data_index(&self, offset: Address) -> usize {
        ((offset & !(self.tag_granularity - 1)) / MIN_TAG_GRANULARITY) as usize
    }

    fn insn_index(&self, offset: Address) -> usize {
        (offset / MIN_TAG_GRANULARITY) as usize
    }
}

impl TagProvider for BackedTagProvider {
    fn data_tag(&self, offset: Address) -> Result<Tag, TagBusError> {
        self.check(offset)?;
        Ok(self.tags[self.data_index(offset)])
    }

    fn set_data_tag(&mut self, offset: Address, tag: Tag) -> Result<(), TagBusError> {
        self.check(offset)?;
        let index = self.data_index(offset);
        self.tags[index] = tag;
        Ok(())
    }

    fn insn_tag(&self, offset: Address) -> Result<Tag, TagBusError> {
        self.check(offset)?;
        Ok(self.tags[self.insn_index(offset)])
    }

    fn set_insn_tag(&mut self, offset: Address, tag: Tag) -> Result<(), TagBusError> {
        self.check(offset)?;
        let index = self.insn_index(offset);
        self.tags[index] = tag;
        Ok(())
    }
}

/// Routes tag accesses to the provider of the region containing the address.
///
/// Regions are half-open `[start, end)`, must not overlap, and are fixed
/// after initialization. Addresses outside every region are unmapped.
#[derive(Debug, Default)]
pub struct TagBus {
    // Sorted by start; lookup is a binary search for the containing range.
    regions: Vec<Region>,
}

#[derive(Debug)]
struct Region {
    start: Address,
    end: Address,
    provider: Box<dyn TagProvider>,
}

impl TagBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a provider for `[start, end)`.
    pub fn add_provider(
        &mut self,
        start: Address,
        end: Address,
        provider: Box<dyn TagProvider>,
    ) -> Result<(), TagBusError> {
        if start >= end {
            return Err(TagBusError::EmptyRegion { start, end });
        }
        let index = self.regions.partition_point(|r| r.start < start);
        let overlaps_prev = index
            .checked_sub(1)
            .map(|i| self.regions[i].end > start)
            .unwrap_or(false);
        let overlaps_next = self
            .regions
            .get(index)
            .map(|r| r.start < end)
            .unwrap_or(false);
        if overlaps_prev || overlaps_next {
            return Err(TagBusError::Overlap { start, end });
        }
        self.regions.insert(
            index,
            Region {
                start,
                end,
                provider,
            },
        );
        Ok(())
    }

    fn region(&self, addr: Address) -> Result<&Region, TagBusError> {
        self.region_index(addr).map(|i| &self.regions[i])
    }

    fn region_index(&self, addr: Address) -> Result<usize, TagBusError> {
        self.regions
            .binary_search_by(|region| {
                if addr < region.start {
                    Ordering::Greater
                } else if addr >= region.end {
                    Ordering::Less
                } else {
                    Ordering::Equal
                }
            })
            .map_err(|_| TagBusError::Unmapped { addr })
    }

    /// The tag of the data word containing `addr`.
    pub fn data_tag_at(&self, addr: Address) -> Result<Tag, TagBusError> {
        let region = self.region(addr)?;
        region.provider.data_tag(addr - region.start)
    }

    pub fn set_data_tag_at(&mut self, addr: Address, tag: Tag) -> Result<(), TagBusError> {
        let index = self.region_index(addr)?;
        let region = &mut self.regions[index];
        region.provider.set_data_tag(addr - region.start, tag)
    }

    /// The tag of the instruction word at `addr`, always at
    /// [`MIN_TAG_GRANULARITY`] resolution.
    pub fn insn_tag_at(&self, addr: Address) -> Result<Tag, TagBusError> {
        let region = self.region(addr)?;
        region.provider.insn_tag(addr - region.start)
    }

    pub fn set_insn_tag_at(&mut self, addr: Address, tag: Tag) -> Result<(), TagBusError> {
        let index = self.region_index(addr)?;
        let region = &mut self.regions[index];
        region.provider.set_insn_tag(addr - region.start, tag)
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum TagBusError {
    /// Address not covered by any region.
    #[error("bad address {addr:#x}: not covered by any tag provider")]
    Unmapped { addr: Address },
    /// Offset past the end of a region's provider.
    #[error("bad offset {offset:#x}: outside provider region")]
    OutOfRange { offset: Address },
    /// Attempt to install a region overlapping an existing one.
    #[error("region [{start:#x}, {end:#x}) overlaps an existing region")]
    Overlap { start: Address, end: Address },
    /// Attempt to install a region with `start >= end`.
    #[error("region [{start:#x}, {end:#x}) is empty")]
    EmptyRegion { start: Address, end: Address },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta_cache::MetaSetCache;

    fn tags(n: u32) -> (MetaSetCache, Vec<Tag>) {
        let mut cache = MetaSetCache::new();
        let tags = (0..n).map(|i| cache.canonize_labels([i])).collect();
        (cache, tags)
    }

    #[test]
    fn test_uniform_provider_is_global() {
        let (_, t) = tags(2);
        let mut bus = TagBus::new();
        bus.add_provider(0x1000, 0x2000, Box::new(UniformTagProvider::new(0x1000, t[0])))
            .unwrap();
        assert_eq!(t[0], bus.data_tag_at(0x1000).unwrap());
        assert_eq!(t[0], bus.data_tag_at(0x1FFC).unwrap());
        bus.set_data_tag_at(0x1800, t[1]).unwrap();
        // A single write retags the whole region.
        assert_eq!(t[1], bus.data_tag_at(0x1000).unwrap());
        assert_eq!(t[1], bus.insn_tag_at(0x1FFC).unwrap());
    }

    #[test]
    fn test_backed_provider_word_resolution() {
        let (_, t) = tags(3);
        let mut bus = TagBus::new();
        bus.add_provider(
            0x8000_0000,
            0x8000_1000,
            Box::new(BackedTagProvider::new(0x1000, t[0], 4)),
        )
        .unwrap();
        bus.set_data_tag_at(0x8000_0010, t[1]).unwrap();
        assert_eq!(t[1], bus.data_tag_at(0x8000_0010).unwrap());
        assert_eq!(t[1], bus.data_tag_at(0x8000_0013).unwrap());
        assert_eq!(t[0], bus.data_tag_at(0x8000_0014).unwrap());
        assert_eq!(t[0], bus.data_tag_at(0x8000_000C).unwrap());
    }

    #[test]
    fn test_insn_tags_are_fine_grained_in_coarse_region() {
        let (_, t) = tags(2);
        let mut provider = BackedTagProvider::new(0x100, t[0], 16);
        // Tag one instruction word inside a 16-byte data cell.
        provider.set_insn_tag(0x24, t[1]).unwrap();
        assert_eq!(t[1], provider.insn_tag(0x24).unwrap());
        assert_eq!(t[0], provider.insn_tag(0x20).unwrap());
        // Data reads round down to the 16-byte cell.
        assert_eq!(t[0], provider.data_tag(0x24).unwrap());
        // A data write lands on the cell base.
        provider.set_data_tag(0x3C, t[1]).unwrap();
        assert_eq!(t[1], provider.data_tag(0x33).unwrap());
    }

    #[test]
    fn test_bus_totality() {
        let (_, t) = tags(1);
        let mut bus = TagBus::new();
        bus.add_provider(0x1000, 0x2000, Box::new(UniformTagProvider::new(0x1000, t[0])))
            .unwrap();
        bus.add_provider(0x4000, 0x5000, Box::new(UniformTagProvider::new(0x1000, t[0])))
            .unwrap();
        // Every address inside a declared region resolves.
        for addr in [0x1000, 0x1FFF, 0x4000, 0x4FFF] {
            assert!(bus.data_tag_at(addr).is_ok(), "{addr:#x}");
        }
        // None outside does.
        for addr in [0x0FFF, 0x2000, 0x3FFF, 0x5000] {
            assert_eq!(
                Err(TagBusError::Unmapped { addr }),
                bus.data_tag_at(addr),
                "{addr:#x}"
            );
        }
    }

    #[test]
    fn test_overlapping_regions_rejected() {
        let (_, t) = tags(1);
        let mut bus = TagBus::new();
        bus.add_provider(0x1000, 0x2000, Box::new(UniformTagProvider::new(0x1000, t[0])))
            .unwrap();
        let overlap = bus.add_provider(
            0x1800,
            0x2800,
            Box::new(UniformTagProvider::new(0x1000, t[0])),
        );
        assert!(matches!(overlap, Err(TagBusError::Overlap { .. })));
        let empty = bus.add_provider(0x3000, 0x3000, Box::new(UniformTagProvider::new(0, t[0])));
        assert!(matches!(empty, Err(TagBusError::EmptyRegion { .. })));
    }
}
