//! ELF section scanning for the tagging toolchain.

use goblin::elf::section_header::{SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE};
use goblin::elf::Elf;
use log::debug;
use tagmon_core::taginfo::TagRange;

/// Classification of an allocatable ELF section by its RWX flags.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SectionKind {
    Code,
    WritableData,
    ReadOnlyData,
}

/// One allocatable section, its range word-aligned at the end.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub kind: SectionKind,
    pub range: TagRange,
}

/// The section-level view the tagging tools need from an ELF image.
#[derive(Debug)]
pub struct ElfImage {
    pub is_64_bit: bool,
    pub sections: Vec<Section>,
}

impl ElfImage {
    pub fn parse(bytes: &[u8]) -> Result<Self, goblin::error::Error> {
        let elf = Elf::parse(bytes)?;
        let mut sections = Vec::new();
        for (index, header) in elf.section_headers.iter().enumerate() {
            let flags = header.sh_flags;
            if flags & u64::from(SHF_ALLOC) == 0 {
                continue;
            }
            let kind = if flags & u64::from(SHF_EXECINSTR) != 0 {
                SectionKind::Code
            } else if flags & u64::from(SHF_WRITE) != 0 {
                SectionKind::WritableData
            } else {
                SectionKind::ReadOnlyData
            };
            let start = header.sh_addr;
            let mut end = header.sh_addr + header.sh_size;
            if end % 4 != 0 {
                end += 4 - end % 4;
            }
            if start == end {
                continue;
            }
            let name = elf
                .shdr_strtab
                .get_at(header.sh_name)
                .unwrap_or("<unnamed>")
                .to_owned();
            debug!("section {index} {name}: [{start:#x}, {end:#x}) {kind:?}");
            sections.push(Section {
                name,
                kind,
                range: TagRange { start, end },
            });
        }
        Ok(Self {
            is_64_bit: elf.is_64,
            sections,
        })
    }

    /// Sorted, coalesced code ranges (sections with the exec flag).
    pub fn code_ranges(&self) -> Vec<TagRange> {
        coalesce(
            self.sections
                .iter()
                .filter(|s| s.kind == SectionKind::Code)
                .map(|s| s.range)
                .collect(),
        )
    }

    /// Sorted, coalesced data ranges (allocatable non-exec sections).
    pub fn data_ranges(&self) -> Vec<TagRange> {
        coalesce(
            self.sections
                .iter()
                .filter(|s| s.kind != SectionKind::Code)
                .map(|s| s.range)
                .collect(),
        )
    }
}

/// Sorts ranges by start and merges overlapping or adjacent ones.
pub fn coalesce(mut ranges: Vec<TagRange>) -> Vec<TagRange> {
    ranges.sort_by_key(|range| range.start);
    let mut merged: Vec<TagRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(previous) if range.start <= previous.end => {
                previous.end = previous.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    merged
}
