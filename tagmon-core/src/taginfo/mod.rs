//! The tag-info file formats: metadata memory maps, the headerless
//! simulation shape, and the firmware shape with header and index tables.
//!
//! All integers are ULEB128-framed. The two shapes are not
//! self-disambiguating (a firmware file starts with a 0/1 flag, which is also
//! a legal range start), so callers choose the loader explicitly.

pub mod uleb;

use crate::meta_set::{MetaSet, MAX_LABELS};
use crate::{Address, MIN_TAG_GRANULARITY};
use log::warn;
use std::collections::BTreeMap;
use std::io::{BufRead, Read, Write};
use std::path::Path;
use thiserror::Error;
use uleb::{read_uleb, read_uleb_or_eof, write_uleb};

/// A half-open address range `[start, end)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct TagRange {
    pub start: Address,
    pub end: Address,
}

#[derive(Error, Debug)]
pub enum TagFileError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("label id {0} out of range")]
    LabelOutOfRange(u64),
    #[error("malformed tag file: {0}")]
    Malformed(String),
}

/// Word-granular map of memory addresses to metadata sets.
///
/// Ranges added later union into whatever is already present. Iteration
/// yields maximal runs of identically-tagged contiguous words in ascending
/// address order, which is also the file entry order.
#[derive(Debug, Default)]
pub struct MetadataMemoryMap {
    words: BTreeMap<Address, MetaSet>,
}

impl MetadataMemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags every word of `[start, end)` with `metadata`, unioning into any
    /// labels already present.
    pub fn add_range(&mut self, start: Address, end: Address, metadata: &MetaSet) {
        let mut addr = start & !(MIN_TAG_GRANULARITY - 1);
        while addr < end {
            self.words
                .entry(addr)
                .or_default()
                .union_with(metadata);
            addr += MIN_TAG_GRANULARITY;
        }
    }

    /// The metadata of the word containing `addr`, if tagged.
    pub fn get_metadata(&self, addr: Address) -> Option<&MetaSet> {
        self.words.get(&(addr & !(MIN_TAG_GRANULARITY - 1)))
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Attaches per-word argument fields (from the taginfo-args sidecar) to
    /// the mapped sets. Arguments for untagged words are dropped.
    pub fn apply_args(&mut self, args: &BTreeMap<Address, Vec<u32>>) {
        for (addr, values) in args {
            match self.words.get_mut(addr) {
                Some(set) => set.set_args(values),
                None => warn!("tag arguments for untagged address {addr:#x}"),
            }
        }
    }

    /// Iterates coalesced `(range, metadata)` runs in ascending order.
    ///
    /// Words coalesce only when both the label bitmap and the argument slots
    /// agree.
    pub fn iter(&self) -> impl Iterator<Item = (TagRange, MetaSet)> + '_ {
        CoalescedRuns {
            inner: self.words.iter().peekable(),
        }
    }
}

struct CoalescedRuns<'a> {
    inner: std::iter::Peekable<std::collections::btree_map::Iter<'a, Address, MetaSet>>,
}

impl Iterator for CoalescedRuns<'_> {
    type Item = (TagRange, MetaSet);

    fn next(&mut self) -> Option<Self::Item> {
        let (&start, set) = self.inner.next()?;
        let mut end = start + MIN_TAG_GRANULARITY;
        while let Some(&(&next, next_set)) = self.inner.peek() {
            if next != end || next_set != set || next_set.args() != set.args() {
                break;
            }
            end = next + MIN_TAG_GRANULARITY;
            self.inner.next();
        }
        (TagRange { start, end }, set.clone()).into()
    }
}

fn read_meta_set<R: Read>(reader: &mut R) -> Result<MetaSet, TagFileError> {
    let count = read_uleb(reader)?;
    let mut set = MetaSet::new();
    for _ in 0..count {
        let label = read_uleb(reader)?;
        if label >= MAX_LABELS as u64 {
            return Err(TagFileError::LabelOutOfRange(label));
        }
        set.insert(label as u32);
    }
    Ok(set)
}

fn write_meta_set<W: Write>(writer: &mut W, set: &MetaSet) -> Result<(), TagFileError> {
    write_uleb(writer, set.len() as u64)?;
    for label in set.iter() {
        write_uleb(writer, u64::from(label))?;
    }
    Ok(())
}

/// Writes a map in the simulation shape: a headerless stream of
/// `start end count label*` entries ordered by start address.
pub fn write_tags<W: Write>(map: &MetadataMemoryMap, writer: &mut W) -> Result<(), TagFileError> {
    for (range, set) in map.iter() {
        write_uleb(writer, range.start)?;
        write_uleb(writer, range.end)?;
        write_meta_set(writer, &set)?;
    }
    Ok(())
}

/// Reads a simulation-shape stream until end of input.
pub fn read_tags<R: Read>(reader: &mut R) -> Result<MetadataMemoryMap, TagFileError> {
    let mut map = MetadataMemoryMap::new();
    while let Some(start) = read_uleb_or_eof(reader)? {
        let end = read_uleb(reader)?;
        if end < start {
            return Err(TagFileError::Malformed(format!(
                "range [{start:#x}, {end:#x}) is inverted"
            )));
        }
        let set = read_meta_set(reader)?;
        map.add_range(start, end, &set);
    }
    Ok(map)
}

/// [`write_tags`] to a file path.
pub fn save_tags(map: &MetadataMemoryMap, path: &Path) -> Result<(), TagFileError> {
    let mut writer = std::io::BufWriter::new(std::fs::File::create(path)?);
    write_tags(map, &mut writer)
}

/// [`read_tags`] from a file path.
pub fn load_tags(path: &Path) -> Result<MetadataMemoryMap, TagFileError> {
    let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
    read_tags(&mut reader)
}

/// Parses the plain-ASCII taginfo-args sidecar: one `start_hex end_hex
/// arg0 arg1 …` line per range, expanded to per-word argument vectors.
pub fn read_tag_args<R: BufRead>(
    reader: R,
) -> Result<BTreeMap<Address, Vec<u32>>, TagFileError> {
    let mut args = BTreeMap::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        if tokens.len() < 2 {
            return Err(TagFileError::Malformed(format!(
                "args line {}: fewer than two tokens",
                number + 1
            )));
        }
        let parse_hex = |token: &str| {
            Address::from_str_radix(token.trim_start_matches("0x"), 16).map_err(|_| {
                TagFileError::Malformed(format!("args line {}: bad address {token}", number + 1))
            })
        };
        let start = parse_hex(tokens[0])?;
        let end = parse_hex(tokens[1])?;
        let values = tokens[2..]
            .iter()
            .map(|token| {
                token.parse::<u32>().map_err(|_| {
                    TagFileError::Malformed(format!(
                        "args line {}: bad argument {token}",
                        number + 1
                    ))
                })
            })
            .collect::<Result<Vec<u32>, _>>()?;
        let mut addr = start;
        while addr < end {
            args.insert(addr, values.clone());
            addr += MIN_TAG_GRANULARITY;
        }
    }
    Ok(args)
}

/// The firmware tag file: header, de-duplicated metadata value table, and
/// index maps for memory ranges, registers, and CSRs.
#[derive(Debug, Default)]
pub struct FirmwareTagFile {
    pub is_64_bit: bool,
    pub code_ranges: Vec<TagRange>,
    pub data_ranges: Vec<TagRange>,
    pub metadata_values: Vec<MetaSet>,
    pub memory_index: Vec<(TagRange, u32)>,
    pub register_default: Option<u32>,
    pub csr_default: Option<u32>,
    pub env_default: Option<u32>,
    pub register_index: Vec<(String, u32)>,
    pub csr_index: Vec<(String, u32)>,
}

impl FirmwareTagFile {
    /// De-duplicates the sets of `map` into a value table plus range index,
    /// filling `metadata_values` and `memory_index`.
    pub fn index_memory(&mut self, map: &MetadataMemoryMap) {
        let mut seen: BTreeMap<Vec<u32>, u32> = BTreeMap::new();
        for (range, set) in map.iter() {
            let key: Vec<u32> = set.iter().collect();
            let index = *seen.entry(key).or_insert_with(|| {
                self.metadata_values.push(set.clone());
                (self.metadata_values.len() - 1) as u32
            });
            self.memory_index.push((range, index));
        }
    }

    /// Interns one set into the value table, returning its index.
    pub fn intern(&mut self, set: &MetaSet) -> u32 {
        if let Some(index) = self.metadata_values.iter().position(|v| v == set) {
            return index as u32;
        }
        self.metadata_values.push(set.clone());
        (self.metadata_values.len() - 1) as u32
    }

    /// Reconstructs the memory map described by the index tables.
    pub fn memory_map(&self) -> Result<MetadataMemoryMap, TagFileError> {
        let mut map = MetadataMemoryMap::new();
        for (range, index) in &self.memory_index {
            let set = self.metadata_values.get(*index as usize).ok_or_else(|| {
                TagFileError::Malformed(format!("metadata index {index} out of table"))
            })?;
            map.add_range(range.start, range.end, set);
        }
        Ok(map)
    }

    /// Serializes in the firmware shape.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<(), TagFileError> {
        write_uleb(writer, u64::from(self.is_64_bit))?;

        for ranges in [&self.code_ranges, &self.data_ranges] {
            write_uleb(writer, ranges.len() as u64)?;
            for range in ranges {
                write_uleb(writer, range.start)?;
                write_uleb(writer, range.end)?;
            }
        }

        write_uleb(writer, self.metadata_values.len() as u64)?;
        for set in &self.metadata_values {
            write_meta_set(writer, set)?;
        }

        write_uleb(writer, self.memory_index.len() as u64)?;
        for (range, index) in &self.memory_index {
            write_uleb(writer, range.start)?;
            write_uleb(writer, range.end)?;
            write_uleb(writer, u64::from(*index))?;
        }

        // Default indices are shifted by one so 0 can mean "absent".
        for default in [self.register_default, self.csr_default, self.env_default] {
            write_uleb(writer, default.map_or(0, |index| u64::from(index) + 1))?;
        }
        for index_map in [&self.register_index, &self.csr_index] {
            write_uleb(writer, index_map.len() as u64)?;
            for (name, index) in index_map {
                write_uleb(writer, name.len() as u64)?;
                writer.write_all(name.as_bytes())?;
                write_uleb(writer, u64::from(*index))?;
            }
        }
        Ok(())
    }

    /// Deserializes the firmware shape.
    pub fn read<R: Read>(reader: &mut R) -> Result<Self, TagFileError> {
        let mut file = Self::default();
        file.is_64_bit = match read_uleb(reader)? {
            0 => false,
            1 => true,
            other => {
                return Err(TagFileError::Malformed(format!(
                    "bad is_64_bit flag {other}"
                )))
            }
        };

        let read_ranges = |reader: &mut R| -> Result<Vec<TagRange>, TagFileError> {
            let count = read_uleb(reader)?;
            let mut ranges = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                let start = read_uleb(reader)?;
                let end = read_uleb(reader)?;
                ranges.push(TagRange { start, end });
            }
            Ok(ranges)
        };
        file.code_ranges = read_ranges(reader)?;
        file.data_ranges = read_ranges(reader)?;

        let value_count = read_uleb(reader)?;
        for _ in 0..value_count {
            file.metadata_values.push(read_meta_set(reader)?);
        }

        let index_count = read_uleb(reader)?;
        for _ in 0..index_count {
            let start = read_uleb(reader)?;
            let end = read_uleb(reader)?;
            let index = read_index(reader, file.metadata_values.len())?;
            file.memory_index.push((TagRange { start, end }, index));
        }

        let read_default = |reader: &mut R| -> Result<Option<u32>, TagFileError> {
            match read_uleb(reader)? {
                0 => Ok(None),
                shifted => Ok(Some((shifted - 1) as u32)),
            }
        };
        file.register_default = read_default(reader)?;
        file.csr_default = read_default(reader)?;
        file.env_default = read_default(reader)?;

        let table_len = file.metadata_values.len();
        file.register_index = read_name_index_map(reader, table_len)?;
        file.csr_index = read_name_index_map(reader, table_len)?;
        Ok(file)
    }
}

fn read_name_index_map<R: Read>(
    reader: &mut R,
    table_len: usize,
) -> Result<Vec<(String, u32)>, TagFileError> {
    let count = read_uleb(reader)?;
    let mut index_map = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let name_len = read_uleb(reader)? as usize;
        let mut name = vec![0u8; name_len];
        reader.read_exact(&mut name)?;
        let name = String::from_utf8(name)
            .map_err(|_| TagFileError::Malformed("register name is not UTF-8".into()))?;
        let index = read_index(reader, table_len)?;
        index_map.push((name, index));
    }
    Ok(index_map)
}

fn read_index<R: Read>(reader: &mut R, table_len: usize) -> Result<u32, TagFileError> {
    let index = read_uleb(reader)?;
    if index as usize >= table_len {
        return Err(TagFileError::Malformed(format!(
            "metadata index {index} out of table"
        )));
    }
    Ok(index as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn set(labels: &[u32]) -> MetaSet {
        labels.iter().copied().collect()
    }

    #[test]
    fn test_add_range_unions() {
        let mut map = MetadataMemoryMap::new();
        map.add_range(0x100, 0x110, &set(&[1]));
        map.add_range(0x108, 0x118, &set(&[2]));
        assert_eq!(&set(&[1]), map.get_metadata(0x104).unwrap());
        assert_eq!(&set(&[1, 2]), map.get_metadata(0x108).unwrap());
        assert_eq!(&set(&[2]), map.get_metadata(0x114).unwrap());
        assert!(map.get_metadata(0x118).is_none());
    }

    #[test]
    fn test_iter_coalesces_runs() {
        let mut map = MetadataMemoryMap::new();
        map.add_range(0x100, 0x110, &set(&[1]));
        map.add_range(0x110, 0x118, &set(&[2]));
        map.add_range(0x200, 0x204, &set(&[1]));
        let runs: Vec<_> = map.iter().collect();
        assert_eq!(
            vec![
                (TagRange { start: 0x100, end: 0x110 }, set(&[1])),
                (TagRange { start: 0x110, end: 0x118 }, set(&[2])),
                (TagRange { start: 0x200, end: 0x204 }, set(&[1])),
            ],
            runs
        );
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut map = MetadataMemoryMap::new();
        map.add_range(0x8000_0000, 0x8000_0010, &set(&[1, 5]));
        map.add_range(0x8000_0100, 0x8000_0108, &set(&[2]));
        map.add_range(0x9000_0000, 0x9000_0004, &set(&[3, 4, 6]));

        let mut buf = Vec::new();
        write_tags(&map, &mut buf).unwrap();
        let loaded = read_tags(&mut Cursor::new(&buf)).unwrap();

        assert_eq!(
            map.iter().collect::<Vec<_>>(),
            loaded.iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_truncated_file() {
        let mut map = MetadataMemoryMap::new();
        map.add_range(0x100, 0x104, &set(&[1]));
        let mut buf = Vec::new();
        write_tags(&map, &mut buf).unwrap();
        buf.pop();
        assert!(matches!(
            read_tags(&mut Cursor::new(&buf)),
            Err(TagFileError::Io(_))
        ));
    }

    #[test]
    fn test_label_out_of_range() {
        let mut buf = Vec::new();
        write_uleb(&mut buf, 0x100).unwrap(); // start
        write_uleb(&mut buf, 0x104).unwrap(); // end
        write_uleb(&mut buf, 1).unwrap(); // count
        write_uleb(&mut buf, 9999).unwrap(); // label
        assert!(matches!(
            read_tags(&mut Cursor::new(&buf)),
            Err(TagFileError::LabelOutOfRange(9999))
        ));
    }

    #[test]
    fn test_args_sidecar() {
        let text = "80000000 80000008 17 4\n80000100 80000104 9\n";
        let args = read_tag_args(Cursor::new(text)).unwrap();
        assert_eq!(vec![17, 4], args[&0x8000_0000]);
        assert_eq!(vec![17, 4], args[&0x8000_0004]);
        assert_eq!(vec![9], args[&0x8000_0100]);
        assert_eq!(3, args.len());

        let mut map = MetadataMemoryMap::new();
        map.add_range(0x8000_0000, 0x8000_0010, &set(&[1]));
        map.apply_args(&args);
        assert_eq!(&[17, 4], map.get_metadata(0x8000_0000).unwrap().args());
        assert_eq!(&[0, 0], map.get_metadata(0x8000_0008).unwrap().args());
        // Words with different argument fields do not coalesce.
        let runs: Vec<_> = map.iter().collect();
        assert_eq!(2, runs.len());
        assert_eq!(TagRange { start: 0x8000_0000, end: 0x8000_0008 }, runs[0].0);
    }

    #[test]
    fn test_args_sidecar_rejects_garbage() {
        assert!(read_tag_args(Cursor::new("80000000\n")).is_err());
        assert!(read_tag_args(Cursor::new("zz 80000008\n")).is_err());
        assert!(read_tag_args(Cursor::new("80000000 80000008 nope\n")).is_err());
        assert!(read_tag_args(Cursor::new("\n\n")).unwrap().is_empty());
    }

    #[test]
    fn test_firmware_round_trip() {
        let mut map = MetadataMemoryMap::new();
        map.add_range(0x8000_0000, 0x8000_0010, &set(&[1]));
        map.add_range(0x8000_0010, 0x8000_0020, &set(&[2]));
        map.add_range(0x9000_0000, 0x9000_0008, &set(&[1]));

        let mut file = FirmwareTagFile {
            is_64_bit: true,
            code_ranges: vec![TagRange { start: 0x8000_0000, end: 0x8000_0020 }],
            data_ranges: vec![TagRange { start: 0x9000_0000, end: 0x9000_1000 }],
            ..Default::default()
        };
        file.index_memory(&map);
        // Two distinct sets; {1} is shared by two ranges.
        assert_eq!(2, file.metadata_values.len());
        assert_eq!(3, file.memory_index.len());

        let reg_default = file.intern(&set(&[1]));
        file.register_default = Some(reg_default);
        let env = file.intern(&set(&[3]));
        file.env_default = Some(env);
        let rzero = file.intern(&set(&[2]));
        file.register_index
            .push(("ISA.RISCV.Reg.RZero".to_owned(), rzero));
        let mepc = file.intern(&set(&[1]));
        file.csr_index.push(("ISA.RISCV.CSR.MEPC".to_owned(), mepc));

        let mut buf = Vec::new();
        file.write(&mut buf).unwrap();
        let loaded = FirmwareTagFile::read(&mut Cursor::new(&buf)).unwrap();

        assert!(loaded.is_64_bit);
        assert_eq!(file.code_ranges, loaded.code_ranges);
        assert_eq!(file.data_ranges, loaded.data_ranges);
        assert_eq!(file.metadata_values, loaded.metadata_values);
        assert_eq!(file.memory_index, loaded.memory_index);
        assert_eq!(Some(reg_default), loaded.register_default);
        assert_eq!(None, loaded.csr_default);
        assert_eq!(Some(env), loaded.env_default);
        assert_eq!(file.register_index, loaded.register_index);
        assert_eq!(file.csr_index, loaded.csr_index);

        // The reconstructed memory map matches the original.
        assert_eq!(
            map.iter().collect::<Vec<_>>(),
            loaded.memory_map().unwrap().iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_firmware_rejects_dangling_index() {
        let mut buf = Vec::new();
        write_uleb(&mut buf, 0).unwrap(); // is_64_bit
        write_uleb(&mut buf, 0).unwrap(); // code ranges
        write_uleb(&mut buf, 0).unwrap(); // data ranges
        write_uleb(&mut buf, 0).unwrap(); // metadata values
        write_uleb(&mut buf, 1).unwrap(); // one index entry
        write_uleb(&mut buf, 0x100).unwrap();
        write_uleb(&mut buf, 0x104).unwrap();
        write_uleb(&mut buf, 7).unwrap(); // index into empty table
        assert!(matches!(
            FirmwareTagFile::read(&mut Cursor::new(&buf)),
            Err(TagFileError::Malformed(_))
        ));
    }
}
