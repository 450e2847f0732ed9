//! Tagging toolchain driver: builds, indexes, and inspects tag-info files.

mod elf;

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use elf::{ElfImage, SectionKind};
use log::{info, warn};
use std::path::{Path, PathBuf};
use tagmon_core::factory::MetadataFactory;
use tagmon_core::soc_config::SocConfig;
use tagmon_core::taginfo::{
    self, FirmwareTagFile, MetadataMemoryMap, TagFileError, TagRange,
};

#[derive(Parser, Debug)]
#[command(version, about = "Tag-info tooling for the tag-based reference monitor", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a simulation-shape tag file from an ELF binary and SoC config.
    Gen {
        /// Policy directory holding policy_meta/init/group.yml.
        #[arg(long)]
        policy_dir: PathBuf,
        /// SoC configuration listing memory regions.
        #[arg(long)]
        soc: PathBuf,
        /// ELF binary whose sections are tagged.
        #[arg(long)]
        elf: PathBuf,
        /// Output tag file.
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Rewrite a simulation tag file into the firmware shape
    /// (header, de-duplicated metadata table, index maps).
    Firmware {
        #[arg(long)]
        policy_dir: PathBuf,
        #[arg(long)]
        soc: PathBuf,
        #[arg(long)]
        elf: PathBuf,
        /// Input simulation-shape tag file.
        tag_file: PathBuf,
        /// Output path; defaults to rewriting the input in place.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the contents of a tag file.
    Dump {
        /// The tag file is in the firmware shape. The two shapes cannot be
        /// told apart from the bytes alone, so say so explicitly.
        #[arg(short, long)]
        firmware: bool,
        /// Render label names through this policy's encoding tables.
        #[arg(long)]
        policy_dir: Option<PathBuf>,
        tag_file: PathBuf,
    },
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(error) = run(args.command) {
        eprintln!("error: {error:#}");
        let code = if error.downcast_ref::<TagFileError>().is_some() {
            2
        } else {
            1
        };
        std::process::exit(code);
    }
}

fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Gen {
            policy_dir,
            soc,
            elf,
            output,
        } => gen(&policy_dir, &soc, &elf, &output),
        Command::Firmware {
            policy_dir,
            soc,
            elf,
            tag_file,
            output,
        } => firmware(&policy_dir, &soc, &elf, &tag_file, output.as_deref()),
        Command::Dump {
            firmware,
            policy_dir,
            tag_file,
        } => dump(firmware, policy_dir.as_deref(), &tag_file),
    }
}

const ELF_EXEC_ENTITY: &str = "elf.Section.SHF_EXECINSTR";
const ELF_READ_ENTITY: &str = "elf.Section.SHF_ALLOC";
const ELF_WRITE_ENTITY: &str = "elf.Section.SHF_WRITE";

fn gen(policy_dir: &Path, soc: &Path, elf_path: &Path, output: &Path) -> anyhow::Result<()> {
    let mut factory = MetadataFactory::new(policy_dir)?;
    let image = load_elf(elf_path)?;
    let soc_config = SocConfig::from_file(soc)?;

    let mut map = MetadataMemoryMap::new();
    let tag_entity =
        |factory: &mut MetadataFactory, map: &mut MetadataMemoryMap, range: TagRange, entity: &str| {
            match factory.lookup_metadata(entity) {
                Some(set) => {
                    let set = set.clone();
                    map.add_range(range.start, range.end, &set);
                }
                None => warn!("policy defines no entity {entity}; range untagged"),
            }
        };

    for section in &image.sections {
        info!(
            "{} {}: {:#x} - {:#x}",
            match section.kind {
                SectionKind::Code => "X",
                SectionKind::WritableData => "W",
                SectionKind::ReadOnlyData => "R",
            },
            section.name,
            section.range.start,
            section.range.end
        );
        match section.kind {
            SectionKind::Code => {
                tag_entity(&mut factory, &mut map, section.range, ELF_EXEC_ENTITY);
                tag_entity(&mut factory, &mut map, section.range, ELF_READ_ENTITY);
            }
            SectionKind::WritableData => {
                tag_entity(&mut factory, &mut map, section.range, ELF_WRITE_ENTITY);
            }
            SectionKind::ReadOnlyData => {
                tag_entity(&mut factory, &mut map, section.range, ELF_READ_ENTITY);
            }
        }
    }

    // SoC regions whose names are policy entities are tagged as well.
    for element in soc_config.elements() {
        let range = TagRange {
            start: element.start,
            end: element.end,
        };
        if factory.lookup_metadata(&element.name).is_some() {
            info!("{}: {:#x} - {:#x}", element.name, range.start, range.end);
            tag_entity(&mut factory, &mut map, range, &element.name);
        }
    }

    taginfo::save_tags(&map, output)
        .with_context(|| format!("writing {}", output.display()))?;
    Ok(())
}

fn firmware(
    policy_dir: &Path,
    soc: &Path,
    elf_path: &Path,
    tag_file: &Path,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let mut factory = MetadataFactory::new(policy_dir)?;
    let image = load_elf(elf_path)?;
    let soc_config = SocConfig::from_file(soc)?;
    let map = taginfo::load_tags(tag_file)
        .with_context(|| format!("loading {}", tag_file.display()))?;

    let mut file = FirmwareTagFile {
        is_64_bit: image.is_64_bit,
        code_ranges: image.code_ranges(),
        ..Default::default()
    };
    // Data ranges cover the writable ELF sections plus every SoC region.
    let mut data_ranges = image.data_ranges();
    data_ranges.extend(soc_config.elements().iter().map(|element| TagRange {
        start: element.start,
        end: element.end,
    }));
    file.data_ranges = elf::coalesce(data_ranges);

    file.index_memory(&map);

    // Hoist the defaults out of the register/CSR maps into their own slots.
    let mut register_map = factory.lookup_metadata_map("ISA.RISCV.Reg");
    let mut csr_map = factory.lookup_metadata_map("ISA.RISCV.CSR");
    file.register_default = register_map
        .remove("ISA.RISCV.Reg.Default")
        .map(|set| file.intern(&set));
    file.env_default = register_map
        .remove("ISA.RISCV.Reg.Env")
        .map(|set| file.intern(&set));
    file.csr_default = csr_map
        .remove("ISA.RISCV.CSR.Default")
        .map(|set| file.intern(&set));
    for (name, set) in register_map {
        let index = file.intern(&set);
        file.register_index.push((name, index));
    }
    for (name, set) in csr_map {
        let index = file.intern(&set);
        file.csr_index.push((name, index));
    }

    let output = output.unwrap_or(tag_file);
    let mut writer = std::io::BufWriter::new(
        std::fs::File::create(output)
            .with_context(|| format!("creating {}", output.display()))?,
    );
    file.write(&mut writer)?;
    info!(
        "wrote firmware tag file with {} metadata values, {} memory ranges",
        file.metadata_values.len(),
        file.memory_index.len()
    );
    Ok(())
}

fn dump(is_firmware: bool, policy_dir: Option<&Path>, tag_file: &Path) -> anyhow::Result<()> {
    let factory = match policy_dir {
        Some(dir) => Some(MetadataFactory::new(dir)?),
        None => None,
    };
    let render = |set: &tagmon_core::MetaSet| match &factory {
        Some(factory) => factory.render(set, false),
        None => set
            .iter()
            .map(|label| label.to_string())
            .collect::<Vec<_>>()
            .join(", "),
    };

    if is_firmware {
        let mut reader = std::io::BufReader::new(
            std::fs::File::open(tag_file)
                .map_err(TagFileError::Io)
                .with_context(|| format!("opening {}", tag_file.display()))?,
        );
        let file = FirmwareTagFile::read(&mut reader)?;
        println!("{}-bit tag file", if file.is_64_bit { 64 } else { 32 });
        println!("Code ranges:");
        for range in &file.code_ranges {
            println!("{{ {:#018x} - {:#018x} }}", range.start, range.end);
        }
        println!("\nData ranges:");
        for range in &file.data_ranges {
            println!("{{ {:#018x} - {:#018x} }}", range.start, range.end);
        }
        println!("\nMetadata values:");
        for (index, set) in file.metadata_values.iter().enumerate() {
            println!("{index}: {{ {} }}", render(set));
        }
        println!("\nMemory index:");
        for (range, index) in &file.memory_index {
            println!(
                "{{ {:#018x} - {:#018x} }}: {index}",
                range.start, range.end
            );
        }
        let show_default = |label: &str, value: Option<u32>| match value {
            Some(index) => println!("{label}: {index}"),
            None => println!("{label}: -"),
        };
        show_default("\nRegister default", file.register_default);
        show_default("CSR default", file.csr_default);
        show_default("Env default", file.env_default);
        println!("\nRegisters:");
        for (name, index) in &file.register_index {
            println!("{name}: {index}");
        }
        println!("\nCSRs:");
        for (name, index) in &file.csr_index {
            println!("{name}: {index}");
        }
    } else {
        let map = taginfo::load_tags(tag_file)
            .with_context(|| format!("loading {}", tag_file.display()))?;
        for (range, set) in map.iter() {
            println!(
                "{{ {:#018x} - {:#018x} }}: {}",
                range.start,
                range.end,
                render(&set)
            );
        }
    }
    Ok(())
}

fn load_elf(path: &Path) -> anyhow::Result<ElfImage> {
    let bytes =
        std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if bytes.is_empty() {
        bail!("{} is empty", path.display());
    }
    ElfImage::parse(&bytes).with_context(|| format!("parsing {}", path.display()))
}
