use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use vdisk::vmdk::{AdapterType, DirLocator, DiskBuilder, DiskCreateType, VmdkDisk};
use vdisk::{
    describe_layers, shared, BackendStream, DiskError, DiskImageBuilder, FileBackend, Geometry,
    LayerInfo, PartitionInfo, PartitionTable, Stream, VirtualDisk,
};

#[derive(Parser, Debug)]
#[command(
    name = "vdisk",
    version,
    about = "Build VMDK images from raw disk content and inspect existing ones."
)]
struct Args {
    /// Log filter (tracing-subscriber EnvFilter syntax).
    ///
    /// Environment variable: `VDISK_LOG`.
    #[arg(long, global = true, env = "VDISK_LOG")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Wrap a raw disk image as a VMDK and write its files
    Build {
        /// Raw disk content (length must be a multiple of 512)
        input: PathBuf,

        /// Base name of the output files ("<NAME>.vmdk", "<NAME>-flat.vmdk", ...)
        #[arg(long)]
        name: String,

        /// Directory receiving the output files
        ///
        /// Environment variable: `VDISK_OUT_DIR`.
        #[arg(long, value_name = "DIR", env = "VDISK_OUT_DIR")]
        out_dir: Option<PathBuf>,

        /// VMDK create type (vmfs, monolithicFlat, twoGbMaxExtentFlat, vmfsSparse)
        #[arg(long = "type", value_name = "TYPE", default_value_t = DiskCreateType::Vmfs)]
        disk_type: DiskCreateType,

        /// Adapter recorded in the descriptor (ide, buslogic, lsilogic, legacyESX)
        #[arg(long, default_value_t = AdapterType::LsiLogicScsi)]
        adapter: AdapterType,

        /// Overwrite existing output files
        #[arg(long, action = clap::ArgAction::SetTrue)]
        force: bool,

        /// Write the build manifest JSON to this path (defaults to stdout)
        #[arg(long, value_name = "PATH")]
        manifest_out: Option<PathBuf>,
    },
    /// Print geometry, layers and partitions of a VMDK as JSON
    Info {
        /// Path to the descriptor file
        descriptor: PathBuf,
    },
}

#[derive(Debug)]
struct Config {
    log_level: String,
    command: Command,
}

impl Config {
    fn from_args(args: Args) -> Self {
        let log_level = args
            .log_level
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "info".to_string());
        Self {
            log_level,
            command: args.command,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BuildManifest {
    base_name: String,
    create_type: DiskCreateType,
    adapter_type: AdapterType,
    capacity_bytes: u64,
    files: Vec<ManifestFile>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ManifestFile {
    name: String,
    size_bytes: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DiskInfo {
    create_type: DiskCreateType,
    #[serde(skip_serializing_if = "Option::is_none")]
    adapter_type: Option<AdapterType>,
    content_id: String,
    capacity_bytes: u64,
    geometry: Geometry,
    #[serde(skip_serializing_if = "Option::is_none")]
    bios_geometry: Option<Geometry>,
    layers: Vec<LayerInfo>,
    /// `None` when the disk carries no MBR.
    partitions: Option<Vec<PartitionInfo>>,
}

fn main() -> anyhow::Result<()> {
    let config = Config::from_args(Args::parse());

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    run(config)
}

fn run(config: Config) -> anyhow::Result<()> {
    match config.command {
        Command::Build {
            input,
            name,
            out_dir,
            disk_type,
            adapter,
            force,
            manifest_out,
        } => {
            let out_dir = out_dir.unwrap_or_else(|| PathBuf::from("."));
            let manifest = build(&input, &name, &out_dir, disk_type, adapter, force)?;
            let json = serde_json::to_string_pretty(&manifest).context("serialize manifest")?;
            match manifest_out {
                Some(path) => fs::write(&path, json.as_bytes())
                    .with_context(|| format!("write manifest {}", path.display()))?,
                None => println!("{json}"),
            }
            Ok(())
        }
        Command::Info { descriptor } => {
            let info = info(&descriptor)?;
            let json = serde_json::to_string_pretty(&info).context("serialize disk info")?;
            println!("{json}");
            Ok(())
        }
    }
}

fn build(
    input: &Path,
    name: &str,
    out_dir: &Path,
    disk_type: DiskCreateType,
    adapter: AdapterType,
    force: bool,
) -> anyhow::Result<BuildManifest> {
    let backend = FileBackend::open_read_only(input)
        .with_context(|| format!("open input {}", input.display()))?;
    let content = shared(BackendStream::new(backend));
    let capacity_bytes = vdisk::lock(&content).len().context("input length")?;

    let mut builder = DiskBuilder::new();
    builder.set_disk_type(disk_type);
    builder.set_adapter_type(adapter);
    builder.set_content(content);
    let specs = builder.build(name).context("build vmdk")?;

    fs::create_dir_all(out_dir)
        .with_context(|| format!("create output directory {}", out_dir.display()))?;

    let mut files = Vec::with_capacity(specs.len());
    for spec in &specs {
        let path = out_dir.join(spec.name());
        let file = open_output_file(&path, force)
            .with_context(|| format!("create {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        let size_bytes = spec
            .write_to(&mut writer)
            .with_context(|| format!("write {}", path.display()))?;
        writer
            .flush()
            .with_context(|| format!("flush {}", path.display()))?;

        tracing::info!(file = %path.display(), size_bytes, "wrote image file");
        files.push(ManifestFile {
            name: spec.name().to_string(),
            size_bytes,
        });
    }

    Ok(BuildManifest {
        base_name: name.to_string(),
        create_type: disk_type,
        adapter_type: adapter,
        capacity_bytes,
        files,
    })
}

fn info(descriptor: &Path) -> anyhow::Result<DiskInfo> {
    let file_name = descriptor
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("descriptor path {} has no file name", descriptor.display()))?;
    let dir = descriptor.parent().unwrap_or_else(|| Path::new(""));
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };

    let disk = VmdkDisk::open(&DirLocator::new(dir), file_name)
        .with_context(|| format!("open {}", descriptor.display()))?;

    let partitions = match disk.partitions() {
        Ok(table) => Some(table.partitions().to_vec()),
        Err(DiskError::CorruptImage(_)) => None,
        Err(err) => bail!("read partition table: {err}"),
    };

    let desc = disk.descriptor();
    Ok(DiskInfo {
        create_type: desc.create_type(),
        adapter_type: desc.adapter_type(),
        content_id: format!("{:08x}", desc.content_id()),
        capacity_bytes: disk.capacity().context("disk capacity")?,
        geometry: disk.geometry(),
        bios_geometry: desc.disk_database().bios_geometry,
        layers: describe_layers(&disk),
        partitions,
    })
}

fn open_output_file(path: &Path, force: bool) -> anyhow::Result<fs::File> {
    let mut opts = OpenOptions::new();
    opts.write(true);
    if force {
        opts.create(true).truncate(true);
    } else {
        opts.create_new(true);
    }
    opts.open(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::AlreadyExists {
            anyhow!("{} already exists (use --force to overwrite)", path.display())
        } else {
            err.into()
        }
    })
}
