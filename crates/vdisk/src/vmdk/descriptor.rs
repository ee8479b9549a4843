//! The VMDK text descriptor.
//!
//! ```text
//! # Disk DescriptorFile
//! version=1
//! encoding="UTF-8"
//! CID=5f3e20c1
//! parentCID=ffffffff
//! createType="vmfs"
//!
//! # Extent description
//! RW 2048 VMFS "disk1-flat.vmdk" 0
//!
//! # The Disk Data Base
//! #DDB
//!
//! ddb.adapterType = "lsilogic"
//! ddb.geometry.cylinders = "1"
//! ...
//! ```
//!
//! Rendering is deterministic: header keys, extents and DDB keys are always written in the same
//! order, and unknown keys are kept sorted.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::io;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{DiskError, Geometry, Result};

/// `parentCID` value of a disk without a parent.
pub const NO_PARENT_CONTENT_ID: u32 = 0xffff_ffff;

const DESCRIPTOR_VERSION: u32 = 1;
const VIRTUAL_HW_VERSION: &str = "4";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExtentAccess {
    None,
    ReadOnly,
    ReadWrite,
}

impl ExtentAccess {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtentAccess::None => "NOACCESS",
            ExtentAccess::ReadOnly => "RDONLY",
            ExtentAccess::ReadWrite => "RW",
        }
    }
}

impl FromStr for ExtentAccess {
    type Err = DiskError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NOACCESS" => Ok(ExtentAccess::None),
            "RDONLY" => Ok(ExtentAccess::ReadOnly),
            "RW" => Ok(ExtentAccess::ReadWrite),
            other => Err(DiskError::InvalidDescriptor(format!(
                "unknown extent access {other:?}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExtentType {
    Flat,
    Sparse,
    Zero,
    Vmfs,
    VmfsSparse,
    VmfsRdm,
    VmfsRaw,
}

impl ExtentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtentType::Flat => "FLAT",
            ExtentType::Sparse => "SPARSE",
            ExtentType::Zero => "ZERO",
            ExtentType::Vmfs => "VMFS",
            ExtentType::VmfsSparse => "VMFSSPARSE",
            ExtentType::VmfsRdm => "VMFSRDM",
            ExtentType::VmfsRaw => "VMFSRAW",
        }
    }
}

impl FromStr for ExtentType {
    type Err = DiskError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "FLAT" => Ok(ExtentType::Flat),
            "SPARSE" => Ok(ExtentType::Sparse),
            "ZERO" => Ok(ExtentType::Zero),
            "VMFS" => Ok(ExtentType::Vmfs),
            "VMFSSPARSE" => Ok(ExtentType::VmfsSparse),
            "VMFSRDM" => Ok(ExtentType::VmfsRdm),
            "VMFSRAW" => Ok(ExtentType::VmfsRaw),
            other => Err(DiskError::InvalidDescriptor(format!(
                "unknown extent type {other:?}"
            ))),
        }
    }
}

/// The `createType` of a descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiskCreateType {
    MonolithicSparse,
    VmfsSparse,
    MonolithicFlat,
    Vmfs,
    TwoGbMaxExtentSparse,
    TwoGbMaxExtentFlat,
    FullDevice,
    VmfsRaw,
    PartitionedDevice,
    VmfsRawDeviceMap,
    VmfsPassthroughRawDeviceMap,
    StreamOptimized,
}

impl DiskCreateType {
    pub const ALL: [DiskCreateType; 12] = [
        DiskCreateType::MonolithicSparse,
        DiskCreateType::VmfsSparse,
        DiskCreateType::MonolithicFlat,
        DiskCreateType::Vmfs,
        DiskCreateType::TwoGbMaxExtentSparse,
        DiskCreateType::TwoGbMaxExtentFlat,
        DiskCreateType::FullDevice,
        DiskCreateType::VmfsRaw,
        DiskCreateType::PartitionedDevice,
        DiskCreateType::VmfsRawDeviceMap,
        DiskCreateType::VmfsPassthroughRawDeviceMap,
        DiskCreateType::StreamOptimized,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DiskCreateType::MonolithicSparse => "monolithicSparse",
            DiskCreateType::VmfsSparse => "vmfsSparse",
            DiskCreateType::MonolithicFlat => "monolithicFlat",
            DiskCreateType::Vmfs => "vmfs",
            DiskCreateType::TwoGbMaxExtentSparse => "twoGbMaxExtentSparse",
            DiskCreateType::TwoGbMaxExtentFlat => "twoGbMaxExtentFlat",
            DiskCreateType::FullDevice => "fullDevice",
            DiskCreateType::VmfsRaw => "vmfsRaw",
            DiskCreateType::PartitionedDevice => "partitionedDevice",
            DiskCreateType::VmfsRawDeviceMap => "vmfsRawDeviceMap",
            DiskCreateType::VmfsPassthroughRawDeviceMap => "vmfsPassthroughRawDeviceMap",
            DiskCreateType::StreamOptimized => "streamOptimized",
        }
    }
}

impl fmt::Display for DiskCreateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiskCreateType {
    type Err = DiskError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DiskError::InvalidDescriptor(format!("unknown create type {s:?}")))
    }
}

/// The `ddb.adapterType` value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterType {
    #[serde(rename = "ide")]
    Ide,
    #[serde(rename = "buslogic")]
    BusLogicScsi,
    #[default]
    #[serde(rename = "lsilogic")]
    LsiLogicScsi,
    #[serde(rename = "legacyESX")]
    LegacyEsx,
}

impl AdapterType {
    pub fn as_str(self) -> &'static str {
        match self {
            AdapterType::Ide => "ide",
            AdapterType::BusLogicScsi => "buslogic",
            AdapterType::LsiLogicScsi => "lsilogic",
            AdapterType::LegacyEsx => "legacyESX",
        }
    }
}

impl fmt::Display for AdapterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdapterType {
    type Err = DiskError;

    fn from_str(s: &str) -> Result<Self> {
        [
            AdapterType::Ide,
            AdapterType::BusLogicScsi,
            AdapterType::LsiLogicScsi,
            AdapterType::LegacyEsx,
        ]
        .into_iter()
        .find(|t| t.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| DiskError::InvalidDescriptor(format!("unknown adapter type {s:?}")))
    }
}

/// One line of the extent section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtentDescriptor {
    access: ExtentAccess,
    size_in_sectors: u64,
    extent_type: ExtentType,
    file_name: Option<String>,
    offset: u64,
}

impl ExtentDescriptor {
    pub fn new(
        access: ExtentAccess,
        size_in_sectors: u64,
        extent_type: ExtentType,
        file_name: impl Into<String>,
        offset: u64,
    ) -> Self {
        Self {
            access,
            size_in_sectors,
            extent_type,
            file_name: Some(file_name.into()),
            offset,
        }
    }

    /// A ZERO extent, which has no backing file.
    pub fn zero(access: ExtentAccess, size_in_sectors: u64) -> Self {
        Self {
            access,
            size_in_sectors,
            extent_type: ExtentType::Zero,
            file_name: None,
            offset: 0,
        }
    }

    pub fn access(&self) -> ExtentAccess {
        self.access
    }

    pub fn size_in_sectors(&self) -> u64 {
        self.size_in_sectors
    }

    pub fn extent_type(&self) -> ExtentType {
        self.extent_type
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    /// Offset into the backing file, in sectors.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl fmt::Display for ExtentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.access.as_str(),
            self.size_in_sectors,
            self.extent_type.as_str()
        )?;
        if let Some(name) = &self.file_name {
            write!(f, " \"{name}\" {}", self.offset)?;
        }
        Ok(())
    }
}

impl FromStr for ExtentDescriptor {
    type Err = DiskError;

    fn from_str(line: &str) -> Result<Self> {
        let bad = || DiskError::InvalidDescriptor(format!("malformed extent line {line:?}"));

        let mut rest = line.trim();
        let access: ExtentAccess = next_token(&mut rest).ok_or_else(bad)?.parse()?;
        let size_in_sectors: u64 = next_token(&mut rest)
            .ok_or_else(bad)?
            .parse()
            .map_err(|_| bad())?;
        let extent_type: ExtentType = next_token(&mut rest).ok_or_else(bad)?.parse()?;

        let tail = rest.trim();
        if tail.is_empty() {
            if extent_type != ExtentType::Zero {
                return Err(bad());
            }
            return Ok(Self::zero(access, size_in_sectors));
        }

        let quoted = tail.strip_prefix('"').ok_or_else(bad)?;
        let close = quoted.find('"').ok_or_else(bad)?;
        let file_name = &quoted[..close];
        let after = quoted[close + 1..].trim();
        let offset: u64 = match after.split_whitespace().next() {
            Some(token) => token.parse().map_err(|_| bad())?,
            None => 0,
        };

        Ok(Self::new(
            access,
            size_in_sectors,
            extent_type,
            file_name,
            offset,
        ))
    }
}

fn next_token<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let trimmed = rest.trim_start();
    let end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
    let (token, tail) = trimmed.split_at(end);
    *rest = tail;
    (!token.is_empty()).then_some(token)
}

/// The `ddb.*` section.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiskDatabase {
    pub adapter_type: Option<AdapterType>,
    pub geometry: Option<Geometry>,
    pub bios_geometry: Option<Geometry>,
    pub virtual_hw_version: Option<String>,
    pub uuid: Option<String>,
    /// Other `ddb.` keys, without the prefix.
    pub extra: BTreeMap<String, String>,
}

impl DiskDatabase {
    fn render(&self, out: &mut String) -> fmt::Result {
        if let Some(adapter) = self.adapter_type {
            ddb_line(out, "adapterType", adapter.as_str())?;
        }
        if let Some(g) = self.geometry {
            ddb_line(out, "geometry.cylinders", g.cylinders())?;
            ddb_line(out, "geometry.heads", g.heads())?;
            ddb_line(out, "geometry.sectors", g.sectors_per_track())?;
        }
        if let Some(g) = self.bios_geometry {
            ddb_line(out, "geometry.biosCylinders", g.cylinders())?;
            ddb_line(out, "geometry.biosHeads", g.heads())?;
            ddb_line(out, "geometry.biosSectors", g.sectors_per_track())?;
        }
        if let Some(v) = &self.virtual_hw_version {
            ddb_line(out, "virtualHWVersion", v)?;
        }
        if let Some(uuid) = &self.uuid {
            ddb_line(out, "uuid", uuid)?;
        }
        for (key, value) in &self.extra {
            ddb_line(out, key, value)?;
        }
        Ok(())
    }

    fn from_pairs(mut pairs: BTreeMap<String, String>) -> Result<Self> {
        let adapter_type: Option<AdapterType> = pairs
            .remove("adapterType")
            .map(|v| v.parse())
            .transpose()?;
        let geometry = take_geometry(&mut pairs, ["cylinders", "heads", "sectors"])?;
        let bios_geometry =
            take_geometry(&mut pairs, ["biosCylinders", "biosHeads", "biosSectors"])?;
        Ok(Self {
            adapter_type,
            geometry,
            bios_geometry,
            virtual_hw_version: pairs.remove("virtualHWVersion"),
            uuid: pairs.remove("uuid"),
            extra: pairs,
        })
    }
}

fn ddb_line(out: &mut String, key: &str, value: impl fmt::Display) -> fmt::Result {
    writeln!(out, "ddb.{key} = \"{value}\"")
}

fn take_geometry(
    pairs: &mut BTreeMap<String, String>,
    keys: [&str; 3],
) -> Result<Option<Geometry>> {
    let values: Vec<Option<String>> = keys
        .iter()
        .map(|k| pairs.remove(&format!("geometry.{k}")))
        .collect();
    if values.iter().all(Option::is_none) {
        return Ok(None);
    }

    let mut parsed = [0u32; 3];
    for ((slot, value), key) in parsed.iter_mut().zip(values).zip(keys) {
        let value = value.ok_or_else(|| {
            DiskError::InvalidDescriptor(format!("incomplete geometry, missing ddb.geometry.{key}"))
        })?;
        *slot = value.parse().map_err(|_| {
            DiskError::InvalidDescriptor(format!("bad ddb.geometry.{key} value {value:?}"))
        })?;
    }
    Ok(Some(Geometry::new(parsed[0], parsed[1], parsed[2])))
}

/// A parsed or freshly-built VMDK descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorFile {
    version: u32,
    content_id: u32,
    parent_content_id: u32,
    create_type: DiskCreateType,
    parent_file_name_hint: Option<String>,
    extents: Vec<ExtentDescriptor>,
    ddb: DiskDatabase,
    /// Header keys this type does not model, kept for re-rendering.
    header_extra: BTreeMap<String, String>,
}

impl DescriptorFile {
    /// Descriptor for a standalone disk with no extents yet.
    pub fn new_simple(
        geometry: Geometry,
        create_type: DiskCreateType,
        adapter_type: AdapterType,
    ) -> Self {
        Self {
            version: DESCRIPTOR_VERSION,
            content_id: 0,
            parent_content_id: NO_PARENT_CONTENT_ID,
            create_type,
            parent_file_name_hint: None,
            extents: Vec::new(),
            ddb: DiskDatabase {
                adapter_type: Some(adapter_type),
                geometry: Some(geometry),
                bios_geometry: Some(Geometry::lba_assisted_bios(geometry.capacity())),
                virtual_hw_version: Some(VIRTUAL_HW_VERSION.to_owned()),
                uuid: None,
                extra: BTreeMap::new(),
            },
            header_extra: BTreeMap::new(),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn content_id(&self) -> u32 {
        self.content_id
    }

    pub fn set_content_id(&mut self, content_id: u32) {
        self.content_id = content_id;
    }

    pub fn parent_content_id(&self) -> u32 {
        self.parent_content_id
    }

    pub fn create_type(&self) -> DiskCreateType {
        self.create_type
    }

    pub fn parent_file_name_hint(&self) -> Option<&str> {
        self.parent_file_name_hint.as_deref()
    }

    /// Marks this descriptor as a child of the disk described by `parent_file_name`.
    pub fn set_parent(&mut self, parent_content_id: u32, parent_file_name: impl Into<String>) {
        self.parent_content_id = parent_content_id;
        self.parent_file_name_hint = Some(parent_file_name.into());
    }

    pub fn extents(&self) -> &[ExtentDescriptor] {
        &self.extents
    }

    pub fn append_extent(&mut self, extent: ExtentDescriptor) {
        self.extents.push(extent);
    }

    pub fn disk_database(&self) -> &DiskDatabase {
        &self.ddb
    }

    pub fn disk_database_mut(&mut self) -> &mut DiskDatabase {
        &mut self.ddb
    }

    pub fn adapter_type(&self) -> Option<AdapterType> {
        self.ddb.adapter_type
    }

    pub fn geometry(&self) -> Option<Geometry> {
        self.ddb.geometry
    }

    /// Sum of all extent sizes.
    pub fn capacity_sectors(&self) -> Result<u64> {
        self.extents.iter().try_fold(0u64, |acc, e| {
            acc.checked_add(e.size_in_sectors)
                .ok_or(DiskError::OffsetOverflow)
        })
    }

    /// Content id derived from everything except the id itself, so identical disks get
    /// identical descriptors.
    ///
    /// Only the descriptor text is hashed, never the extent data. Two disks with the same
    /// name, size and geometry get the same id even when their content differs, so a child's
    /// `parentCID` cannot tell such parents apart.
    pub fn derived_content_id(&self) -> u32 {
        let mut copy = self.clone();
        copy.content_id = 0;
        fnv1a32(copy.to_string().as_bytes())
    }

    pub fn serialize(&self, writer: &mut dyn io::Write) -> Result<()> {
        writer.write_all(self.to_string().as_bytes())?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| DiskError::InvalidDescriptor("descriptor is not UTF-8".into()))?;
        text.parse()
    }
}

impl fmt::Display for DescriptorFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        out.push_str("# Disk DescriptorFile\n");
        writeln!(out, "version={}", self.version)?;
        out.push_str("encoding=\"UTF-8\"\n");
        writeln!(out, "CID={:08x}", self.content_id)?;
        writeln!(out, "parentCID={:08x}", self.parent_content_id)?;
        writeln!(out, "createType=\"{}\"", self.create_type.as_str())?;
        if let Some(hint) = &self.parent_file_name_hint {
            writeln!(out, "parentFileNameHint=\"{hint}\"")?;
        }
        for (key, value) in &self.header_extra {
            writeln!(out, "{key}=\"{value}\"")?;
        }

        out.push_str("\n# Extent description\n");
        for extent in &self.extents {
            writeln!(out, "{extent}")?;
        }

        out.push_str("\n# The Disk Data Base\n#DDB\n\n");
        self.ddb.render(&mut out)?;
        f.write_str(&out)
    }
}

impl FromStr for DescriptorFile {
    type Err = DiskError;

    fn from_str(text: &str) -> Result<Self> {
        let mut header: BTreeMap<String, String> = BTreeMap::new();
        let mut ddb: BTreeMap<String, String> = BTreeMap::new();
        let mut extents: Vec<ExtentDescriptor> = Vec::new();

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if is_extent_line(line) {
                extents.push(line.parse()?);
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                DiskError::InvalidDescriptor(format!("unrecognized descriptor line {line:?}"))
            })?;
            let key = key.trim();
            let value = unquote(value.trim()).to_owned();
            match key.strip_prefix("ddb.") {
                Some(ddb_key) => ddb.insert(ddb_key.to_owned(), value),
                None => header.insert(key.to_owned(), value),
            };
        }

        let version: u32 = match header.remove("version") {
            Some(v) => v
                .parse()
                .map_err(|_| DiskError::InvalidDescriptor(format!("bad version {v:?}")))?,
            None => DESCRIPTOR_VERSION,
        };
        let content_id = parse_cid(header.remove("CID"), "CID")?.unwrap_or(0);
        let parent_content_id =
            parse_cid(header.remove("parentCID"), "parentCID")?.unwrap_or(NO_PARENT_CONTENT_ID);
        let create_type: DiskCreateType = header
            .remove("createType")
            .ok_or_else(|| DiskError::InvalidDescriptor("missing createType".into()))?
            .parse()?;
        let parent_file_name_hint = header.remove("parentFileNameHint");
        header.remove("encoding");

        Ok(Self {
            version,
            content_id,
            parent_content_id,
            create_type,
            parent_file_name_hint,
            extents,
            ddb: DiskDatabase::from_pairs(ddb)?,
            header_extra: header,
        })
    }
}

fn is_extent_line(line: &str) -> bool {
    let first = line.split_whitespace().next().unwrap_or_default();
    first.parse::<ExtentAccess>().is_ok()
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn parse_cid(value: Option<String>, key: &str) -> Result<Option<u32>> {
    value
        .map(|v| {
            u32::from_str_radix(&v, 16)
                .map_err(|_| DiskError::InvalidDescriptor(format!("bad {key} value {v:?}")))
        })
        .transpose()
}

fn fnv1a32(bytes: &[u8]) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    bytes
        .iter()
        .fold(OFFSET, |hash, &b| (hash ^ u32::from(b)).wrapping_mul(PRIME))
}
