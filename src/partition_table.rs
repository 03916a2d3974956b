//! ESP-IDF partition table codec
//!
//! Supports both the binary format read back from flash and the CSV format
//! used by build systems, with conversion in both directions.
//!
//! For more information on the partition table format see:
//! <https://docs.espressif.com/projects/esp-idf/en/latest/esp32/api-guides/partition-tables.html>

use std::{
    cmp::{max, min},
    fmt::{Display, Formatter, Write as _},
    io::Write,
};

use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{EnumIter, FromRepr, IntoEnumIterator};

use crate::error::{DecodeError, ValidationError};

/// Flash address at which the bootloader expects the partition table.
pub const PARTITION_TABLE_ADDRESS: u32 = 0x8000;
/// Size of the partition table region in flash.
pub const PARTITION_TABLE_SIZE: usize = 0x1000;
/// Fallback application address when no factory or OTA slot is present.
pub const DEFAULT_APP_ADDRESS: u32 = 0x10000;
/// Required alignment for application partition offsets.
pub const PARTITION_ALIGNMENT: u32 = 0x10000;

const PARTITION_SIZE: usize = 32;
const MAGIC_BYTES: &[u8] = &[0xAA, 0x50];
const END_MARKER: [u8; 32] = [0xFF; 32];
const MAX_NAME_LEN: usize = 15;

// First usable offset after the table itself (0x8000 + 0x1000), used when a
// CSV row leaves its offset blank.
const FIRST_AUTO_OFFSET: u32 = 0x9000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreType {
    App = 0x00,
    Data = 0x01,
}

impl CoreType {
    pub fn subtype_hint(&self) -> String {
        match self {
            CoreType::App => "'factory', 'ota_0' through 'ota_15', and 'test'".into(),
            CoreType::Data => {
                let types = DataType::iter()
                    .map(|dt| format!("'{}'", serde_plain::to_string(&dt).unwrap()))
                    .collect::<Vec<_>>();

                let mut out = types[..types.len() - 1].join(", ");
                write!(&mut out, ", and {}", types[types.len() - 1]).unwrap();

                out
            }
        }
    }
}

impl Display for CoreType {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", serde_plain::to_string(self).unwrap())
    }
}

/// A partition type: the two types ESP-IDF defines, or a custom value
/// passed through as an opaque integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    CoreType(CoreType),
    Custom(u8),
}

impl Type {
    pub fn from_u8(ty: u8) -> Self {
        match ty {
            0x00 => Type::CoreType(CoreType::App),
            0x01 => Type::CoreType(CoreType::Data),
            other => Type::Custom(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Type::CoreType(ty) => *ty as u8,
            Type::Custom(ty) => *ty,
        }
    }

    pub fn subtype_hint(&self) -> String {
        match self {
            Type::CoreType(ty) => ty.subtype_hint(),
            Type::Custom(_) => "0x00-0xFE".into(),
        }
    }

    fn from_csv_field(field: &str) -> Self {
        match field {
            "app" => Type::CoreType(CoreType::App),
            "data" => Type::CoreType(CoreType::Data),
            value => match parse_int::parse::<u8>(value) {
                Ok(int) => Type::from_u8(int),
                Err(_) => {
                    warn!("Unrecognized partition type '{value}', assuming 'app'");
                    Type::CoreType(CoreType::App)
                }
            },
        }
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Type::CoreType(ty) => write!(f, "{ty}"),
            Type::Custom(ty) => write!(f, "{ty:#04x}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, FromRepr)]
#[repr(u8)]
pub enum AppType {
    #[serde(rename = "factory")]
    Factory = 0x00,
    #[serde(rename = "ota_0")]
    Ota0 = 0x10,
    #[serde(rename = "ota_1")]
    Ota1 = 0x11,
    #[serde(rename = "ota_2")]
    Ota2 = 0x12,
    #[serde(rename = "ota_3")]
    Ota3 = 0x13,
    #[serde(rename = "ota_4")]
    Ota4 = 0x14,
    #[serde(rename = "ota_5")]
    Ota5 = 0x15,
    #[serde(rename = "ota_6")]
    Ota6 = 0x16,
    #[serde(rename = "ota_7")]
    Ota7 = 0x17,
    #[serde(rename = "ota_8")]
    Ota8 = 0x18,
    #[serde(rename = "ota_9")]
    Ota9 = 0x19,
    #[serde(rename = "ota_10")]
    Ota10 = 0x1a,
    #[serde(rename = "ota_11")]
    Ota11 = 0x1b,
    #[serde(rename = "ota_12")]
    Ota12 = 0x1c,
    #[serde(rename = "ota_13")]
    Ota13 = 0x1d,
    #[serde(rename = "ota_14")]
    Ota14 = 0x1e,
    #[serde(rename = "ota_15")]
    Ota15 = 0x1f,
    #[serde(rename = "test")]
    Test = 0x20,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, EnumIter, FromRepr)]
#[repr(u8)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Ota = 0x00,
    Phy = 0x01,
    Nvs = 0x02,
    CoreDump = 0x03,
    #[serde(rename = "nvs_keys")]
    NvsKeys = 0x04,
    EFuse = 0x05,
    Fat = 0x81,
    Spiffs = 0x82,
}

/// A partition subtype, interpreted relative to the partition's [`Type`].
/// Values without a known name are passed through as [`SubType::Custom`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubType {
    App(AppType),
    Data(DataType),
    Custom(u8),
}

impl SubType {
    pub fn from_u8(ty: Type, sub_type: u8) -> Self {
        match ty {
            Type::CoreType(CoreType::App) => match AppType::from_repr(sub_type) {
                Some(app) => SubType::App(app),
                None => SubType::Custom(sub_type),
            },
            Type::CoreType(CoreType::Data) => match DataType::from_repr(sub_type) {
                Some(data) => SubType::Data(data),
                None => SubType::Custom(sub_type),
            },
            Type::Custom(_) => SubType::Custom(sub_type),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            SubType::App(ty) => *ty as u8,
            SubType::Data(ty) => *ty as u8,
            SubType::Custom(ty) => *ty,
        }
    }

    fn from_csv_field(ty: Type, field: &str) -> Self {
        let named = match ty {
            Type::CoreType(CoreType::App) => {
                serde_plain::from_str::<AppType>(field).ok().map(SubType::App)
            }
            Type::CoreType(CoreType::Data) => {
                serde_plain::from_str::<DataType>(field).ok().map(SubType::Data)
            }
            Type::Custom(_) => None,
        };

        if let Some(sub_type) = named {
            return sub_type;
        }

        match parse_int::parse::<u8>(field) {
            Ok(int) => SubType::from_u8(ty, int),
            Err(_) => {
                warn!(
                    "Unrecognized subtype '{field}' for partition type '{ty}', \
                     defaulting to 0 (known subtypes: {})",
                    ty.subtype_hint()
                );
                SubType::from_u8(ty, 0x00)
            }
        }
    }
}

impl Display for SubType {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            SubType::App(sub) => write!(f, "{}", serde_plain::to_string(sub).unwrap()),
            SubType::Data(sub) => write!(f, "{}", serde_plain::to_string(sub).unwrap()),
            SubType::Custom(sub) => write!(f, "{sub:#04x}"),
        }
    }
}

/// One 32-byte row of the partition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    name: String,
    ty: Type,
    sub_type: SubType,
    offset: u32,
    size: u32,
}

impl Partition {
    pub fn new(name: String, ty: Type, sub_type: SubType, offset: u32, size: u32) -> Self {
        Partition {
            name,
            ty,
            sub_type,
            offset,
            size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> Type {
        self.ty
    }

    pub fn sub_type(&self) -> SubType {
        self.sub_type
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Decode a single 32-byte record. The caller has already checked the
    /// magic bytes.
    fn from_record(record: &[u8]) -> Self {
        let ty = Type::from_u8(record[2]);
        let sub_type = SubType::from_u8(ty, record[3]);
        let offset = u32::from_le_bytes(record[4..8].try_into().unwrap());
        let size = u32::from_le_bytes(record[8..12].try_into().unwrap());
        let name = String::from_utf8_lossy(&record[12..28])
            .trim_matches(char::from(0))
            .to_string();

        Partition::new(name, ty, sub_type, offset, size)
    }

    pub fn save_bin<W>(&self, writer: &mut W) -> std::io::Result<()>
    where
        W: Write,
    {
        writer.write_all(MAGIC_BYTES)?;
        writer.write_all(&[self.ty.as_u8(), self.sub_type.as_u8()])?;
        writer.write_all(&self.offset.to_le_bytes())?;
        writer.write_all(&self.size.to_le_bytes())?;

        let mut name_bytes = [0u8; 16];
        for (source, dest) in self.name.bytes().take(MAX_NAME_LEN).zip(name_bytes.iter_mut()) {
            *dest = source;
        }
        writer.write_all(&name_bytes)?;

        // Flags field, reserved and always zero.
        writer.write_all(&0u32.to_le_bytes())?;

        Ok(())
    }

    pub fn save_csv<W>(&self, csv: &mut csv::Writer<W>) -> std::io::Result<()>
    where
        W: Write,
    {
        csv.write_record(&[
            self.name.clone(),
            self.ty.to_string(),
            self.sub_type.to_string(),
            format!("{:#x}", self.offset),
            format!("{:#x}", self.size),
        ])?;
        Ok(())
    }

    fn overlaps(&self, other: &Partition) -> bool {
        max(self.offset as u64, other.offset as u64)
            < min(
                self.offset as u64 + self.size as u64,
                other.offset as u64 + other.size as u64,
            )
    }
}

/// An ordered sequence of partitions. Order matters only for the
/// first-match rules in [`PartitionTable::resolve_app_address`] and the
/// `find_*` lookups, not for correctness of the encoded table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    partitions: Vec<Partition>,
}

impl PartitionTable {
    pub fn new(partitions: Vec<Partition>) -> Self {
        Self { partitions }
    }

    /// The partition layout the original ESP32-S3 PlatformIO images ship
    /// with: two OTA app slots, no factory slot, and a SPIFFS data
    /// partition.
    pub fn standard_ota_layout() -> Self {
        const APP: Type = Type::CoreType(CoreType::App);
        const DATA: Type = Type::CoreType(CoreType::Data);

        PartitionTable::new(vec![
            Partition::new("nvs".into(), DATA, SubType::Data(DataType::Nvs), 0x9000, 0x40000),
            Partition::new("otadata".into(), DATA, SubType::Data(DataType::Ota), 0x49000, 0x2000),
            Partition::new("phy".into(), DATA, SubType::Data(DataType::Phy), 0x4b000, 0x1000),
            Partition::new("app0".into(), APP, SubType::App(AppType::Ota0), 0x50000, 0x2a3000),
            Partition::new("app1".into(), APP, SubType::App(AppType::Ota1), 0x320000, 0x2a3000),
            Partition::new("spiffs".into(), DATA, SubType::Data(DataType::Spiffs), 0x5f0000, 0x128000),
            Partition::new("coredump".into(), DATA, SubType::Data(DataType::CoreDump), 0x720000, 0x80000),
        ])
    }

    /// Attempt to parse either a binary or CSV partition table from the
    /// given input.
    pub fn try_from<D>(data: D) -> Result<Self, DecodeError>
    where
        D: Into<Vec<u8>>,
    {
        let input: Vec<u8> = data.into();

        // A table read back from flash arrives in its binary form; one
        // maintained in a project is a CSV. Binary is tried first since a
        // valid table is rarely valid UTF-8.
        match Self::try_from_bytes(&input) {
            Ok(table) => Ok(table),
            Err(bin_err) => match String::from_utf8(input) {
                Ok(text) => Self::try_from_str(&text),
                Err(_) => Err(bin_err),
            },
        }
    }

    /// Attempt to parse a binary partition table from the given bytes.
    ///
    /// Scanning stops at the 32-byte `0xFF` end marker or at the first
    /// record without the entry magic; both are the table's natural end,
    /// not an error. A table whose first record is entirely `0xFF` is an
    /// erased flash region and reported as [`DecodeError::Erased`], which
    /// calls for different user guidance than a corrupt table.
    pub fn try_from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < PARTITION_SIZE {
            return Err(DecodeError::TooSmall(data.len()));
        }

        let head = &data[..PARTITION_SIZE];
        if !head.starts_with(MAGIC_BYTES) {
            if head.iter().all(|&b| b == 0xFF) {
                return Err(DecodeError::Erased);
            }
            return Err(DecodeError::InvalidMagic);
        }

        let mut partitions = Vec::new();
        for record in data.chunks_exact(PARTITION_SIZE) {
            if record == END_MARKER || !record.starts_with(MAGIC_BYTES) {
                break;
            }
            partitions.push(Partition::from_record(record));
        }

        if partitions.is_empty() {
            warn!("Partition table contains no usable entries");
        }

        Ok(Self { partitions })
    }

    /// Attempt to parse a CSV partition table from the given string.
    ///
    /// Comment (`#`) and blank lines are ignored, as are rows with fewer
    /// than five fields. Unrecognized type or subtype names fall back to 0
    /// with a warning. A row may leave its offset blank, in which case the
    /// partition is placed directly after the previous one, aligned to
    /// 0x10000 for app partitions and 4 bytes otherwise.
    pub fn try_from_str(data: &str) -> Result<Self, DecodeError> {
        let mut reader = csv::ReaderBuilder::new()
            .comment(Some(b'#'))
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(data.trim().as_bytes());

        let mut next_offset = FIRST_AUTO_OFFSET;
        let mut partitions = Vec::new();

        for record in reader.records() {
            let record = record.map_err(|e| DecodeError::InvalidCsv(e.to_string()))?;
            let line = record.position().map(|pos| pos.line()).unwrap_or_default();

            if record.len() < 5 {
                warn!(
                    "Skipping partition table line {line}: expected 5 fields, found {}",
                    record.len()
                );
                continue;
            }

            let name = truncate_name(&record[0]);
            let ty = Type::from_csv_field(&record[1]);
            let sub_type = SubType::from_csv_field(ty, &record[2]);
            let size = parse_size(&record[4])
                .ok_or_else(|| DecodeError::InvalidCsv(format!("line {line}: invalid size '{}'", &record[4])))?;
            let offset = if record[3].is_empty() {
                align_offset(next_offset, ty)
            } else {
                parse_offset(&record[3]).ok_or_else(|| {
                    DecodeError::InvalidCsv(format!("line {line}: invalid offset '{}'", &record[3]))
                })?
            };
            next_offset = offset + size;

            partitions.push(Partition::new(name, ty, sub_type, offset, size));
        }

        if partitions.is_empty() {
            warn!("Partition table CSV contains no usable entries");
        }

        Ok(Self { partitions })
    }

    /// Serialize the table into its binary form: one 32-byte record per
    /// partition, the mandatory all-`0xFF` end marker, then `0xFF` padding
    /// to the next 4096-byte boundary.
    pub fn save_bin<W>(&self, writer: &mut W) -> std::io::Result<()>
    where
        W: Write,
    {
        for partition in &self.partitions {
            partition.save_bin(writer)?;
        }
        writer.write_all(&END_MARKER)?;

        let written = (self.partitions.len() + 1) * PARTITION_SIZE;
        let padded = written.div_ceil(PARTITION_TABLE_SIZE) * PARTITION_TABLE_SIZE;
        for _ in written..padded {
            writer.write_all(&[0xFF])?;
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(PARTITION_TABLE_SIZE);
        self.save_bin(&mut result).unwrap();

        result
    }

    /// Write the CSV form of the table into `writer`.
    pub fn save_csv<W>(&self, writer: &mut W) -> std::io::Result<()>
    where
        W: Write,
    {
        writeln!(writer, "# ESP-IDF Partition Table")?;
        writeln!(writer, "# Name,   Type, SubType, Offset,  Size")?;
        let mut csv = csv::Writer::from_writer(writer);
        for partition in &self.partitions {
            partition.save_csv(&mut csv)?;
        }

        Ok(())
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<&Partition> {
        self.partitions.iter().find(|&p| p.name == name)
    }

    pub fn find_by_type(&self, ty: Type) -> Option<&Partition> {
        self.partitions.iter().find(|&p| p.ty == ty)
    }

    pub fn find_by_subtype(&self, ty: Type, sub_type: SubType) -> Option<&Partition> {
        self.partitions
            .iter()
            .find(|&p| p.ty == ty && p.sub_type == sub_type)
    }

    /// Determine where the application image should be flashed, and whether
    /// the device uses OTA updates.
    ///
    /// A `factory` app entry wins over an `ota_0` entry; with neither
    /// present the well-known default `0x10000` is returned. The first
    /// matching entry of each kind is the one that counts. The OTA flag is
    /// true iff an OTA-data entry exists, independent of which address was
    /// chosen.
    pub fn resolve_app_address(&self) -> (String, bool) {
        let mut factory = None;
        let mut ota_0 = None;
        let mut has_ota = false;

        for p in &self.partitions {
            match (p.ty, p.sub_type) {
                (Type::CoreType(CoreType::App), SubType::App(AppType::Factory)) => {
                    factory.get_or_insert(p.offset);
                }
                (Type::CoreType(CoreType::App), SubType::App(AppType::Ota0)) => {
                    ota_0.get_or_insert(p.offset);
                }
                (Type::CoreType(CoreType::Data), SubType::Data(DataType::Ota)) => {
                    has_ota = true;
                }
                _ => {}
            }
        }

        let address = factory.or(ota_0).unwrap_or(DEFAULT_APP_ADDRESS);

        (format!("{address:#x}"), has_ota)
    }

    /// Check the table's structural invariants: non-zero offsets and sizes
    /// and no overlapping flash ranges. Misaligned app partitions are
    /// flagged with a warning rather than rejected, since devices in the
    /// field do carry such tables.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for p in &self.partitions {
            if p.size == 0 {
                return Err(ValidationError::ZeroSize(p.name.clone()));
            }
            if p.offset == 0 {
                return Err(ValidationError::ZeroOffset(p.name.clone()));
            }
            if p.ty == Type::CoreType(CoreType::App) && p.offset % PARTITION_ALIGNMENT != 0 {
                warn!(
                    "App partition '{}' at {:#x} is not aligned to {:#x}",
                    p.name, p.offset, PARTITION_ALIGNMENT
                );
            }
        }

        for (i, a) in self.partitions.iter().enumerate() {
            for b in &self.partitions[i + 1..] {
                if a.overlaps(b) {
                    return Err(ValidationError::Overlap(a.name.clone(), b.name.clone()));
                }
            }
        }

        Ok(())
    }

    #[cfg(feature = "cli")]
    pub fn pretty_print(&self) {
        use comfy_table::{modifiers, presets::UTF8_FULL, Attribute, Cell, Color, Table};

        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(modifiers::UTF8_ROUND_CORNERS)
            .set_header(vec![
                Cell::new("Name")
                    .fg(Color::Green)
                    .add_attribute(Attribute::Bold),
                Cell::new("Type")
                    .fg(Color::Cyan)
                    .add_attribute(Attribute::Bold),
                Cell::new("SubType")
                    .fg(Color::Magenta)
                    .add_attribute(Attribute::Bold),
                Cell::new("Offset")
                    .fg(Color::Red)
                    .add_attribute(Attribute::Bold),
                Cell::new("Size")
                    .fg(Color::Yellow)
                    .add_attribute(Attribute::Bold),
            ]);
        for part in &self.partitions {
            table.add_row(vec![
                Cell::new(&part.name).fg(Color::Green),
                Cell::new(part.ty.to_string()).fg(Color::Cyan),
                Cell::new(part.sub_type.to_string()).fg(Color::Magenta),
                Cell::new(format!("{:#x}", part.offset)).fg(Color::Red),
                Cell::new(format!("{:#x} ({}KiB)", part.size, part.size / 1024)).fg(Color::Yellow),
            ]);
        }
        println!("{table}");
    }
}

fn truncate_name(name: &str) -> String {
    match name.char_indices().nth(MAX_NAME_LEN) {
        Some((idx, _)) => String::from(&name[..idx]),
        None => String::from(name),
    }
}

fn align_offset(offset: u32, ty: Type) -> u32 {
    let pad = match ty {
        Type::CoreType(CoreType::App) => PARTITION_ALIGNMENT,
        _ => 4,
    };

    if offset % pad != 0 {
        offset + pad - (offset % pad)
    } else {
        offset
    }
}

/// Parse a CSV offset field: `0x`-prefixed hex or bare decimal.
fn parse_offset(field: &str) -> Option<u32> {
    parse_int::parse::<u32>(field).ok()
}

/// Parse a CSV size field: `0x`-prefixed hex, bare decimal, or a decimal
/// with a `K`/`M` multiplier suffix (case-insensitive, internal spaces
/// tolerated).
fn parse_size(field: &str) -> Option<u32> {
    if let Ok(size) = parse_int::parse::<u32>(field) {
        return Some(size);
    }

    let re = Regex::new(r"(?i)^(\d+)\s*([km])$").unwrap();
    let captures = re.captures(field)?;

    let digits = captures.get(1).unwrap().as_str().parse::<u32>().ok()?;
    let multiplier = match captures.get(2).unwrap().as_str() {
        "k" | "K" => 1024,
        "m" | "M" => 1024 * 1024,
        _ => unreachable!(),
    };

    digits.checked_mul(multiplier)
}
