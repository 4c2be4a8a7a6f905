//! Typed image description exchanged with the embedding image I/O layer.
//!
//! Axis order is always X, Y, Z, T, C.

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::metadata::MetadataDictionary;

/// Number of axes the worker protocol always carries.
pub const AXES: usize = 5;

const AXIS_Z: usize = 2;
const AXIS_T: usize = 3;
const AXIS_C: usize = 4;

const SIZE_KEYS: [&str; AXES] = ["SizeX", "SizeY", "SizeZ", "SizeT", "SizeC"];
const SPACING_KEYS: [&str; AXES] = [
    "PixelsPhysicalSizeX",
    "PixelsPhysicalSizeY",
    "PixelsPhysicalSizeZ",
    "PixelsPhysicalSizeT",
    "PixelsPhysicalSizeC",
];

/// Per-component storage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentType {
    UChar,
    Char,
    UShort,
    Short,
    UInt,
    Int,
    Float,
    Double,
}

impl ComponentType {
    /// Decode the worker's pixel type code.
    pub fn from_scifio(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Char),
            1 | 8 => Some(Self::UChar),
            2 => Some(Self::Short),
            3 => Some(Self::UShort),
            4 => Some(Self::Int),
            5 => Some(Self::UInt),
            6 => Some(Self::Float),
            7 => Some(Self::Double),
            _ => None,
        }
    }

    pub fn to_scifio(self) -> i64 {
        match self {
            Self::Char => 0,
            Self::UChar => 1,
            Self::Short => 2,
            Self::UShort => 3,
            Self::Int => 4,
            Self::UInt => 5,
            Self::Float => 6,
            Self::Double => 7,
        }
    }

    /// Size of one component in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::UChar | Self::Char => 1,
            Self::UShort | Self::Short => 2,
            Self::UInt | Self::Int | Self::Float => 4,
            Self::Double => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PixelType {
    Scalar,
    Rgb,
    Vector,
}

impl PixelType {
    pub fn from_components(components: usize) -> Self {
        match components {
            1 => Self::Scalar,
            3 => Self::Rgb,
            _ => Self::Vector,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

impl ByteOrder {
    /// Wire code used by the `write` command.
    pub fn wire_code(self) -> u8 {
        match self {
            Self::BigEndian => 1,
            Self::LittleEndian => 0,
        }
    }
}

/// Image geometry and pixel layout reported by (or sent to) the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub dimensions: [u64; AXES],
    pub spacing: [f64; AXES],
    pub component_type: ComponentType,
    pub pixel_type: PixelType,
    pub components: usize,
    pub byte_order: ByteOrder,
    pub interleaved: bool,
}

impl ImageInfo {
    /// Project an `info` dictionary onto an image description.
    pub fn from_metadata(dict: &MetadataDictionary) -> Result<Self, BridgeError> {
        if !dict.has_key("PixelType") {
            return Err(BridgeError::MissingKey("PixelType".to_string()));
        }

        let interleaved = dict.get::<bool>("Interleaved")?;
        let byte_order = if dict.get::<bool>("LittleEndian")? {
            ByteOrder::LittleEndian
        } else {
            ByteOrder::BigEndian
        };

        let code = dict.get::<i64>("PixelType")?;
        let component_type = ComponentType::from_scifio(code).ok_or_else(|| {
            BridgeError::protocol("info", format!("unknown pixel type: {code}"), "")
        })?;

        let mut dimensions = [1u64; AXES];
        for (dim, key) in dimensions.iter_mut().zip(SIZE_KEYS) {
            *dim = dict.get::<u64>(key)?;
        }

        let components = dict.get::<usize>("RGBChannelCount")?;

        let mut spacing = [1.0f64; AXES];
        for (s, key) in spacing.iter_mut().zip(SPACING_KEYS) {
            *s = dict.get::<f64>(key)?;
        }

        let info = Self {
            dimensions,
            spacing,
            component_type,
            pixel_type: PixelType::from_components(components),
            components,
            byte_order,
            interleaved,
        };
        tracing::debug!(?info, "Image information");
        Ok(info)
    }

    /// Bytes per pixel across all components.
    pub fn pixel_size(&self) -> usize {
        self.component_type.size() * self.components
    }
}

/// Sub-region of an image: per-axis start index and extent, rank 1 to 5.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoRegion {
    index: Vec<u64>,
    size: Vec<u64>,
}

impl IoRegion {
    pub fn new(index: Vec<u64>, size: Vec<u64>) -> Result<Self, BridgeError> {
        if index.len() != size.len() {
            return Err(BridgeError::InvalidRegion(format!(
                "{} indices for {} sizes",
                index.len(),
                size.len()
            )));
        }
        if index.is_empty() || index.len() > AXES {
            return Err(BridgeError::InvalidRegion(format!(
                "rank {} outside 1..={AXES}",
                index.len()
            )));
        }
        Ok(Self { index, size })
    }

    /// The whole image as a rank-5 region.
    pub fn full(info: &ImageInfo) -> Self {
        Self {
            index: vec![0; AXES],
            size: info.dimensions.to_vec(),
        }
    }

    pub fn rank(&self) -> usize {
        self.size.len()
    }

    /// Start index on `axis`; 0 beyond the rank.
    pub fn index(&self, axis: usize) -> u64 {
        self.index.get(axis).copied().unwrap_or(0)
    }

    /// Extent on `axis`; 1 beyond the rank.
    pub fn size(&self, axis: usize) -> u64 {
        self.size.get(axis).copied().unwrap_or(1)
    }

    pub fn pixel_count(&self) -> u64 {
        self.size.iter().product()
    }

    /// Number of XY planes: the product of the Z, T and C extents.
    pub fn plane_count(&self) -> u64 {
        [AXIS_Z, AXIS_T, AXIS_C]
            .into_iter()
            .map(|axis| self.size(axis))
            .product()
    }
}

/// Color lookup table sent along with a `write`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupTable {
    /// 8 or 16.
    pub bits: u8,
    pub entries: Vec<[i32; 3]>,
}

impl LookupTable {
    /// Read the table described by `UseLUT`, `LUTBits`, `LUTLength` and
    /// `LUTR<i>`/`LUTG<i>`/`LUTB<i>`. A missing `UseLUT` means no table.
    pub fn from_metadata(dict: &MetadataDictionary) -> Result<Option<Self>, BridgeError> {
        if !dict.get_opt::<bool>("UseLUT")?.unwrap_or(false) {
            return Ok(None);
        }

        let bits = dict.get::<u8>("LUTBits")?;
        let length = dict.get::<usize>("LUTLength")?;

        let mut entries = Vec::with_capacity(length);
        for i in 0..length {
            let mut rgb = [0i32; 3];
            for (value, channel) in rgb.iter_mut().zip(["LUTR", "LUTG", "LUTB"]) {
                let key = format!("{channel}{i}");
                *value = match bits {
                    8 => dict.get::<i32>(&key)?,
                    16 => i32::from(dict.get::<i16>(&key)?),
                    other => {
                        return Err(BridgeError::protocol(
                            "write",
                            format!("unsupported lookup table depth: {other} bits"),
                            "",
                        ));
                    }
                };
            }
            entries.push(rgb);
        }

        tracing::debug!(bits, length, "Lookup table");
        Ok(Some(Self { bits, entries }))
    }
}
