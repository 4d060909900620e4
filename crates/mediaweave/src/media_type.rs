//! Media types
//!
//! A media type is a major type, a subtype and a bag of format attributes.
//! Negotiation goes through [`MediaType::matches_items`]: a type with fewer
//! attributes stands for every variant that agrees on the ones it has.

use std::collections::BTreeMap;
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Major type identifiers.
pub mod major {
    use uuid::Uuid;

    pub const AUDIO: Uuid = Uuid::from_u128(0x73647561_0000_0010_8000_00aa00389b71);
    pub const VIDEO: Uuid = Uuid::from_u128(0x73646976_0000_0010_8000_00aa00389b71);
}

/// Subtype identifiers.
pub mod subtype {
    use uuid::Uuid;

    pub const PCM: Uuid = Uuid::from_u128(0x00000001_0000_0010_8000_00aa00389b71);
    pub const FLOAT: Uuid = Uuid::from_u128(0x00000003_0000_0010_8000_00aa00389b71);
    pub const MP3: Uuid = Uuid::from_u128(0x00000055_0000_0010_8000_00aa00389b71);
    pub const RGB32: Uuid = Uuid::from_u128(0x00000016_0000_0010_8000_00aa00389b71);
    pub const I420: Uuid = Uuid::from_u128(0x30323449_0000_0010_8000_00aa00389b71);
    pub const NV12: Uuid = Uuid::from_u128(0x3231564e_0000_0010_8000_00aa00389b71);
    pub const H264: Uuid = Uuid::from_u128(0x34363248_0000_0010_8000_00aa00389b71);
}

/// Well-known attribute keys.
pub mod attr {
    pub const SAMPLE_RATE: &str = "audio.sample_rate";
    pub const CHANNELS: &str = "audio.channels";
    pub const BITS_PER_SAMPLE: &str = "audio.bits_per_sample";
    pub const FRAME_WIDTH: &str = "video.width";
    pub const FRAME_HEIGHT: &str = "video.height";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    UInt32(u32),
    UInt64(u64),
    Double(f64),
    Guid(Uuid),
    String(String),
}

bitflags! {
    /// Which parts of two media types agree.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MatchFlags: u32 {
        const MAJOR = 0x1;
        const SUBTYPE = 0x2;
        /// Every attribute of one type is present and equal in the other.
        const DATA = 0x4;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaType {
    pub major: Uuid,
    pub subtype: Uuid,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,
}

impl MediaType {
    pub fn new(major: Uuid, subtype: Uuid) -> Self {
        Self {
            major,
            subtype,
            attributes: BTreeMap::new(),
        }
    }

    pub fn audio(subtype: Uuid) -> Self {
        Self::new(major::AUDIO, subtype)
    }

    pub fn video(subtype: Uuid) -> Self {
        Self::new(major::VIDEO, subtype)
    }

    pub fn with_attr(mut self, key: &str, value: AttrValue) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    pub fn set_attr(&mut self, key: &str, value: AttrValue) {
        self.attributes.insert(key.to_string(), value);
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }

    pub fn u32_attr(&self, key: &str) -> Option<u32> {
        match self.attributes.get(key)? {
            AttrValue::UInt32(v) => Some(*v),
            _ => None,
        }
    }

    /// Same major type and subtype.
    pub fn same_format(&self, other: &MediaType) -> bool {
        self.major == other.major && self.subtype == other.subtype
    }

    /// True when `other` carries this type's major type, subtype and every
    /// one of its attributes with equal values. Extra attributes on `other`
    /// are allowed.
    pub fn matches_items(&self, other: &MediaType) -> bool {
        self.same_format(other)
            && self
                .attributes
                .iter()
                .all(|(key, value)| other.attributes.get(key) == Some(value))
    }

    pub fn compare(&self, other: &MediaType) -> MatchFlags {
        let mut flags = MatchFlags::empty();
        if self.major == other.major {
            flags |= MatchFlags::MAJOR;
        }
        if self.subtype == other.subtype {
            flags |= MatchFlags::SUBTYPE;
        }
        if self.attributes == other.attributes {
            flags |= MatchFlags::DATA;
        }
        flags
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let major = match self.major {
            major::AUDIO => "audio".to_string(),
            major::VIDEO => "video".to_string(),
            other => other.to_string(),
        };
        write!(f, "{}/{}", major, self.subtype)
    }
}
