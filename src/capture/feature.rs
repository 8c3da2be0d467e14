//! Typed camera features.
//!
//! Cameras expose their configuration as string-keyed features. The
//! value type is fixed per feature and mirrors the three kinds used in
//! camera configuration files: integers, floating point and enum strings.

use std::fmt;

/// Features logged after a camera has been configured.
pub const REPORTED_FEATURES: [&str; 15] = [
    "PixelFormat",
    "ExposureTime",
    "Gain",
    "DeviceLinkSpeed",
    "DeviceLinkThroughputLimit",
    "AcquisitionFrameRate",
    "Height",
    "Width",
    "BinningHorizontal",
    "BinningVertical",
    "PayloadSize",
    "LineSelector",
    "LineMode",
    "TriggerSource",
    "TriggerMode",
];

/// The value type of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    Int,
    Float,
    Enum,
}

impl FeatureKind {
    /// Parses the `method` attribute of a configuration entry.
    ///
    /// Accepts the SDK type names (`VmbInt64_t`) as well as short forms.
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "VmbInt64_t" | "int" | "integer" => Some(Self::Int),
            "double" | "float" => Some(Self::Float),
            "enum" => Some(Self::Enum),
            _ => None,
        }
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int => "int",
            Self::Float => "double",
            Self::Enum => "enum",
        };
        f.write_str(name)
    }
}

/// A feature value.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    Int(i64),
    Float(f64),
    Enum(String),
}

impl FeatureValue {
    pub fn kind(&self) -> FeatureKind {
        match self {
            Self::Int(_) => FeatureKind::Int,
            Self::Float(_) => FeatureKind::Float,
            Self::Enum(_) => FeatureKind::Enum,
        }
    }

    /// Parses a textual value as the given kind.
    pub fn parse(kind: FeatureKind, text: &str) -> Result<Self, FeatureParseError> {
        let text = text.trim();
        match kind {
            FeatureKind::Int => text
                .parse()
                .map(Self::Int)
                .map_err(|_| FeatureParseError { kind, text: text.to_string() }),
            FeatureKind::Float => text
                .parse()
                .map(Self::Float)
                .map_err(|_| FeatureParseError { kind, text: text.to_string() }),
            FeatureKind::Enum if text.is_empty() => Err(FeatureParseError {
                kind,
                text: String::new(),
            }),
            FeatureKind::Enum => Ok(Self::Enum(text.to_string())),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<&str> {
        match self {
            Self::Enum(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Enum(v) => f.write_str(v),
        }
    }
}

/// A textual value that does not match its declared kind.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("cannot parse {text:?} as {kind}")]
pub struct FeatureParseError {
    pub kind: FeatureKind,
    pub text: String,
}
