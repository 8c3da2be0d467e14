//! Camera list and per-camera feature defaults, read from `config.xml`.
//!
//! ```xml
//! <config>
//!   <camera id="DEV_1AB22C011FE5">
//!     <default_setting name="ExposureTime" value="5000" method="double" comment="5 ms"/>
//!   </camera>
//! </config>
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ConfigError;
use crate::capture::{FeatureKind, FeatureParseError, FeatureValue};

/// Why a single default setting could not be turned into a feature value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SettingError {
    #[error("unknown method {0:?}")]
    UnknownMethod(String),
    #[error(transparent)]
    Parse(#[from] FeatureParseError),
}

/// One `<default_setting>` element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultSetting {
    #[serde(rename = "@name", alias = "name")]
    pub name: String,
    #[serde(rename = "@value", alias = "value")]
    pub value: String,
    /// Value type: `VmbInt64_t`, `double` or `enum`.
    #[serde(rename = "@method", alias = "method")]
    pub method: String,
    #[serde(rename = "@comment", alias = "comment", default)]
    pub comment: String,
}

impl DefaultSetting {
    /// Parses the textual value according to `method`.
    pub fn feature_value(&self) -> Result<FeatureValue, SettingError> {
        let kind = FeatureKind::from_method(&self.method)
            .ok_or_else(|| SettingError::UnknownMethod(self.method.clone()))?;
        Ok(FeatureValue::parse(kind, &self.value)?)
    }
}

/// One `<camera>` element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraEntry {
    #[serde(rename = "@id", alias = "id")]
    pub id: String,
    #[serde(rename = "default_setting", default)]
    pub defaults: Vec<DefaultSetting>,
}

/// Root `<config>` element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename = "config")]
pub struct CameraConfig {
    #[serde(rename = "camera", default)]
    pub cameras: Vec<CameraEntry>,
}

impl CameraConfig {
    /// Parses an XML document.
    pub fn from_xml(xml: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_xml_rs::from_str(xml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates `config.xml`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_xml(&content)
    }

    /// Builds a configuration for the given ids without default settings.
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cameras: ids
                .into_iter()
                .map(|id| CameraEntry {
                    id: id.into(),
                    defaults: Vec::new(),
                })
                .collect(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, camera) in self.cameras.iter().enumerate() {
            if camera.id.trim().is_empty() {
                return Err(ConfigError::MissingCameraId(i));
            }
            if self.cameras[..i].iter().any(|c| c.id == camera.id) {
                return Err(ConfigError::DuplicateCamera(camera.id.clone()));
            }
        }
        Ok(())
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.cameras.iter().map(|c| c.id.as_str())
    }

    pub fn camera(&self, id: &str) -> Option<&CameraEntry> {
        self.cameras.iter().find(|c| c.id == id)
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<config>
  <camera id="DEV_1AB22C011FE5">
    <default_setting name="ExposureTime" value="5000.5" method="double" comment="exposure"/>
    <default_setting name="Width" value="1920" method="VmbInt64_t" comment=""/>
    <default_setting name="TriggerMode" value="On" method="enum" comment="hardware trigger"/>
  </camera>
  <camera id="DEV_1AB22C011FE8"/>
</config>"#;

    #[test]
    fn test_parse_cameras_in_order() {
        let config = CameraConfig::from_xml(SAMPLE).unwrap();
        assert_eq!(
            config.ids().collect::<Vec<_>>(),
            vec!["DEV_1AB22C011FE5", "DEV_1AB22C011FE8"]
        );
        let first = config.camera("DEV_1AB22C011FE5").unwrap();
        assert_eq!(first.defaults.len(), 3);
        assert_eq!(first.defaults[2].comment, "hardware trigger");
        assert!(config.camera("DEV_1AB22C011FE8").unwrap().defaults.is_empty());
    }

    #[test]
    fn test_setting_values_follow_method() {
        let config = CameraConfig::from_xml(SAMPLE).unwrap();
        let values: Vec<FeatureValue> = config.cameras[0]
            .defaults
            .iter()
            .map(|s| s.feature_value().unwrap())
            .collect();
        assert_eq!(
            values,
            vec![
                FeatureValue::Float(5000.5),
                FeatureValue::Int(1920),
                FeatureValue::Enum("On".into()),
            ]
        );
    }

    #[test]
    fn test_bad_setting_is_reported_not_fatal() {
        let setting = DefaultSetting {
            name: "Gain".into(),
            value: "loud".into(),
            method: "double".into(),
            comment: String::new(),
        };
        assert!(matches!(setting.feature_value(), Err(SettingError::Parse(_))));

        let setting = DefaultSetting {
            method: "string".into(),
            ..setting
        };
        assert_eq!(
            setting.feature_value(),
            Err(SettingError::UnknownMethod("string".into()))
        );
    }

    #[test]
    fn test_duplicate_camera_rejected() {
        let xml = r#"<config><camera id="A"/><camera id="A"/></config>"#;
        assert!(matches!(
            CameraConfig::from_xml(xml),
            Err(ConfigError::DuplicateCamera(id)) if id == "A"
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = CameraConfig::from_file(file.path()).unwrap();
        assert_eq!(config.len(), 2);

        assert!(matches!(
            CameraConfig::from_file(file.path().with_extension("missing")),
            Err(ConfigError::FileReadError(_))
        ));
    }
}
