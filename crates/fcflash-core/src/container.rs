//! `.px4` firmware container.
//!
//! A JSON object naming the target board and carrying one or more images,
//! each zlib-compressed and base64-encoded, with its uncompressed size.
//! Parameter and airframe metadata travel alongside and are kept as-is.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, instrument};

pub const IMAGE: &str = "image";
pub const EXTF_IMAGE: &str = "extf_image";
pub const PARAMETER_XML: &str = "parameter_xml";
pub const AIRFRAME_XML: &str = "airframe_xml";

const BOARD_ID: &str = "board_id";

/// Image sections in flashing order.
const IMAGE_KEYS: [(&str, &str); 2] = [
    (IMAGE, "application image"),
    (EXTF_IMAGE, "external flash image"),
];

const METADATA_KEYS: [&str; 2] = [PARAMETER_XML, AIRFRAME_XML];

#[derive(Clone, Copy)]
enum Shape {
    Text,
    Number,
}

/// Descriptive keys and the JSON type each must have.
const PROPERTY_KEYS: [(&str, Shape); 11] = [
    ("magic", Shape::Text),
    ("description", Shape::Text),
    ("version", Shape::Text),
    ("git_identity", Shape::Text),
    ("git_hash", Shape::Text),
    ("summary", Shape::Text),
    ("sha256sum", Shape::Text),
    ("build_time", Shape::Number),
    ("image_maxsize", Shape::Number),
    ("board_revision", Shape::Number),
    ("mav_autopilot", Shape::Number),
];

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Cannot open {path}: {message}")]
    FileOpen { path: String, message: String },

    #[error("Invalid firmware container: {0}")]
    Format(String),

    #[error("Firmware container is missing key '{0}'")]
    MissingKey(String),

    #[error("Firmware container has unrecognized key '{0}'")]
    InvalidKey(String),

    #[error("No image section '{0}'")]
    UnknownImage(String),

    #[error("Image section '{0}' is empty")]
    EmptySection(String),

    #[error("Image section '{key}' cannot be decoded: {detail}")]
    MalformedSection { key: String, detail: String },

    #[error("Image section '{key}' inflates to {actual} bytes, declared {declared}")]
    SizeMismatch {
        key: String,
        declared: usize,
        actual: usize,
    },
}

/// One compressed image as stored in the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSection {
    pub key: String,
    /// Base64 text of the zlib stream.
    pub compressed: String,
    pub declared_size: usize,
    pub description: &'static str,
}

/// Metadata passed through uninterpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataBlob {
    pub encoded: String,
    pub declared_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FirmwareContainer {
    board_id: u32,
    images: Vec<ImageSection>,
    metadata: BTreeMap<String, MetadataBlob>,
    properties: BTreeMap<String, Value>,
}

impl FirmwareContainer {
    /// Read and parse a container file.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ContainerError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| ContainerError::FileOpen {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let container = Self::from_bytes(&bytes)?;
        info!(
            board_id = container.board_id,
            images = container.images.len(),
            "Firmware container loaded"
        );
        Ok(container)
    }

    /// Parse a container held in memory.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ContainerError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| ContainerError::Format(e.to_string()))?;
        let Value::Object(map) = value else {
            return Err(ContainerError::Format("top level is not an object".to_string()));
        };
        Self::from_map(&map)
    }

    fn from_map(map: &Map<String, Value>) -> Result<Self, ContainerError> {
        for key in map.keys() {
            if !is_recognized(key) {
                return Err(ContainerError::InvalidKey(key.clone()));
            }
        }

        let board_id = match map.get(BOARD_ID) {
            Some(v) => as_u32(BOARD_ID, v)?,
            None => return Err(ContainerError::MissingKey(BOARD_ID.to_string())),
        };

        let mut images = Vec::new();
        for (key, description) in IMAGE_KEYS {
            let Some(value) = map.get(key) else {
                continue;
            };
            let compressed = as_text(key, value)?.to_string();
            let size_key = format!("{}_size", key);
            let declared_size = match map.get(&size_key) {
                Some(v) => as_u32(&size_key, v)? as usize,
                None => return Err(ContainerError::MissingKey(size_key)),
            };
            images.push(ImageSection {
                key: key.to_string(),
                compressed,
                declared_size,
                description,
            });
        }
        if !images.iter().any(|s| s.key == IMAGE) {
            return Err(ContainerError::MissingKey(IMAGE.to_string()));
        }

        let mut metadata = BTreeMap::new();
        for key in METADATA_KEYS {
            let Some(value) = map.get(key) else {
                continue;
            };
            let size_key = format!("{}_size", key);
            let declared_size = match map.get(&size_key) {
                Some(v) => Some(as_u32(&size_key, v)? as usize),
                None => None,
            };
            metadata.insert(
                key.to_string(),
                MetadataBlob {
                    encoded: as_text(key, value)?.to_string(),
                    declared_size,
                },
            );
        }

        let mut properties = BTreeMap::new();
        for (key, shape) in PROPERTY_KEYS {
            let Some(value) = map.get(key) else {
                continue;
            };
            let ok = match shape {
                Shape::Text => value.is_string(),
                Shape::Number => value.is_u64(),
            };
            if !ok {
                return Err(ContainerError::Format(format!("'{}' has the wrong type", key)));
            }
            properties.insert(key.to_string(), value.clone());
        }

        Ok(Self {
            board_id,
            images,
            metadata,
            properties,
        })
    }

    pub fn board_id(&self) -> u32 {
        self.board_id
    }

    pub fn board_revision(&self) -> Option<u32> {
        self.number("board_revision").map(|n| n as u32)
    }

    /// Image keys in flashing order.
    pub fn image_keys(&self) -> Vec<&str> {
        self.images.iter().map(|s| s.key.as_str()).collect()
    }

    pub fn sections(&self) -> &[ImageSection] {
        &self.images
    }

    pub fn declared_size(&self, key: &str) -> Option<usize> {
        self.section(key).map(|s| s.declared_size)
    }

    pub fn metadata(&self, key: &str) -> Option<&MetadataBlob> {
        self.metadata.get(key)
    }

    pub fn version(&self) -> Option<&str> {
        self.text("version")
    }

    pub fn git_identity(&self) -> Option<&str> {
        self.text("git_identity")
    }

    pub fn summary(&self) -> Option<&str> {
        self.text("summary")
    }

    pub fn description(&self) -> Option<&str> {
        self.text("description")
    }

    pub fn build_time(&self) -> Option<u64> {
        self.number("build_time")
    }

    pub fn image_maxsize(&self) -> Option<u64> {
        self.number("image_maxsize")
    }

    /// Any descriptive key as raw JSON.
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    fn text(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    fn number(&self, key: &str) -> Option<u64> {
        self.properties.get(key).and_then(Value::as_u64)
    }

    fn section(&self, key: &str) -> Option<&ImageSection> {
        self.images.iter().find(|s| s.key == key)
    }

    /// Decode and inflate an image section.
    ///
    /// The inflated length must equal the declared size exactly; inflation
    /// stops one byte past the declared size so an oversized stream is
    /// detected without being read in full.
    #[instrument(skip(self))]
    pub fn image(&self, key: &str) -> Result<Vec<u8>, ContainerError> {
        let section = self
            .section(key)
            .ok_or_else(|| ContainerError::UnknownImage(key.to_string()))?;
        let malformed = |detail: String| ContainerError::MalformedSection {
            key: key.to_string(),
            detail,
        };

        if section.compressed.trim().is_empty() {
            return Err(ContainerError::EmptySection(key.to_string()));
        }
        let raw = STANDARD
            .decode(section.compressed.trim())
            .map_err(|e| malformed(e.to_string()))?;
        if raw.is_empty() {
            return Err(ContainerError::EmptySection(key.to_string()));
        }

        // The declared size is untrusted; the buffer grows with what inflates.
        let declared = section.declared_size;
        let mut image = Vec::new();
        ZlibDecoder::new(raw.as_slice())
            .take((declared as u64).saturating_add(1))
            .read_to_end(&mut image)
            .map_err(|e| malformed(e.to_string()))?;

        if image.len() != declared {
            return Err(ContainerError::SizeMismatch {
                key: key.to_string(),
                declared,
                actual: image.len(),
            });
        }
        debug!(key, compressed = raw.len(), size = declared, "Image inflated");
        Ok(image)
    }
}

fn is_recognized(key: &str) -> bool {
    if key == BOARD_ID {
        return true;
    }
    let sized = IMAGE_KEYS
        .iter()
        .map(|(k, _)| *k)
        .chain(METADATA_KEYS)
        .any(|k| key == k || key.strip_suffix("_size") == Some(k));
    sized || PROPERTY_KEYS.iter().any(|(k, _)| *k == key)
}

fn as_u32(key: &str, value: &Value) -> Result<u32, ContainerError> {
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| ContainerError::Format(format!("'{}' is not an unsigned 32-bit number", key)))
}

fn as_text<'a>(key: &str, value: &'a Value) -> Result<&'a str, ContainerError> {
    value
        .as_str()
        .ok_or_else(|| ContainerError::Format(format!("'{}' is not a string", key)))
}

/// zlib-compress and base64-encode a payload the way containers store it.
pub fn pack_section(data: &[u8]) -> std::io::Result<String> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data)?;
    Ok(STANDARD.encode(encoder.finish()?))
}

/// Builds a container from raw images.
#[derive(Debug, Clone)]
pub struct ContainerBuilder {
    map: Map<String, Value>,
}

impl ContainerBuilder {
    pub fn new(board_id: u32) -> Self {
        let mut map = Map::new();
        map.insert(BOARD_ID.to_string(), Value::from(board_id));
        Self { map }
    }

    fn section(mut self, key: &str, data: &[u8]) -> std::io::Result<Self> {
        self.map
            .insert(key.to_string(), Value::from(pack_section(data)?));
        self.map
            .insert(format!("{}_size", key), Value::from(data.len()));
        Ok(self)
    }

    pub fn image(self, data: &[u8]) -> std::io::Result<Self> {
        self.section(IMAGE, data)
    }

    pub fn extf_image(self, data: &[u8]) -> std::io::Result<Self> {
        self.section(EXTF_IMAGE, data)
    }

    pub fn parameter_xml(self, xml: &[u8]) -> std::io::Result<Self> {
        self.section(PARAMETER_XML, xml)
    }

    pub fn airframe_xml(self, xml: &[u8]) -> std::io::Result<Self> {
        self.section(AIRFRAME_XML, xml)
    }

    /// Set a raw key, recognized or not.
    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.map.insert(key.to_string(), value.into());
        self
    }

    pub fn version(self, version: &str) -> Self {
        self.set("version", version)
    }

    pub fn description(self, description: &str) -> Self {
        self.set("description", description)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.map.clone())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a Value built from strings and numbers cannot fail.
        serde_json::to_vec_pretty(&self.map).unwrap_or_default()
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        std::fs::write(path, self.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fmu.px4");
        let image = sample(5000);
        ContainerBuilder::new(9)
            .image(&image)
            .unwrap()
            .parameter_xml(b"<parameters/>")
            .unwrap()
            .version("1.14.0")
            .set("build_time", 1_700_000_000u64)
            .write_to(&path)
            .unwrap();

        let container = FirmwareContainer::load(&path).unwrap();
        assert_eq!(container.board_id(), 9);
        assert_eq!(container.image_keys(), vec![IMAGE]);
        assert_eq!(container.declared_size(IMAGE), Some(5000));
        assert_eq!(container.image(IMAGE).unwrap(), image);
        assert_eq!(container.version(), Some("1.14.0"));
        assert_eq!(container.build_time(), Some(1_700_000_000));
        let blob = container.metadata(PARAMETER_XML).unwrap();
        assert_eq!(blob.declared_size, Some(13));
        assert_eq!(blob.encoded, pack_section(b"<parameters/>").unwrap());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = FirmwareContainer::load(dir.path().join("absent.px4")).unwrap_err();
        assert!(matches!(err, ContainerError::FileOpen { .. }));
    }

    #[test]
    fn test_not_an_object() {
        assert!(matches!(
            FirmwareContainer::from_bytes(b"[1, 2]"),
            Err(ContainerError::Format(_))
        ));
        assert!(matches!(
            FirmwareContainer::from_bytes(b"not json"),
            Err(ContainerError::Format(_))
        ));
    }

    #[test]
    fn test_missing_keys() {
        let no_board = br#"{"image": "eJwDAAAAAAE=", "image_size": 0}"#;
        match FirmwareContainer::from_bytes(no_board) {
            Err(ContainerError::MissingKey(k)) => assert_eq!(k, "board_id"),
            other => panic!("unexpected: {:?}", other),
        }

        let no_image = ContainerBuilder::new(9).to_bytes();
        match FirmwareContainer::from_bytes(&no_image) {
            Err(ContainerError::MissingKey(k)) => assert_eq!(k, "image"),
            other => panic!("unexpected: {:?}", other),
        }

        let no_size = br#"{"board_id": 9, "image": "eJwDAAAAAAE="}"#;
        match FirmwareContainer::from_bytes(no_size) {
            Err(ContainerError::MissingKey(k)) => assert_eq!(k, "image_size"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unrecognized_key() {
        let bytes = ContainerBuilder::new(9)
            .image(&sample(10))
            .unwrap()
            .set("bootloader_blob", "x")
            .to_bytes();
        match FirmwareContainer::from_bytes(&bytes) {
            Err(ContainerError::InvalidKey(k)) => assert_eq!(k, "bootloader_blob"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_wrong_type() {
        let bytes = ContainerBuilder::new(9)
            .image(&sample(10))
            .unwrap()
            .set("board_id", "nine")
            .to_bytes();
        assert!(matches!(
            FirmwareContainer::from_bytes(&bytes),
            Err(ContainerError::Format(_))
        ));
    }

    #[test]
    fn test_size_off_by_one_is_mismatch() {
        let image = sample(1024);
        for declared in [1023usize, 1025] {
            let bytes = ContainerBuilder::new(9)
                .image(&image)
                .unwrap()
                .set("image_size", declared)
                .to_bytes();
            let container = FirmwareContainer::from_bytes(&bytes).unwrap();
            match container.image(IMAGE) {
                Err(ContainerError::SizeMismatch { declared: d, actual, .. }) => {
                    assert_eq!(d, declared);
                    assert_eq!(actual, if declared < 1024 { declared + 1 } else { 1024 });
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn test_huge_declared_size_is_mismatch() {
        let declared = u32::MAX as usize;
        let bytes = ContainerBuilder::new(9)
            .image(&sample(64))
            .unwrap()
            .set("image_size", declared)
            .to_bytes();
        let container = FirmwareContainer::from_bytes(&bytes).unwrap();
        match container.image(IMAGE) {
            Err(ContainerError::SizeMismatch { declared: d, actual, .. }) => {
                assert_eq!(d, declared);
                assert_eq!(actual, 64);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_empty_and_malformed_sections() {
        let empty = ContainerBuilder::new(9)
            .set("image", "")
            .set("image_size", 0)
            .to_bytes();
        let container = FirmwareContainer::from_bytes(&empty).unwrap();
        assert!(matches!(container.image(IMAGE), Err(ContainerError::EmptySection(_))));

        let not_base64 = ContainerBuilder::new(9)
            .set("image", "***")
            .set("image_size", 4)
            .to_bytes();
        let container = FirmwareContainer::from_bytes(&not_base64).unwrap();
        assert!(matches!(
            container.image(IMAGE),
            Err(ContainerError::MalformedSection { .. })
        ));

        let not_zlib = ContainerBuilder::new(9)
            .set("image", STANDARD.encode(b"plain bytes"))
            .set("image_size", 11)
            .to_bytes();
        let container = FirmwareContainer::from_bytes(&not_zlib).unwrap();
        assert!(matches!(
            container.image(IMAGE),
            Err(ContainerError::MalformedSection { .. })
        ));
    }

    #[test]
    fn test_unknown_image_key() {
        let bytes = ContainerBuilder::new(9).image(&sample(8)).unwrap().to_bytes();
        let container = FirmwareContainer::from_bytes(&bytes).unwrap();
        assert!(matches!(
            container.image(EXTF_IMAGE),
            Err(ContainerError::UnknownImage(_))
        ));
    }

    #[test]
    fn test_images_keep_flashing_order() {
        let bytes = ContainerBuilder::new(50)
            .extf_image(&sample(64))
            .unwrap()
            .image(&sample(128))
            .unwrap()
            .to_bytes();
        let container = FirmwareContainer::from_bytes(&bytes).unwrap();
        assert_eq!(container.image_keys(), vec![IMAGE, EXTF_IMAGE]);
        assert_eq!(container.image(EXTF_IMAGE).unwrap(), sample(64));
    }
}
