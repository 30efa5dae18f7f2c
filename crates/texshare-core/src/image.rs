//! Shared image identifiers and descriptors.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DomainError, DomainResult};

// ============================================================================
// Limits
// ============================================================================

/// Maximum length of an image name in bytes.
pub const MAX_IMAGE_NAME_LEN: usize = 1024;

/// Maximum width or height of a shared image.
pub const MAX_IMAGE_DIMENSION: u32 = 16384;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Human-readable name under which a shared image is published.
///
/// Names are validated on construction and on deserialization, so a
/// request carrying an invalid name never reaches the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageName(String);

impl ImageName {
    /// Creates a validated image name.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidImageName` if the name is empty, longer
    /// than [`MAX_IMAGE_NAME_LEN`] bytes, or contains a NUL byte.
    pub fn new(name: impl Into<String>) -> DomainResult<Self> {
        let name = name.into();
        let reason = if name.is_empty() {
            Some("name is empty".to_string())
        } else if name.len() > MAX_IMAGE_NAME_LEN {
            Some(format!(
                "name is {} bytes (max {MAX_IMAGE_NAME_LEN})",
                name.len()
            ))
        } else if name.contains('\0') {
            Some("name contains a NUL byte".to_string())
        } else {
            None
        };

        match reason {
            Some(reason) => Err(DomainError::InvalidImageName { name, reason }),
            None => Ok(Self(name)),
        }
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ImageName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for ImageName {
    type Error = DomainError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ImageName> for String {
    fn from(name: ImageName) -> Self {
        name.0
    }
}

impl AsRef<str> for ImageName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Stable numeric identifier assigned to a shared image at creation.
///
/// Ids increase monotonically and are never reused during a daemon's
/// lifetime, so they stay valid across renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(u64);

impl ImageId {
    /// The first id handed out by a fresh registry.
    pub const FIRST: ImageId = ImageId(1);

    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the id following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ============================================================================
// Pixel Format
// ============================================================================

/// Pixel layout of a shared image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    /// 8-bit RGBA, unsigned normalized
    R8G8B8A8,
    /// 8-bit BGRA, unsigned normalized
    B8G8R8A8,
    /// 8-bit RGB, unsigned normalized
    R8G8B8,
    /// 8-bit BGR, unsigned normalized
    B8G8R8,
    /// 32-bit float RGBA
    R32G32B32A32Float,
}

impl ImageFormat {
    /// Bytes occupied by a single pixel.
    pub const fn bytes_per_pixel(self) -> u64 {
        match self {
            Self::R8G8B8A8 | Self::B8G8R8A8 => 4,
            Self::R8G8B8 | Self::B8G8R8 => 3,
            Self::R32G32B32A32Float => 16,
        }
    }

    /// Short lowercase name, as used on the command line.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::R8G8B8A8 => "rgba8",
            Self::B8G8R8A8 => "bgra8",
            Self::R8G8B8 => "rgb8",
            Self::B8G8R8 => "bgr8",
            Self::R32G32B32A32Float => "rgba32f",
        }
    }

    /// Parses the short name produced by [`ImageFormat::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rgba8" => Some(Self::R8G8B8A8),
            "bgra8" => Some(Self::B8G8R8A8),
            "rgb8" => Some(Self::R8G8B8),
            "bgr8" => Some(Self::B8G8R8),
            "rgba32f" => Some(Self::R32G32B32A32Float),
            _ => None,
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Descriptor
// ============================================================================

/// Dimensions and format fixed when a shared image is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
}

impl ImageDescriptor {
    /// Creates a validated descriptor.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidDimensions` if either side is zero or
    /// larger than [`MAX_IMAGE_DIMENSION`].
    pub fn new(width: u32, height: u32, format: ImageFormat) -> DomainResult<Self> {
        let descriptor = Self {
            width,
            height,
            format,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Checks the dimension bounds of a descriptor built field by field.
    pub fn validate(&self) -> DomainResult<()> {
        let in_range = |v: u32| (1..=MAX_IMAGE_DIMENSION).contains(&v);
        if in_range(self.width) && in_range(self.height) {
            Ok(())
        } else {
            Err(DomainError::InvalidDimensions {
                width: self.width,
                height: self.height,
                max: MAX_IMAGE_DIMENSION,
            })
        }
    }

    /// Size in bytes of a tightly packed allocation for this image.
    pub fn byte_size(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * self.format.bytes_per_pixel()
    }
}

impl fmt::Display for ImageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_name_validation() {
        assert!(ImageName::new("tex").is_ok());
        assert!(ImageName::new("").is_err());
        assert!(ImageName::new("a\0b").is_err());
        assert!(ImageName::new("x".repeat(MAX_IMAGE_NAME_LEN)).is_ok());
        assert!(ImageName::new("x".repeat(MAX_IMAGE_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_image_name_deserialize_rejects_empty() {
        let ok: Result<ImageName, _> = serde_json::from_str("\"camera\"");
        assert_eq!(ok.unwrap().as_str(), "camera");

        let err: Result<ImageName, _> = serde_json::from_str("\"\"");
        assert!(err.is_err());
    }

    #[test]
    fn test_image_id_ordering() {
        let first = ImageId::FIRST;
        assert_eq!(first.get(), 1);
        assert!(first.next() > first);
        assert_eq!(first.next().to_string(), "#2");
    }

    #[test]
    fn test_format_parse_matches_as_str() {
        for format in [
            ImageFormat::R8G8B8A8,
            ImageFormat::B8G8R8A8,
            ImageFormat::R8G8B8,
            ImageFormat::B8G8R8,
            ImageFormat::R32G32B32A32Float,
        ] {
            assert_eq!(ImageFormat::parse(format.as_str()), Some(format));
        }
        assert_eq!(ImageFormat::parse("RGBA8"), Some(ImageFormat::R8G8B8A8));
        assert_eq!(ImageFormat::parse("yuv420"), None);
    }

    #[test]
    fn test_descriptor_bounds() {
        assert!(ImageDescriptor::new(64, 64, ImageFormat::R8G8B8A8).is_ok());
        assert!(ImageDescriptor::new(0, 64, ImageFormat::R8G8B8A8).is_err());
        assert!(ImageDescriptor::new(64, MAX_IMAGE_DIMENSION + 1, ImageFormat::R8G8B8A8).is_err());
    }

    #[test]
    fn test_descriptor_byte_size() {
        let d = ImageDescriptor::new(64, 32, ImageFormat::R8G8B8A8).unwrap();
        assert_eq!(d.byte_size(), 64 * 32 * 4);

        let d = ImageDescriptor::new(2, 2, ImageFormat::R32G32B32A32Float).unwrap();
        assert_eq!(d.byte_size(), 64);
        assert_eq!(d.to_string(), "2x2 rgba32f");
    }
}
