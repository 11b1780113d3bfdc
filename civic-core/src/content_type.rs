use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Content type for assets stored in the chunk store.
///
/// Wraps MIME types as an enum for type-safe comparisons.
/// Stored as MIME type strings in the database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContentType {
    // Images
    Jpeg,
    Png,
    Gif,
    Webp,
    Heic,
    // Documents
    Pdf,
    Ppt,
    Pptx,
    // Video
    Mp4,
    // Other
    OctetStream,
    Other(String),
}

impl ContentType {
    /// MIME type string (e.g., "image/jpeg", "application/pdf").
    pub fn as_str(&self) -> &str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Webp => "image/webp",
            Self::Heic => "image/heic",
            Self::Pdf => "application/pdf",
            Self::Ppt => "application/vnd.ms-powerpoint",
            Self::Pptx => {
                "application/vnd.openxmlformats-officedocument.presentationml.presentation"
            }
            Self::Mp4 => "video/mp4",
            Self::OctetStream => "application/octet-stream",
            Self::Other(s) => s,
        }
    }

    /// Parse from a MIME type string (as stored in the database or sent by a client).
    ///
    /// Parameters such as `; charset=...` are ignored.
    pub fn from_mime(s: &str) -> Self {
        let essence = s.split(';').next().unwrap_or(s).trim().to_lowercase();
        match essence.as_str() {
            "image/jpeg" | "image/jpg" => Self::Jpeg,
            "image/png" => Self::Png,
            "image/gif" => Self::Gif,
            "image/webp" => Self::Webp,
            "image/heic" => Self::Heic,
            "application/pdf" => Self::Pdf,
            "application/vnd.ms-powerpoint" => Self::Ppt,
            "application/vnd.openxmlformats-officedocument.presentationml.presentation" => {
                Self::Pptx
            }
            "video/mp4" => Self::Mp4,
            "application/octet-stream" | "" => Self::OctetStream,
            _ => Self::Other(essence),
        }
    }

    /// Map a file extension to its content type.
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "jpg" | "jpeg" => Self::Jpeg,
            "png" => Self::Png,
            "gif" => Self::Gif,
            "webp" => Self::Webp,
            "heic" => Self::Heic,
            "pdf" => Self::Pdf,
            "ppt" => Self::Ppt,
            "pptx" => Self::Pptx,
            "mp4" => Self::Mp4,
            _ => Self::OctetStream,
        }
    }

    /// Resolve the content type of an upload.
    ///
    /// A declared MIME type wins unless it is missing or the generic
    /// `application/octet-stream`, in which case the filename extension decides.
    pub fn resolve(declared: Option<&str>, filename: &str) -> Self {
        let declared = declared.map(Self::from_mime);
        match declared {
            Some(ct) if ct != Self::OctetStream => ct,
            _ => std::path::Path::new(filename)
                .extension()
                .and_then(|e| e.to_str())
                .map(Self::from_extension)
                .unwrap_or(Self::OctetStream),
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(
            self,
            Self::Jpeg | Self::Png | Self::Gif | Self::Webp | Self::Heic
        ) || matches!(self, Self::Other(s) if s.starts_with("image/"))
    }

    /// PDFs and slide decks: what a week's report slot accepts.
    pub fn is_report(&self) -> bool {
        matches!(self, Self::Pdf | Self::Ppt | Self::Pptx)
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ContentType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ContentType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(ContentType::from_mime(&s))
    }
}
