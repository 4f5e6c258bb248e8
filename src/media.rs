use serde::{Deserialize, Serialize};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "heic", "heif"];
const VIDEO_EXTENSIONS: &[&str] = &["mov", "mp4", "m4v"];
const HEIF_EXTENSIONS: &[&str] = &["heic", "heif"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
}

impl MediaType {
    /// Media type for a recognized album file name, `None` for anything else.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let ext = extension_lowercase(name)?;
        if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Video)
        } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Image)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }
}

/// HEIC/HEIF stills take the dedicated decoder branch.
pub fn is_heif_file_name(name: &str) -> bool {
    extension_lowercase(name)
        .map(|ext| HEIF_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

fn extension_lowercase(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
