use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

pub const IMAGE_PREFIX: &str = "vela_";

static IMAGE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^vela_(.+)\.(bin|elf)$").expect("image name pattern is valid")
});

/// Partition name of a conforming image file name (`vela_<name>.<bin|elf>`).
pub fn partition_name(file_name: &str) -> Option<&str> {
    IMAGE_NAME
        .captures(file_name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

pub fn is_image_name(file_name: &str) -> bool {
    partition_name(file_name).is_some()
}

/// A firmware partition image discovered in an input directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub file_name: String,
    pub path: PathBuf,
    pub size: u64,
}

impl Image {
    pub fn load(path: &Path) -> Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::msg(format!("invalid image path: {}", path.display())))?
            .to_string();
        if !is_image_name(&file_name) {
            return Err(Error::config(format!(
                "'{file_name}' does not follow the vela_<name>.bin|elf naming convention"
            )));
        }
        let size = fs::metadata(path)
            .map_err(|e| Error::msg(format!("failed to stat {}: {e}", path.display())))?
            .len();
        Ok(Self {
            file_name,
            path: path.to_path_buf(),
            size,
        })
    }

    pub fn partition(&self) -> &str {
        partition_name(&self.file_name).unwrap_or(&self.file_name)
    }

    /// ota-type images carry the updater itself and are always shipped whole.
    pub fn is_ota(&self) -> bool {
        self.partition().starts_with("ota")
    }

    pub fn device_path(&self) -> String {
        format!("/dev/{}", self.partition())
    }

    /// `vela_ap.bin` -> `vela_ap.patch`
    pub fn patch_name(&self) -> String {
        let stem = self
            .file_name
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(&self.file_name);
        format!("{stem}.patch")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(name: &str) -> Image {
        Image {
            file_name: name.into(),
            path: PathBuf::from(name),
            size: 0,
        }
    }

    #[test]
    fn naming_convention() {
        assert_eq!(partition_name("vela_ap.bin"), Some("ap"));
        assert_eq!(partition_name("vela_audio.elf"), Some("audio"));
        assert_eq!(partition_name("vela_ap.img"), None);
        assert_eq!(partition_name("ap.bin"), None);
        assert_eq!(partition_name("vela_.bin"), None);
    }

    #[test]
    fn derived_paths() {
        let img = image("vela_audio.elf");
        assert_eq!(img.device_path(), "/dev/audio");
        assert_eq!(img.patch_name(), "vela_audio.patch");
        assert!(!img.is_ota());
        assert!(image("vela_ota.bin").is_ota());
    }
}
