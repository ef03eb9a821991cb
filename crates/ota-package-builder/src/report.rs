use std::fs;
use std::io::Read;
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::package::{Member, MemberSource};

#[derive(Debug, Clone, Serialize)]
pub struct MemberReport {
    pub name: String,
    pub bytes: u64,
    pub sha256: String,
}

/// Summary of a finished package, written as JSON next to the build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub kind: String,
    pub version: u32,
    pub output: String,
    pub signed: bool,
    pub generated_at: String,
    pub archive_sha256: String,
    pub checkpoints: Vec<u32>,
    pub members: Vec<MemberReport>,
}

impl BuildReport {
    pub fn member_reports(members: &[Member]) -> Result<Vec<MemberReport>> {
        members
            .iter()
            .map(|m| {
                let (bytes, sha256) = match &m.source {
                    MemberSource::File(p) => (m.size()?, sha256_file_hex(p)?),
                    MemberSource::Bytes(b) => (b.len() as u64, hex::encode(Sha256::digest(b))),
                };
                Ok(MemberReport {
                    name: m.name.clone(),
                    bytes,
                    sha256,
                })
            })
            .collect()
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", parent.display())))?;
        }
        let s = serde_json::to_string_pretty(self)?;
        fs::write(path, s).map_err(|e| Error::msg(format!("failed to write {}: {e}", path.display())))
    }
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 256];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
