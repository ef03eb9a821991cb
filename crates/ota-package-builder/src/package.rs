use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::error::{Error, Result};
use crate::tool::Toolchain;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberSource {
    File(PathBuf),
    Bytes(Vec<u8>),
}

/// One archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub source: MemberSource,
}

impl Member {
    pub fn file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source: MemberSource::File(path.into()),
        }
    }

    pub fn bytes(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            source: MemberSource::Bytes(data.into()),
        }
    }

    pub fn size(&self) -> Result<u64> {
        match &self.source {
            MemberSource::File(p) => Ok(fs::metadata(p)
                .map_err(|e| Error::msg(format!("failed to stat {}: {e}", p.display())))?
                .len()),
            MemberSource::Bytes(b) => Ok(b.len() as u64),
        }
    }
}

/// Archive entries for user-supplied files and directories. A directory is
/// walked recursively; each file keeps its literal path as member name.
pub fn user_members(paths: &[PathBuf]) -> Result<Vec<Member>> {
    let mut out = Vec::new();
    for path in paths {
        if !path.exists() {
            return Err(Error::config(format!(
                "the user file ({}) does not exist",
                path.display()
            )));
        }
        if path.is_dir() {
            for entry in walkdir::WalkDir::new(path).sort_by_file_name() {
                let entry = entry?;
                if !is_regular_file(&entry) {
                    continue;
                }
                let name = member_name(entry.path())?;
                info!("user file {} added as {name}", entry.path().display());
                out.push(Member::file(name, entry.path()));
            }
        } else {
            let name = member_name(path)?;
            info!("user file {} added as {name}", path.display());
            out.push(Member::file(name, path));
        }
    }
    Ok(out)
}

/// Regular files, and symlinks that resolve to one.
pub(crate) fn is_regular_file(entry: &walkdir::DirEntry) -> bool {
    let ft = entry.file_type();
    ft.is_file() || (ft.is_symlink() && entry.path().is_file())
}

/// Archive member name for a source path: root and `.` components dropped,
/// `dir/..` pairs collapsed. Leading `..` components are kept.
pub fn member_name(path: &Path) -> Result<String> {
    let mut parts: Vec<String> = Vec::new();
    for c in path.components() {
        match c {
            Component::Normal(s) => parts.push(s.to_string_lossy().into_owned()),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                if parts.last().is_some_and(|p| p != "..") {
                    parts.pop();
                } else {
                    parts.push("..".into());
                }
            }
        }
    }
    if parts.is_empty() {
        return Err(Error::config(format!(
            "user file path '{}' names no file",
            path.display()
        )));
    }
    let name = parts.join("/");
    if name.starts_with("../") {
        warn!("user file {} is stored outside the archive root as {name}", path.display());
    }
    Ok(name)
}

fn options() -> SimpleFileOptions {
    // Fixed timestamps and modes keep repeated builds byte-identical.
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644)
        .last_modified_time(DateTime::default())
}

/// Writes `members` into a deflate archive at `output`.
///
/// The archive is assembled in a sibling temporary file and moved into
/// place only once complete.
pub fn write_archive(output: &Path, members: &[Member]) -> Result<()> {
    let dir = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut tmp = tempfile::Builder::new()
        .prefix(".otapack-")
        .suffix(".zip.part")
        .tempfile_in(&dir)
        .map_err(|e| Error::msg(format!("failed to create temp archive in {}: {e}", dir.display())))?;

    {
        let mut zip = ZipWriter::new(tmp.as_file_mut());
        for m in members {
            let large = m.size()? >= u32::MAX as u64;
            zip.start_file(m.name.as_str(), options().large_file(large))?;
            match &m.source {
                MemberSource::File(p) => {
                    let mut f = fs::File::open(p)
                        .map_err(|e| Error::msg(format!("failed to open {}: {e}", p.display())))?;
                    io::copy(&mut f, &mut zip)?;
                }
                MemberSource::Bytes(b) => zip.write_all(b)?,
            }
            debug!("add {}", m.name);
        }
        zip.finish()?;
    }

    tmp.persist(output)
        .map_err(|e| Error::msg(format!("failed to write {}: {}", output.display(), e.error)))?;
    info!("wrote {}", output.display());
    Ok(())
}

/// `dir/ota.zip` -> `dir/sign_ota.zip`
pub fn signed_sibling(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    output.with_file_name(format!("sign_{name}"))
}

/// Signs `output` and replaces it with the signed copy. On failure the
/// unsigned archive stays where it is.
pub fn sign_in_place(tools: &Toolchain<'_>, cert: &Path, key: &Path, output: &Path) -> Result<()> {
    let signed = signed_sibling(output);
    if let Err(e) = tools.sign(cert, key, output, &signed) {
        if let Err(rm) = fs::remove_file(&signed) {
            if rm.kind() != io::ErrorKind::NotFound {
                debug!("failed to remove {}: {rm}", signed.display());
            }
        }
        return Err(e);
    }
    fs::rename(&signed, output).map_err(|e| {
        Error::msg(format!(
            "failed to move {} -> {}: {e}",
            signed.display(),
            output.display()
        ))
    })?;
    info!("{}, signature success!", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn member_names_keep_relative_structure() {
        assert_eq!(member_name(Path::new("res/a.txt")).unwrap(), "res/a.txt");
        assert_eq!(member_name(Path::new("./res/a.txt")).unwrap(), "res/a.txt");
        assert_eq!(member_name(Path::new("/etc/a.conf")).unwrap(), "etc/a.conf");
        assert_eq!(member_name(Path::new("res/sub/../a.txt")).unwrap(), "res/a.txt");
        assert!(member_name(Path::new("/")).is_err());
    }

    #[test]
    fn parent_relative_user_files_keep_their_path() {
        assert_eq!(member_name(Path::new("../res/a.txt")).unwrap(), "../res/a.txt");
        assert_eq!(member_name(Path::new("../../a")).unwrap(), "../../a");

        let tmp = tempfile::tempdir().expect("tempdir");
        let work = tmp.path().join("work");
        fs::create_dir_all(&work).unwrap();
        fs::write(tmp.path().join("extra.txt"), b"x").unwrap();
        let rel = work.join("../extra.txt");
        let members = user_members(&[rel.clone()]).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].source, MemberSource::File(rel));
        assert!(!members[0].name.contains(".."), "{}", members[0].name);
        assert!(members[0].name.ends_with("extra.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_user_files_are_included() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = tmp.path().join("store");
        let dir = tmp.path().join("res");
        fs::create_dir_all(&store).unwrap();
        fs::create_dir_all(&dir).unwrap();
        fs::write(store.join("font.ttf"), b"f").unwrap();
        fs::write(dir.join("a.txt"), b"a").unwrap();
        std::os::unix::fs::symlink(store.join("font.ttf"), dir.join("font.ttf")).unwrap();

        let members = user_members(&[dir]).unwrap();
        let names: Vec<_> = members.iter().map(|m| m.name.clone()).collect();
        assert_eq!(names.len(), 2, "{names:?}");
        assert!(names[1].ends_with("res/font.ttf"));
    }

    #[test]
    fn failed_signing_removes_partial_signed_copy() {
        use crate::tool::fake::FakeRunner;
        use crate::tool::ToolPaths;

        let tmp = tempfile::tempdir().expect("tempdir");
        let out = tmp.path().join("ota.zip");
        fs::write(&out, b"unsigned").unwrap();
        fs::write(signed_sibling(&out), b"partial").unwrap();
        let runner = FakeRunner::default().reply("java", 2, "");
        let tools = Toolchain::new(&runner, ToolPaths::new(tmp.path().to_path_buf(), None));

        let err = sign_in_place(&tools, Path::new("c"), Path::new("k"), &out).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(!signed_sibling(&out).exists());
        assert_eq!(fs::read(&out).unwrap(), b"unsigned");

        // Nothing left to clean up the second time round.
        let err = sign_in_place(&tools, Path::new("c"), Path::new("k"), &out).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn signed_sibling_prefixes_file_name() {
        assert_eq!(signed_sibling(Path::new("out/ota.zip")), PathBuf::from("out/sign_ota.zip"));
        assert_eq!(signed_sibling(Path::new("ota.zip")), PathBuf::from("sign_ota.zip"));
    }

    #[test]
    fn writes_members_in_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let src = tmp.path().join("vela_ap.bin");
        fs::write(&src, b"payload").unwrap();
        let out = tmp.path().join("ota.zip");
        write_archive(
            &out,
            &[Member::file("vela_ap.bin", &src), Member::bytes("ota.sh", "set +e\n")],
        )
        .unwrap();

        let mut zip = zip::ZipArchive::new(fs::File::open(&out).unwrap()).unwrap();
        assert_eq!(zip.len(), 2);
        assert_eq!(zip.by_index(0).unwrap().name(), "vela_ap.bin");
        let mut script = String::new();
        zip.by_name("ota.sh").unwrap().read_to_string(&mut script).unwrap();
        assert_eq!(script, "set +e\n");

        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn archives_are_reproducible() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let members = [Member::bytes("ota.sh", "x")];
        let a = tmp.path().join("a.zip");
        let b = tmp.path().join("b.zip");
        write_archive(&a, &members).unwrap();
        write_archive(&b, &members).unwrap();
        assert_eq!(fs::read(a).unwrap(), fs::read(b).unwrap());
    }

    #[test]
    fn user_directories_are_walked() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("res");
        fs::create_dir_all(dir.join("sub")).unwrap();
        fs::write(dir.join("a.txt"), b"a").unwrap();
        fs::write(dir.join("sub/b.txt"), b"b").unwrap();
        let members = user_members(&[dir.clone()]).unwrap();
        let names: Vec<_> = members.iter().map(|m| m.name.clone()).collect();
        assert_eq!(names.len(), 2);
        assert!(names[0].ends_with("res/a.txt"));
        assert!(names[1].ends_with("res/sub/b.txt"));
    }

    #[test]
    fn missing_user_file_is_a_config_error() {
        let err = user_members(&[PathBuf::from("/definitely/not/here")]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }
}
