use std::ffi::OsString;
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{LazyLock, mpsc};

use regex::Regex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Exit status and captured stdout of an external tool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` when the tool was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Narrow seam over every external program the build drives (delta
/// generator, image info tool, signer, make). Calls block until the tool
/// exits; there is no timeout.
pub trait ToolRunner {
    fn run(&self, program: &Path, args: &[OsString]) -> Result<ToolOutput>;
}

/// Runs tools as child processes, logging their output at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

enum Stream {
    Stdout(String),
    Stderr(String),
}

impl ToolRunner for SystemRunner {
    fn run(&self, program: &Path, args: &[OsString]) -> Result<ToolOutput> {
        debug!("run: {} {}", program.display(), display_args(args));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::config(format!("failed to spawn {}: {e}", program.display())))?;

        let (tx, rx) = mpsc::channel::<Stream>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_lines(out, |l| tx.send(Stream::Stdout(l)).is_ok()));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_lines(err, |l| tx.send(Stream::Stderr(l)).is_ok()));
        }
        drop(tx);

        let tool = program
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("tool")
            .to_string();
        let mut stdout = String::new();
        for msg in rx {
            let line = match msg {
                Stream::Stdout(l) => {
                    stdout.push_str(&l);
                    stdout.push('\n');
                    l
                }
                Stream::Stderr(l) => l,
            };
            let line = sanitize_line(&line);
            if !line.is_empty() {
                debug!("[{tool}] {line}");
            }
        }

        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("wait for {} failed: {e}", program.display())))?;
        Ok(ToolOutput {
            code: status.code(),
            stdout,
        })
    }
}

/// Longest run of bytes held back waiting for a line terminator.
const MAX_PENDING_BYTES: usize = 16 * 1024;

fn read_lines<R: Read>(reader: R, mut emit: impl FnMut(String) -> bool) {
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for b in &buf[..n] {
            if *b == b'\n' || *b == b'\r' {
                if pending.is_empty() {
                    continue;
                }
            } else {
                pending.push(*b);
                if pending.len() < MAX_PENDING_BYTES {
                    continue;
                }
            }
            let line = String::from_utf8_lossy(&pending).into_owned();
            pending.clear();
            if !emit(line) {
                return;
            }
        }
    }

    if !pending.is_empty() {
        emit(String::from_utf8_lossy(&pending).into_owned());
    }
}

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b(\[[0-?]*[ -/]*[@-~]|\][^\x07\x1b]*(\x07|\x1b\\)|.)")
        .expect("escape pattern is valid")
});

/// Strips terminal escape sequences and control characters from tool output.
pub fn sanitize_line(input: &str) -> String {
    ANSI_ESCAPE
        .replace_all(input, "")
        .chars()
        .map(|c| if c == '\t' { ' ' } else { c })
        .filter(|c| !c.is_control())
        .collect()
}

fn display_args(args: &[OsString]) -> String {
    args.iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Locations of the helper tools shipped next to the packager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub tools_dir: PathBuf,
    pub avbtool: PathBuf,
}

impl ToolPaths {
    pub fn new(tools_dir: PathBuf, avbtool: Option<PathBuf>) -> Self {
        let avbtool =
            avbtool.unwrap_or_else(|| tools_dir.join("../../../../external/avb/avb/avbtool"));
        Self { tools_dir, avbtool }
    }

    pub fn delta_generate(&self) -> PathBuf {
        self.tools_dir.join("ddelta_generate")
    }

    pub fn delta_source_dir(&self) -> PathBuf {
        self.tools_dir.join("../../../../external/ddelta/ddelta")
    }

    pub fn sign_jar(&self) -> PathBuf {
        self.tools_dir.join("signapk.jar")
    }
}

/// Typed wrappers over the external tools the build needs.
pub struct Toolchain<'a> {
    runner: &'a dyn ToolRunner,
    paths: ToolPaths,
}

impl<'a> Toolchain<'a> {
    pub fn new(runner: &'a dyn ToolRunner, paths: ToolPaths) -> Self {
        Self { runner, paths }
    }

    pub fn paths(&self) -> &ToolPaths {
        &self.paths
    }

    pub fn require_avbtool(&self) -> Result<()> {
        if !self.paths.avbtool.exists() {
            return Err(Error::config(format!(
                "avbtool: {}: No such file or directory",
                self.paths.avbtool.display()
            )));
        }
        Ok(())
    }

    /// Builds the delta tools from source when they are not already present.
    pub fn ensure_delta_tools(&self) -> Result<()> {
        let generate = self.paths.delta_generate();
        if generate.exists() {
            return Ok(());
        }
        let src = self.paths.delta_source_dir();
        info!("building delta tools in {}", src.display());
        let out = self.runner.run(
            Path::new("make"),
            &[
                "-C".into(),
                src.clone().into_os_string(),
                "-f".into(),
                "Makefile".into(),
            ],
        )?;
        if !out.success() {
            return Err(Error::config(format!(
                "failed to build delta tools in {}",
                src.display()
            )));
        }
        for bin in ["ddelta_generate", "ddelta_apply"] {
            let from = src.join(bin);
            let to = self.paths.tools_dir.join(bin);
            fs::rename(&from, &to).map_err(|e| {
                Error::config(format!(
                    "failed to move {} -> {}: {e}",
                    from.display(),
                    to.display()
                ))
            })?;
        }
        if !generate.exists() {
            return Err(Error::config(format!(
                "{}: No such file or directory",
                generate.display()
            )));
        }
        Ok(())
    }

    /// Writes a patch turning `old` into `new`. A non-zero `blksz` selects
    /// block-size-aware (in-place) patching.
    pub fn generate_delta(&self, old: &Path, new: &Path, patch: &Path, blksz: u32) -> Result<()> {
        let mut args: Vec<OsString> = vec![
            old.as_os_str().to_owned(),
            new.as_os_str().to_owned(),
            patch.as_os_str().to_owned(),
        ];
        if blksz != 0 {
            args.push(blksz.to_string().into());
        }
        let out = self.runner.run(&self.paths.delta_generate(), &args)?;
        if !out.success() {
            return Err(Error::tool(
                format!("ddelta_generate failed for {}", new.display()),
                out.code,
            ));
        }
        Ok(())
    }

    /// Rollback index embedded in `image`; 0 when the image carries none or
    /// the query fails.
    pub fn rollback_index(&self, image: &Path) -> Result<u64> {
        let out = self.runner.run(
            &self.paths.avbtool,
            &[
                "info_image".into(),
                "--image".into(),
                image.as_os_str().to_owned(),
                "--rollback_index".into(),
            ],
        )?;
        if !out.success() {
            debug!("no rollback index for {}", image.display());
            return Ok(0);
        }
        Ok(out.stdout.trim().parse().unwrap_or(0))
    }

    pub fn sign(&self, cert: &Path, key: &Path, input: &Path, output: &Path) -> Result<()> {
        let args: Vec<OsString> = vec![
            "-jar".into(),
            self.paths.sign_jar().into_os_string(),
            "--min-sdk-version".into(),
            "0".into(),
            cert.as_os_str().to_owned(),
            key.as_os_str().to_owned(),
            input.as_os_str().to_owned(),
            output.as_os_str().to_owned(),
        ];
        let out = self.runner.run(Path::new("java"), &args)?;
        if !out.success() {
            return Err(Error::tool(
                format!("signing {} failed", input.display()),
                out.code,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    use super::*;

    /// Records invocations and answers from a table keyed by tool file name.
    #[derive(Default)]
    pub struct FakeRunner {
        pub calls: RefCell<Vec<(String, Vec<String>)>>,
        pub replies: BTreeMap<String, ToolOutput>,
    }

    impl FakeRunner {
        pub fn reply(mut self, tool: &str, code: i32, stdout: &str) -> Self {
            self.replies.insert(
                tool.into(),
                ToolOutput {
                    code: Some(code),
                    stdout: stdout.into(),
                },
            );
            self
        }
    }

    impl ToolRunner for FakeRunner {
        fn run(&self, program: &Path, args: &[OsString]) -> Result<ToolOutput> {
            let tool = program
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            self.calls.borrow_mut().push((
                tool.clone(),
                args.iter().map(|a| a.to_string_lossy().into_owned()).collect(),
            ));
            Ok(self.replies.get(&tool).cloned().unwrap_or(ToolOutput {
                code: Some(0),
                stdout: String::new(),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeRunner;
    use super::*;

    fn paths() -> ToolPaths {
        ToolPaths::new(PathBuf::from("/opt/tools"), Some(PathBuf::from("/opt/avbtool")))
    }

    #[test]
    fn long_unterminated_output_is_split_at_the_cap() {
        let mut data = vec![b'x'; MAX_PENDING_BYTES + 10];
        data.extend_from_slice(b"\r\n\nok\ntail");
        let mut lines = Vec::new();
        read_lines(data.as_slice(), |l| {
            lines.push(l);
            true
        });
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0].len(), MAX_PENDING_BYTES);
        assert_eq!(lines[1], "x".repeat(10));
        assert_eq!(lines[2], "ok");
        assert_eq!(lines[3], "tail");
    }

    #[test]
    fn strips_escape_sequences_and_controls() {
        assert_eq!(sanitize_line("ok \u{1b}[31mred\u{1b}[0m\tdone\r"), "ok red done");
        assert_eq!(sanitize_line("\u{1b}]0;title\u{7}x"), "x");
    }

    #[test]
    fn block_size_only_passed_when_non_zero() {
        let runner = FakeRunner::default();
        let tc = Toolchain::new(&runner, paths());
        tc.generate_delta(Path::new("o"), Path::new("n"), Path::new("p"), 0)
            .unwrap();
        tc.generate_delta(Path::new("o"), Path::new("n"), Path::new("p"), 4096)
            .unwrap();
        let calls = runner.calls.borrow();
        assert_eq!(calls[0].0, "ddelta_generate");
        assert_eq!(calls[0].1, ["o", "n", "p"]);
        assert_eq!(calls[1].1, ["o", "n", "p", "4096"]);
    }

    #[test]
    fn delta_failure_carries_exit_code() {
        let runner = FakeRunner::default().reply("ddelta_generate", 7, "");
        let tc = Toolchain::new(&runner, paths());
        let err = tc
            .generate_delta(Path::new("o"), Path::new("n"), Path::new("p"), 0)
            .unwrap_err();
        assert_eq!(err.exit_code(), 7);
    }

    #[test]
    fn rollback_index_parses_stdout_or_defaults_to_zero() {
        let runner = FakeRunner::default().reply("avbtool", 0, "3\n");
        let tc = Toolchain::new(&runner, paths());
        assert_eq!(tc.rollback_index(Path::new("img")).unwrap(), 3);

        let runner = FakeRunner::default().reply("avbtool", 1, "3\n");
        let tc = Toolchain::new(&runner, paths());
        assert_eq!(tc.rollback_index(Path::new("img")).unwrap(), 0);

        let runner = FakeRunner::default().reply("avbtool", 0, "garbage");
        let tc = Toolchain::new(&runner, paths());
        assert_eq!(tc.rollback_index(Path::new("img")).unwrap(), 0);
    }

    #[test]
    fn default_avbtool_is_relative_to_tools_dir() {
        let p = ToolPaths::new(PathBuf::from("/opt/tools"), None);
        assert_eq!(
            p.avbtool,
            PathBuf::from("/opt/tools/../../../../external/avb/avb/avbtool")
        );
    }
}
