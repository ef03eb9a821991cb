use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::compare;
use crate::config::{self, SpeedWeights};
use crate::error::{Error, Result};
use crate::image::Image;
use crate::package::{self, Member};
use crate::planner::{InstallPlan, InstallStep, PackageKind, StepKind};
use crate::progress::{self, Checkpoints};
use crate::report::{self, BuildReport};
use crate::script::{self, SCRIPT_NAME, ScriptOptions};
use crate::tool::Toolchain;

/// Everything a build needs, fixed before any work starts.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// One directory for a full package, old and new directories for a diff.
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub sign: bool,
    /// Signing key and certificate, relative to the tools directory.
    pub key: PathBuf,
    pub cert: PathBuf,
    pub include_new_partitions: bool,
    pub block_size: u32,
    pub delta_block_size: u32,
    pub otalog: String,
    pub version: u32,
    pub speed_conf: Option<PathBuf>,
    pub ota_tmp: String,
    pub user_begin_script: Option<PathBuf>,
    pub user_end_script: Option<PathBuf>,
    pub user_end_script_progress: u32,
    pub user_files: Vec<PathBuf>,
    pub upgrade_verify: Vec<String>,
    pub report: Option<PathBuf>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            output: PathBuf::from("ota.zip"),
            sign: false,
            key: PathBuf::from("keys/key.pk8"),
            cert: PathBuf::from("keys/key.x509.pem"),
            include_new_partitions: false,
            block_size: 32768,
            delta_block_size: 0,
            otalog: String::new(),
            version: 0,
            speed_conf: None,
            ota_tmp: "/data/ota_tmp".into(),
            user_begin_script: None,
            user_end_script: None,
            user_end_script_progress: 0,
            user_files: Vec::new(),
            upgrade_verify: Vec::new(),
            report: None,
        }
    }
}

impl BuildOptions {
    pub fn kind(&self) -> Result<PackageKind> {
        match self.inputs.len() {
            1 => Ok(PackageKind::Full),
            2 => Ok(PackageKind::Diff),
            n => Err(Error::config(format!(
                "expected one (full) or two (diff) firmware directories, got {n}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub kind: PackageKind,
    pub checkpoints: Checkpoints,
    pub script: String,
    pub members: Vec<String>,
}

/// Asks before replacing an existing output. Only `y`/`Y` confirms.
pub fn confirm_overwrite<R: BufRead, W: Write>(
    output: &Path,
    assume_yes: bool,
    input: &mut R,
    prompt: &mut W,
) -> Result<bool> {
    if assume_yes || !output.exists() {
        return Ok(true);
    }
    writeln!(prompt, "The {} already exists, will cover it? [Y/N]", output.display())?;
    prompt.flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "Y" | "y"))
}

pub fn build(opts: &BuildOptions, tools: &Toolchain<'_>) -> Result<BuildOutcome> {
    let kind = opts.kind()?;

    // Pre-flight: everything that can be wrong with the inputs is checked
    // before any tool runs or the archive is opened.
    tools.require_avbtool()?;
    if kind == PackageKind::Diff {
        tools.ensure_delta_tools()?;
    }
    let speeds = match &opts.speed_conf {
        Some(p) => config::load(p)?,
        None => SpeedWeights::default(),
    };
    let end = progress::end_bound(opts.user_end_script_progress)?;
    let script_opts = ScriptOptions {
        otalog: opts.otalog.clone(),
        ota_tmp: opts.ota_tmp.clone(),
        block_size: opts.block_size,
        begin_script: read_user_script(opts.user_begin_script.as_deref())?,
        end_script: read_user_script(opts.user_end_script.as_deref())?,
    };
    let user_files = package::user_members(&opts.user_files)?;
    if opts.version != 0 {
        info!("package version {}", opts.version);
    }

    // Removed on drop, on the error paths too.
    let scratch = tempfile::Builder::new()
        .prefix("otapack-")
        .tempdir()
        .map_err(|e| Error::msg(format!("failed to create scratch dir: {e}")))?;

    let staged = match kind {
        PackageKind::Full => stage_full(&opts.inputs[0], opts, &speeds, tools)?,
        PackageKind::Diff => stage_diff(
            &opts.inputs[0],
            &opts.inputs[1],
            scratch.path(),
            opts,
            &speeds,
            tools,
        )?,
    };

    let checkpoints = staged.plan.checkpoints(end)?;
    debug!("checkpoints: {:?}", checkpoints.as_slice());
    let script = script::synthesize(&staged.plan, &checkpoints, &script_opts)?;

    let mut members = staged.payloads;
    members.push(Member::bytes(SCRIPT_NAME, script.clone()));
    members.extend(user_files);

    package::write_archive(&opts.output, &members)?;
    if opts.sign {
        let tools_dir = &tools.paths().tools_dir;
        package::sign_in_place(
            tools,
            &tools_dir.join(&opts.cert),
            &tools_dir.join(&opts.key),
            &opts.output,
        )?;
    }

    if let Some(path) = &opts.report {
        let report = BuildReport {
            kind: kind.as_str().into(),
            version: opts.version,
            output: opts.output.display().to_string(),
            signed: opts.sign,
            generated_at: report::now_rfc3339(),
            archive_sha256: report::sha256_file_hex(&opts.output)?,
            checkpoints: checkpoints.as_slice().to_vec(),
            members: BuildReport::member_reports(&members)?,
        };
        report.write(path)?;
        info!("wrote {}", path.display());
    }

    Ok(BuildOutcome {
        kind,
        checkpoints,
        script,
        members: members.into_iter().map(|m| m.name).collect(),
    })
}

struct Staged {
    plan: InstallPlan,
    payloads: Vec<Member>,
}

fn read_user_script(path: Option<&Path>) -> Result<Option<String>> {
    let Some(path) = path else {
        return Ok(None);
    };
    fs::read_to_string(path)
        .map(Some)
        .map_err(|e| Error::config(format!("failed to read user script {}: {e}", path.display())))
}

fn stage_full(
    dir: &Path,
    opts: &BuildOptions,
    speeds: &SpeedWeights,
    tools: &Toolchain<'_>,
) -> Result<Staged> {
    let mut plan = InstallPlan::new(PackageKind::Full);
    let mut payloads = Vec::new();
    for img in compare::scan_full(dir)? {
        debug!("add {}", img.path.display());
        // ota-type images ride along in a full package but are not flashed.
        if !img.is_ota() {
            plan.add(write_step(&img, opts, speeds, tools)?)?;
        }
        payloads.push(Member::file(img.file_name.clone(), &img.path));
    }
    Ok(Staged { plan, payloads })
}

fn stage_diff(
    old_dir: &Path,
    new_dir: &Path,
    scratch: &Path,
    opts: &BuildOptions,
    speeds: &SpeedWeights,
    tools: &Toolchain<'_>,
) -> Result<Staged> {
    let classified = compare::classify_dirs(old_dir, new_dir, opts.include_new_partitions)?;
    if classified.is_empty() {
        return Err(Error::config(format!(
            "nothing changed between {} and {}",
            old_dir.display(),
            new_dir.display()
        )));
    }

    let patch_dir = scratch.join("patch");
    fs::create_dir_all(&patch_dir)
        .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", patch_dir.display())))?;

    let mut plan = InstallPlan::new(PackageKind::Diff);
    let mut payloads = Vec::new();
    for pair in &classified.deltas {
        let patch_name = pair.new.patch_name();
        let patch = patch_dir.join(&patch_name);
        debug!("{}", patch.display());
        tools.generate_delta(&pair.old.path, &pair.new.path, &patch, opts.delta_block_size)?;
        let patch_size = fs::metadata(&patch)
            .map_err(|e| Error::msg(format!("patch {} was not produced: {e}", patch.display())))?
            .len();
        plan.add(InstallStep {
            kind: StepKind::ApplyDelta {
                patch: patch_name.clone(),
            },
            image: pair.old.file_name.clone(),
            device: pair.old.device_path(),
            weighted_size: speeds.weigh(&pair.old.file_name, patch_size),
        })?;
        payloads.push(Member::file(patch_name, patch));
    }

    for img in classified.full_copies.iter().chain(&classified.new_partitions) {
        debug!("add {}", img.path.display());
        plan.add(write_step(img, opts, speeds, tools)?)?;
        payloads.push(Member::file(img.file_name.clone(), &img.path));
    }
    Ok(Staged { plan, payloads })
}

fn write_step(
    img: &Image,
    opts: &BuildOptions,
    speeds: &SpeedWeights,
    tools: &Toolchain<'_>,
) -> Result<InstallStep> {
    Ok(InstallStep {
        kind: StepKind::WriteImage {
            verify_rollback: wants_rollback_check(img, opts, tools)?,
        },
        image: img.file_name.clone(),
        device: img.device_path(),
        weighted_size: speeds.weigh(&img.file_name, img.size),
    })
}

fn wants_rollback_check(img: &Image, opts: &BuildOptions, tools: &Toolchain<'_>) -> Result<bool> {
    if !opts.upgrade_verify.is_empty()
        && !opts
            .upgrade_verify
            .iter()
            .any(|n| n == &img.file_name || n == img.partition())
    {
        return Ok(false);
    }
    let index = tools.rollback_index(&img.path)?;
    if index != 0 {
        debug!("enabled update verification for {}", img.file_name);
    }
    Ok(index != 0)
}
