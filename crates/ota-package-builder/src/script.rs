//! Device-side install script (`ota.sh`).
//!
//! The script runs once at boot with nothing supervising it, so every
//! failure is terminal: a failed patch or version check reports progress
//! -1 and exits, a failed raw write reboots the device.

use crate::error::{Error, Result};
use crate::planner::{InstallPlan, InstallStep, StepKind};
use crate::progress::{COMPLETE, Checkpoints, START};

pub const SCRIPT_NAME: &str = "ota.sh";

#[derive(Debug, Clone, Default)]
pub struct ScriptOptions {
    /// Device log destination; empty keeps echoes on the console.
    pub otalog: String,
    /// Device working directory for the patch applier.
    pub ota_tmp: String,
    /// `dd` block size.
    pub block_size: u32,
    pub begin_script: Option<String>,
    pub end_script: Option<String>,
}

impl ScriptOptions {
    fn log(&self) -> String {
        if self.otalog.is_empty() {
            String::new()
        } else {
            format!(" >> {}", self.otalog)
        }
    }
}

pub fn synthesize(plan: &InstallPlan, checkpoints: &Checkpoints, opts: &ScriptOptions) -> Result<String> {
    let steps = plan.steps();
    if steps.len() != checkpoints.len() {
        return Err(Error::msg(format!(
            "{} install steps but {} progress checkpoints",
            steps.len(),
            checkpoints.len()
        )));
    }
    let log = opts.log();
    let mut out = String::new();

    if let Some(begin) = &opts.begin_script {
        out.push_str("echo \"run user script before ota\"\n");
        out.push_str(begin);
        out.push('\n');
    }

    out.push_str("set +e\n");
    out.push_str(&format!("setprop ota.progress.current {START}\n"));
    out.push_str(&format!("setprop ota.progress.next {}\n", checkpoints.first()));

    let delta_count = plan.delta_steps().count();
    if let Some(last) = plan.delta_steps().last() {
        out.push_str(&format!("if [ ! -e /ota/{} ]\nthen\n", last.image));
        for (idx, step) in steps[..delta_count].iter().enumerate() {
            let StepKind::ApplyDelta { patch } = &step.kind else {
                continue;
            };
            push_delta_step(&mut out, step, patch, opts, &log);
            out.push_str(&format!(
                "    setprop ota.progress.current {}\n",
                checkpoint(checkpoints, idx)?
            ));
            if idx + 1 < delta_count {
                out.push_str(&format!(
                    "    setprop ota.progress.next {}\n",
                    checkpoint(checkpoints, idx + 1)?
                ));
            }
        }
        out.push_str("\nfi\n");
    }

    for (idx, step) in steps.iter().enumerate().skip(delta_count) {
        let StepKind::WriteImage { verify_rollback } = step.kind else {
            continue;
        };
        if verify_rollback {
            push_rollback_check(&mut out, step, &log);
        }
        push_write_step(&mut out, step, opts, &log);
        out.push_str(&format!(
            "setprop ota.progress.current {}\n",
            checkpoint(checkpoints, idx)?
        ));
        if idx + 1 < steps.len() {
            out.push_str(&format!(
                "setprop ota.progress.next {}\n",
                checkpoint(checkpoints, idx + 1)?
            ));
        }
    }

    if let Some(end) = &opts.end_script {
        out.push_str(&format!("setprop ota.progress.next {COMPLETE}\n"));
        out.push_str("echo \"run user script after ota\"\n");
        out.push_str(end);
        out.push('\n');
        out.push_str(&format!("setprop ota.progress.current {COMPLETE}\n"));
    }

    Ok(out)
}

fn checkpoint(checkpoints: &Checkpoints, idx: usize) -> Result<u32> {
    checkpoints
        .get(idx)
        .ok_or_else(|| Error::msg(format!("no progress checkpoint for step {idx}")))
}

fn image_stem(image: &str) -> &str {
    image.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(image)
}

fn push_delta_step(out: &mut String, step: &InstallStep, patch: &str, opts: &ScriptOptions, log: &str) {
    out.push_str(&format!(
        r#"
    echo "generate {image}"{log}
    time "ddelta_apply {device} {tmp}/ /ota/{patch}"
    if [ $? -ne 0 ]
    then
        echo "ddelta_apply {stem} failed"{log}
        setprop ota.progress.current -1
        exit
    fi

"#,
        image = step.image,
        device = step.device,
        tmp = opts.ota_tmp,
        stem = image_stem(&step.image),
    ));
}

fn push_rollback_check(out: &mut String, step: &InstallStep, log: &str) {
    out.push_str(&format!(
        r#"
avb_verify -U /ota/{image} {device} /etc/key.avb
if [ $? -ne 0 ]
then
    echo "check {image} version failed!"{log}
    setprop ota.progress.current -1
    exit
fi
"#,
        image = step.image,
        device = step.device,
    ));
}

fn push_write_step(out: &mut String, step: &InstallStep, opts: &ScriptOptions, log: &str) {
    out.push_str(&format!(
        r#"
echo "install {image}"{log}
time "dd if=/ota/{image} of={device} bs={bs} verify"
if [ $? -ne 0 ]
then
    echo "dd {image} failed"{log}
    reboot
fi
"#,
        image = step.image,
        device = step.device,
        bs = opts.block_size,
    ));
}
