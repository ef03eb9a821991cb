use crate::error::{Error, Result};
use crate::progress::{self, Checkpoints, StepWeights};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageKind {
    /// Every image shipped whole.
    Full,
    /// Changed images shipped as patches against the installed ones.
    Diff,
}

impl PackageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PackageKind::Full => "full",
            PackageKind::Diff => "diff",
        }
    }

    pub fn full_write_pivot(self) -> u32 {
        match self {
            PackageKind::Full => progress::START,
            PackageKind::Diff => progress::DIFF_FULL_WRITE_PIVOT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    ApplyDelta { patch: String },
    WriteImage { verify_rollback: bool },
}

/// One unit of device-side work.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallStep {
    pub kind: StepKind,
    /// Image file name as staged under `/ota`.
    pub image: String,
    pub device: String,
    /// Payload bytes times the image's speed weight.
    pub weighted_size: f64,
}

impl InstallStep {
    pub fn is_delta(&self) -> bool {
        matches!(self.kind, StepKind::ApplyDelta { .. })
    }
}

/// Ordered install steps: every delta step precedes every full write.
///
/// Checkpoints are bound to steps by position, so the order is frozen once
/// steps are added.
#[derive(Debug, Clone)]
pub struct InstallPlan {
    kind: PackageKind,
    steps: Vec<InstallStep>,
}

impl InstallPlan {
    pub fn new(kind: PackageKind) -> Self {
        Self {
            kind,
            steps: Vec::new(),
        }
    }

    pub fn kind(&self) -> PackageKind {
        self.kind
    }

    pub fn add(&mut self, step: InstallStep) -> Result<()> {
        if step.is_delta() {
            if self.kind == PackageKind::Full {
                return Err(Error::msg(format!(
                    "delta step for '{}' in a full package",
                    step.image
                )));
            }
            if self.steps.iter().any(|s| !s.is_delta()) {
                return Err(Error::msg(format!(
                    "delta step for '{}' added after a full write",
                    step.image
                )));
            }
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn steps(&self) -> &[InstallStep] {
        &self.steps
    }

    pub fn delta_steps(&self) -> impl Iterator<Item = &InstallStep> {
        self.steps.iter().filter(|s| s.is_delta())
    }

    pub fn full_steps(&self) -> impl Iterator<Item = &InstallStep> {
        self.steps.iter().filter(|s| !s.is_delta())
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn weights(&self) -> StepWeights {
        StepWeights {
            delta: self.delta_steps().map(|s| s.weighted_size).collect(),
            full: self.full_steps().map(|s| s.weighted_size).collect(),
        }
    }

    pub fn checkpoints(&self, end: u32) -> Result<Checkpoints> {
        progress::allocate(&self.weights(), self.kind.full_write_pivot(), end)
    }
}
