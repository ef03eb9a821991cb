//! Progress checkpoints reported by the device while it installs a package.
//!
//! The install starts at `START` percent (earlier phases of the update own
//! 0..30). Delta steps split `end - START` in proportion to their weighted
//! size. Full-write steps then split `end - pivot` on their own weights,
//! where the pivot is `DIFF_FULL_WRITE_PIVOT` in a diff package and `START`
//! in a full package. The second phase is anchored at the pivot, not at the
//! point the delta phase reached.

use crate::error::{Error, Result};

pub const START: u32 = 30;
pub const DIFF_FULL_WRITE_PIVOT: u32 = 70;
pub const COMPLETE: u32 = 100;

/// Weighted sizes of the install steps, in script order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepWeights {
    pub delta: Vec<f64>,
    pub full: Vec<f64>,
}

impl StepWeights {
    pub fn len(&self) -> usize {
        self.delta.len() + self.full.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One checkpoint per step, reached when that step completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoints {
    values: Vec<u32>,
}

impl Checkpoints {
    pub fn as_slice(&self) -> &[u32] {
        &self.values
    }

    pub fn first(&self) -> u32 {
        self.values.first().copied().unwrap_or(COMPLETE)
    }

    pub fn get(&self, step: usize) -> Option<u32> {
        self.values.get(step).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// `end` for a given user end-script budget.
pub fn end_bound(user_end_script_progress: u32) -> Result<u32> {
    if user_end_script_progress > COMPLETE - START {
        return Err(Error::config(format!(
            "user end script progress {user_end_script_progress} leaves no room for the install (max {})",
            COMPLETE - START
        )));
    }
    Ok(COMPLETE - user_end_script_progress)
}

pub fn allocate(weights: &StepWeights, full_pivot: u32, end: u32) -> Result<Checkpoints> {
    if weights.is_empty() {
        return Err(Error::config("no install steps to allocate progress for"));
    }
    if end > COMPLETE || end < START {
        return Err(Error::config(format!(
            "progress end {end} outside {START}..={COMPLETE}"
        )));
    }

    let mut progress = START as f64;
    let mut values = Vec::with_capacity(weights.len());

    if !weights.delta.is_empty() {
        let total = phase_total("delta", &weights.delta)?;
        let span = (end - START) as f64;
        for w in &weights.delta {
            progress += w / total * span;
            values.push(checkpoint(progress, end));
        }
    }

    if !weights.full.is_empty() {
        if end < full_pivot {
            return Err(Error::config(format!(
                "progress end {end} is below the full-write pivot {full_pivot}"
            )));
        }
        let total = phase_total("full-write", &weights.full)?;
        let span = (end - full_pivot) as f64;
        for w in &weights.full {
            progress += w / total * span;
            values.push(checkpoint(progress, end));
        }
    }

    if let Some(last) = values.last_mut() {
        *last = end;
    }
    Ok(Checkpoints { values })
}

fn phase_total(phase: &str, weights: &[f64]) -> Result<f64> {
    if let Some(bad) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
        return Err(Error::config(format!(
            "{phase} step has invalid weighted size {bad}"
        )));
    }
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return Err(Error::config(format!(
            "{phase} steps all have zero weighted size"
        )));
    }
    Ok(total)
}

// The pivot-70 phase can overshoot `end` after a full delta phase.
fn checkpoint(progress: f64, end: u32) -> u32 {
    (progress.floor().max(0.0) as u32).min(end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights(delta: &[f64], full: &[f64]) -> StepWeights {
        StepWeights {
            delta: delta.to_vec(),
            full: full.to_vec(),
        }
    }

    fn assert_well_formed(c: &Checkpoints, end: u32) {
        let v = c.as_slice();
        assert!(v.windows(2).all(|w| w[0] <= w[1]), "not monotonic: {v:?}");
        assert!(v.iter().all(|p| *p <= COMPLETE), "out of range: {v:?}");
        assert_eq!(*v.last().unwrap(), end);
    }

    #[test]
    fn delta_phase_is_proportional_from_thirty() {
        let c = allocate(&weights(&[10.0, 10.0, 20.0], &[]), DIFF_FULL_WRITE_PIVOT, 100).unwrap();
        assert_eq!(c.as_slice(), &[47, 65, 100]);
    }

    #[test]
    fn full_phase_is_anchored_at_the_pivot() {
        // Delta phase lands at 65 before the forced tail; each full write
        // adds its share of (end - 70), not of what remains after 65.
        let c = allocate(&weights(&[10.0, 10.0], &[1.0, 1.0]), DIFF_FULL_WRITE_PIVOT, 90).unwrap();
        assert_eq!(c.as_slice(), &[60, 90, 90, 90]);

        let c = allocate(&weights(&[1.0], &[3.0, 1.0]), DIFF_FULL_WRITE_PIVOT, 100).unwrap();
        assert_eq!(c.as_slice(), &[100, 100, 100]);
        assert_well_formed(&c, 100);
    }

    #[test]
    fn full_package_uses_start_as_pivot() {
        let c = allocate(&weights(&[], &[1.0, 1.0, 2.0]), START, 100).unwrap();
        assert_eq!(c.as_slice(), &[47, 65, 100]);
    }

    #[test]
    fn last_checkpoint_is_end_bound() {
        let end = end_bound(10).unwrap();
        let c = allocate(&weights(&[3.0, 7.0], &[5.0]), DIFF_FULL_WRITE_PIVOT, end).unwrap();
        assert_well_formed(&c, 90);
        let c = allocate(&weights(&[], &[1.0, 1.0, 2.0]), START, end).unwrap();
        assert_eq!(c.as_slice(), &[45, 60, 90]);
    }

    #[test]
    fn empty_full_phase_emits_no_checkpoints() {
        let c = allocate(&weights(&[5.0], &[]), DIFF_FULL_WRITE_PIVOT, 100).unwrap();
        assert_eq!(c.len(), 1);
        assert_eq!(c.first(), 100);
    }

    #[test]
    fn zero_weight_phase_is_a_config_error() {
        let err = allocate(&weights(&[0.0, 0.0], &[1.0]), DIFF_FULL_WRITE_PIVOT, 100).unwrap_err();
        assert!(err.to_string().contains("zero weighted size"), "{err}");
        assert!(allocate(&weights(&[1.0], &[0.0]), DIFF_FULL_WRITE_PIVOT, 100).is_err());
    }

    #[test]
    fn no_steps_is_a_config_error() {
        assert!(allocate(&StepWeights::default(), START, 100).is_err());
    }

    #[test]
    fn end_below_pivot_rejected() {
        assert!(allocate(&weights(&[1.0], &[1.0]), DIFF_FULL_WRITE_PIVOT, 60).is_err());
        assert!(end_bound(71).is_err());
        assert_eq!(end_bound(0).unwrap(), 100);
    }
}
