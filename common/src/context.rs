// The host-injected process globals a running job sees: JOBID, SLICES and
// the current phase. The Python original reads these off module-level
// globals (`g.JOBID`, `g.SLICES`, `g.running`); here they are passed
// explicitly, per the Design Notes in SPEC_FULL.md.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// The phase a job is currently executing, as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Prepare,
    Analysis,
    Synthesis,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Prepare => "prepare",
            Phase::Analysis => "analysis",
            Phase::Synthesis => "synthesis",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prepare" => Ok(Phase::Prepare),
            "analysis" => Ok(Phase::Analysis),
            "synthesis" => Ok(Phase::Synthesis),
            other => Err(format!("unknown job phase: {other}")),
        }
    }
}

/// Explicit stand-in for the process globals `JOBID`/`SLICES`/`running`.
///
/// `root` is the workspace storage root every job directory lives under;
/// the Python original resolves this through `WORKDIR`/`workspace` lookups,
/// here it is passed down explicitly alongside the rest of the context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub jobid: String,
    pub slices: usize,
    pub phase: Phase,
    pub root: PathBuf,
}

impl JobContext {
    pub fn new(jobid: impl Into<String>, slices: usize, phase: Phase, root: impl Into<PathBuf>) -> Self {
        Self {
            jobid: jobid.into(),
            slices,
            phase,
            root: root.into(),
        }
    }

    /// The on-disk directory this job's files live under: `<root>/<jobid>`.
    pub fn job_dir(&self) -> PathBuf {
        self.root.join(&self.jobid)
    }

    /// Resolve a path under a (possibly different) job's directory.
    pub fn resolve(&self, jobid: &str) -> PathBuf {
        self.root.join(jobid)
    }
}

/// Resolve `<root>/<jobid>` without needing a full `JobContext`, used by
/// dataset loading where only a jobid string is known.
pub fn resolve_jobid_path(root: &Path, jobid: &str) -> PathBuf {
    root.join(jobid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_display_and_from_str() {
        for phase in [Phase::Prepare, Phase::Analysis, Phase::Synthesis] {
            let s = phase.to_string();
            assert_eq!(s.parse::<Phase>().unwrap(), phase);
        }
    }

    #[test]
    fn unknown_phase_is_rejected() {
        assert!("teardown".parse::<Phase>().is_err());
    }
}
