use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub engine: PathBuf,
    pub scene: PathBuf,
    pub indirect_workers: u32,
    pub direct_workers: u32,
    pub converter: PathBuf,
    #[serde(default)]
    pub converter_args: Vec<String>,
    pub control_root: PathBuf,
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub finish_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,
    pub auto_refresh: bool,
    pub exit_when_done: bool,
    pub preview: PreviewTarget,
    pub exposure: Exposure,
}

/// Named frame buffers the engine writes into the control directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewTarget {
    Combined,
    Indirect,
    Direct,
}

impl PreviewTarget {
    pub const ALL: [PreviewTarget; 3] = [
        PreviewTarget::Combined,
        PreviewTarget::Indirect,
        PreviewTarget::Direct,
    ];

    /// File stem shared by the raw frame and its display image.
    pub fn file_stem(self) -> &'static str {
        match self {
            PreviewTarget::Combined => "out_combined",
            PreviewTarget::Indirect => "out_indirect",
            PreviewTarget::Direct => "out_direct",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PreviewTarget::Combined => "combined",
            PreviewTarget::Indirect => "indirect",
            PreviewTarget::Direct => "direct",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            PreviewTarget::Combined => 0,
            PreviewTarget::Indirect => 1,
            PreviewTarget::Direct => 2,
        }
    }
}

impl fmt::Display for PreviewTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PreviewTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PreviewTarget::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown preview '{s}' (expected combined, indirect or direct)"))
    }
}

/// Exposure setting shared by the converter and the engine's gain sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exposure {
    #[default]
    Auto,
    Manual(i32),
}

impl Exposure {
    /// Converter argument, `None` for auto-exposure.
    pub fn as_arg(self) -> Option<String> {
        match self {
            Exposure::Auto => None,
            Exposure::Manual(gain) => Some(gain.to_string()),
        }
    }
}

impl fmt::Display for Exposure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exposure::Auto => f.write_str("auto"),
            Exposure::Manual(gain) => write!(f, "{gain}"),
        }
    }
}

/// Events published by the engine supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    IndirectProgress(f64),
    DirectProgress(f64),
    RenderFinished,
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Render progress as shown to the user.
///
/// Ratios only ever move forward: a stale or duplicate report never lowers
/// what has already been displayed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    pub indirect: f64,
    pub direct: f64,
    pub finished: bool,
}

impl ProgressState {
    /// Returns true when the stored ratio rose.
    pub fn update_indirect(&mut self, ratio: f64) -> bool {
        Self::raise(&mut self.indirect, ratio)
    }

    /// Returns true when the stored ratio rose.
    pub fn update_direct(&mut self, ratio: f64) -> bool {
        Self::raise(&mut self.direct, ratio)
    }

    pub fn mark_finished(&mut self) -> bool {
        !std::mem::replace(&mut self.finished, true)
    }

    fn raise(slot: &mut f64, ratio: f64) -> bool {
        if !ratio.is_finite() {
            return false;
        }
        let ratio = ratio.clamp(0.0, 1.0);
        if ratio > *slot {
            *slot = ratio;
            true
        } else {
            false
        }
    }
}

/// Result of one tonemap request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TonemapOutcome {
    /// Display image refreshed at this path.
    Converted(PathBuf),
    /// Another conversion for the same target was already running.
    Skipped,
    /// Conversion failed; the previous image (if any) is left in place.
    Unavailable,
}

/// Events emitted by the session controller for presentation layers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Started {
        pid: Option<u32>,
        control_dir: PathBuf,
    },
    Progress {
        indirect: f64,
        direct: f64,
    },
    RenderFinished,
    EngineExited {
        code: Option<i32>,
        signal: Option<i32>,
        elapsed_ms: u64,
    },
    PreviewUpdated {
        target: PreviewTarget,
        exposure: Exposure,
        outcome: TonemapOutcome,
    },
    Info {
        message: String,
    },
}

impl SessionEvent {
    pub fn info(message: impl Into<String>) -> Self {
        SessionEvent::Info {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub started_utc: String,
    pub config: SessionConfig,
    pub control_dir: PathBuf,
    pub progress: ProgressState,
    /// Exposure left in the control directory for the engine.
    pub exposure: Exposure,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Option<Duration>,
    pub previews_converted: u64,
    pub previews_failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_never_decreases() {
        let mut p = ProgressState::default();
        let reports = [0.1, 0.05, 0.3, 0.3, 0.2, 0.6, 0.0, 0.9, 0.4];
        let mut shown = Vec::new();
        for r in reports {
            p.update_indirect(r);
            shown.push(p.indirect);
        }
        assert!(shown.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(p.indirect, 0.9);
        assert_eq!(p.direct, 0.0);
    }

    #[test]
    fn progress_ignores_non_finite_and_clamps() {
        let mut p = ProgressState::default();
        assert!(!p.update_direct(f64::NAN));
        assert!(p.update_direct(1.7));
        assert_eq!(p.direct, 1.0);
        assert!(!p.update_direct(f64::INFINITY));
    }

    #[test]
    fn finish_is_reported_once() {
        let mut p = ProgressState::default();
        assert!(p.mark_finished());
        assert!(!p.mark_finished());
        assert!(p.finished);
    }

    #[test]
    fn preview_target_parses_case_insensitively() {
        assert_eq!("Indirect".parse::<PreviewTarget>(), Ok(PreviewTarget::Indirect));
        assert_eq!(" direct ".parse::<PreviewTarget>(), Ok(PreviewTarget::Direct));
        assert!("normals".parse::<PreviewTarget>().is_err());
        assert_eq!(PreviewTarget::Combined.file_stem(), "out_combined");
    }

    #[test]
    fn session_events_serialize_as_tagged_json() {
        let ev = SessionEvent::PreviewUpdated {
            target: PreviewTarget::Direct,
            exposure: Exposure::Manual(20),
            outcome: TonemapOutcome::Skipped,
        };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            serde_json::json!({
                "event": "preview_updated",
                "target": "direct",
                "exposure": { "manual": 20 },
                "outcome": "Skipped",
            })
        );
        assert_eq!(
            serde_json::to_value(SessionEvent::RenderFinished).unwrap(),
            serde_json::json!({ "event": "render_finished" })
        );
    }

    #[test]
    fn exposure_argument() {
        assert_eq!(Exposure::Auto.as_arg(), None);
        assert_eq!(Exposure::Manual(-3).as_arg().as_deref(), Some("-3"));
    }
}
