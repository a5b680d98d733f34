//! Text summary builder for CLI output.
//!
//! Formats the end-of-session report printed in text mode.

use crate::model::SessionSummary;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Build a text summary from a finished session.
pub(crate) fn build_text_summary(summary: &SessionSummary) -> TextSummary {
    let mut lines = Vec::new();
    let cfg = &summary.config;

    lines.push(format!("Scene: {}", cfg.scene.display()));
    lines.push(format!(
        "Workers: indirect {} / direct {}",
        cfg.indirect_workers, cfg.direct_workers
    ));
    lines.push(format!("Started: {}", summary.started_utc));

    let status = if summary.progress.finished {
        "finished"
    } else {
        "incomplete"
    };
    lines.push(format!(
        "Progress: indirect {:.1}% direct {:.1}% ({status})",
        summary.progress.indirect * 100.0,
        summary.progress.direct * 100.0
    ));

    let elapsed = summary
        .elapsed
        .map(|d| humantime::format_duration(round_to_millis(d)).to_string())
        .unwrap_or_else(|| "-".into());
    let exit = match (summary.exit_code, summary.exit_signal) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(sig)) => format!("signal {sig}"),
        (None, None) => "unknown".into(),
    };
    lines.push(format!("Engine: {exit} after {elapsed}"));
    lines.push(format!("Exposure: {}", summary.exposure));
    lines.push(format!(
        "Previews: {} converted, {} failed",
        summary.previews_converted, summary.previews_failed
    ));

    TextSummary { lines }
}

fn round_to_millis(d: std::time::Duration) -> std::time::Duration {
    std::time::Duration::from_millis(d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Exposure, PreviewTarget, ProgressState, SessionConfig};
    use std::path::PathBuf;
    use std::time::Duration;

    fn summary() -> SessionSummary {
        SessionSummary {
            started_utc: "2026-10-17T09:00:00Z".into(),
            config: SessionConfig {
                engine: "pbrt".into(),
                scene: PathBuf::from("/scenes/veach-ajar/scene.pbrt"),
                indirect_workers: 16,
                direct_workers: 2,
                converter: "cpfm".into(),
                converter_args: Vec::new(),
                control_root: PathBuf::from("/run/user/1000"),
                refresh_interval: Duration::from_secs(5),
                finish_grace: Duration::from_secs(10),
                stop_grace: Duration::from_secs(3),
                auto_refresh: true,
                exit_when_done: true,
                preview: PreviewTarget::Combined,
                exposure: Exposure::Auto,
            },
            control_dir: PathBuf::from("/run/user/1000/iile-00ff"),
            progress: ProgressState {
                indirect: 1.0,
                direct: 0.5,
                finished: true,
            },
            exposure: Exposure::Manual(20),
            exit_code: Some(0),
            exit_signal: None,
            elapsed: Some(Duration::from_millis(83_250)),
            previews_converted: 12,
            previews_failed: 1,
        }
    }

    #[test]
    fn summarises_a_finished_session() {
        let lines = build_text_summary(&summary()).lines;
        assert_eq!(lines[0], "Scene: /scenes/veach-ajar/scene.pbrt");
        assert!(lines.contains(&"Progress: indirect 100.0% direct 50.0% (finished)".to_string()));
        assert!(lines.contains(&"Engine: exit code 0 after 1m 23s 250ms".to_string()));
        assert!(lines.contains(&"Exposure: 20".to_string()));
        assert!(lines.contains(&"Previews: 12 converted, 1 failed".to_string()));
    }

    #[test]
    fn reports_a_killed_engine() {
        let mut s = summary();
        s.exit_code = None;
        s.exit_signal = Some(9);
        s.elapsed = None;
        let lines = build_text_summary(&s).lines;
        assert!(lines.contains(&"Engine: signal 9 after -".to_string()));
    }
}
