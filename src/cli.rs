use crate::control;
use crate::engine::EngineArgs;
use crate::model::{Exposure, PreviewTarget, SessionConfig, SessionEvent, TonemapOutcome};
use crate::orchestrator::{self, Session, UiCommand};
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "iile-preview",
    version,
    about = "Run an IILE render and keep a tonemapped preview of its frames up to date"
)]
pub struct Cli {
    /// Scene file followed by the indirect and direct worker counts
    #[arg(value_name = "SCENE INDIRECT DIRECT")]
    pub render_args: Vec<String>,

    /// Render engine executable
    #[arg(long, default_value = "pbrt")]
    pub engine: PathBuf,

    /// Tonemap converter executable
    #[arg(long, default_value = "cpfm")]
    pub converter: PathBuf,

    /// Extra argument passed to the converter before the frame path (repeatable)
    #[arg(long = "converter-arg", allow_hyphen_values = true)]
    pub converter_args: Vec<String>,

    /// Directory under which the session control directory is created
    /// [default: $XDG_RUNTIME_DIR, or the system temp dir]
    #[arg(long)]
    pub control_root: Option<PathBuf>,

    /// Delay between the end of one preview refresh and the start of the next
    #[arg(long, default_value = "5s")]
    pub refresh_interval: humantime::Duration,

    /// How long previews keep refreshing after the render reports completion
    #[arg(long, default_value = "10s")]
    pub finish_grace: humantime::Duration,

    /// How long the engine gets to exit after SIGINT before it is killed
    #[arg(long, default_value = "3s")]
    pub stop_grace: humantime::Duration,

    /// Preview shown at startup (combined, indirect, direct)
    #[arg(long, default_value = "combined")]
    pub preview: PreviewTarget,

    /// Start with a manual exposure gain instead of auto-exposure
    #[arg(long, allow_hyphen_values = true)]
    pub exposure: Option<i32>,

    /// Only refresh the preview on request and when the render finishes
    #[arg(long)]
    pub no_auto_refresh: bool,

    /// Use --exit-when-done true or --exit-when-done false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub exit_when_done: bool,

    /// Print events and the final summary as JSON on stdout
    #[arg(long)]
    pub json: bool,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(long, short)]
    pub verbose: bool,
}

/// Build a validated `SessionConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> Result<SessionConfig> {
    let engine = EngineArgs::from_positional(args.engine.clone(), &args.render_args)?;
    Ok(SessionConfig {
        engine: engine.program,
        scene: engine.scene,
        indirect_workers: engine.indirect_workers,
        direct_workers: engine.direct_workers,
        converter: args.converter.clone(),
        converter_args: args.converter_args.clone(),
        control_root: args.control_root.clone().unwrap_or_else(control::default_root),
        refresh_interval: args.refresh_interval.into(),
        finish_grace: args.finish_grace.into(),
        stop_grace: args.stop_grace.into(),
        auto_refresh: !args.no_auto_refresh,
        exit_when_done: args.exit_when_done,
        preview: args.preview,
        exposure: args.exposure.map_or(Exposure::Auto, Exposure::Manual),
    })
}

pub async fn run(args: Cli) -> Result<()> {
    let cfg = build_config(&args)?;
    let session = Session::open(cfg).context("failed to prepare session")?;

    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    let _stdin = orchestrator::spawn_stdin_reader(cmd_tx.clone(), !args.exit_when_done);
    let ctrl_c = tokio::spawn({
        let cmd_tx = cmd_tx.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = cmd_tx.send(UiCommand::Quit);
            }
        }
    });
    drop(cmd_tx);

    if !args.json {
        let _ = out_tx.send(OutputLine::Stderr(orchestrator::HELP.to_string()));
    }

    let json = args.json;
    let printer = tokio::spawn({
        let out_tx = out_tx.clone();
        async move {
            while let Some(ev) = evt_rx.recv().await {
                let line = if json {
                    match serde_json::to_string(&ev) {
                        Ok(s) => OutputLine::Stdout(s),
                        Err(e) => OutputLine::Stderr(format!("failed to encode event: {e}")),
                    }
                } else {
                    OutputLine::Stderr(render_event(&ev))
                };
                let _ = out_tx.send(line);
            }
        }
    });

    let result = orchestrator::run_controller(&session, evt_tx, cmd_rx).await;
    ctrl_c.abort();
    // The controller dropped its event sender; let the printer drain.
    let _ = printer.await;
    drop(session);

    let summary = result.context("render session failed")?;
    if json {
        let out = serde_json::to_string_pretty(&summary)?;
        let _ = out_tx.send(OutputLine::Stdout(out));
    } else {
        for line in crate::text_summary::build_text_summary(&summary).lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }
    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}

/// One human-readable line per session event.
fn render_event(ev: &SessionEvent) -> String {
    match ev {
        SessionEvent::Started { pid, control_dir } => match pid {
            Some(pid) => format!(
                "Render engine started (pid {pid}), control dir {}",
                control_dir.display()
            ),
            None => format!("Render engine started, control dir {}", control_dir.display()),
        },
        SessionEvent::Progress { indirect, direct } => format!(
            "Indirect {:5.1}%  Direct {:5.1}%",
            indirect * 100.0,
            direct * 100.0
        ),
        SessionEvent::RenderFinished => "Render finished".to_string(),
        SessionEvent::EngineExited {
            code,
            signal,
            elapsed_ms,
        } => {
            let secs = *elapsed_ms as f64 / 1000.0;
            match (code, signal) {
                (Some(code), _) => format!("Completed in [{secs}] seconds (exit code {code})"),
                (None, Some(sig)) => format!("Render engine killed by signal {sig} after [{secs}] seconds"),
                (None, None) => format!("Render engine ended after [{secs}] seconds"),
            }
        }
        SessionEvent::PreviewUpdated {
            target,
            exposure,
            outcome,
        } => match outcome {
            TonemapOutcome::Converted(path) => {
                format!("Preview {target} (exposure {exposure}): {}", path.display())
            }
            TonemapOutcome::Skipped => format!("Preview {target}: conversion already running"),
            TonemapOutcome::Unavailable => format!("Preview {target}: unavailable"),
        },
        SessionEvent::Info { message } => message.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("iile-preview").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn builds_config_from_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let scene = dir.path().join("scene.pbrt");
        std::fs::write(&scene, "WorldBegin\n").unwrap();
        let scene_arg = scene.to_string_lossy().into_owned();

        let args = parse(&[
            "--converter",
            "python3",
            "--converter-arg",
            "tools/pfm_tonemap.py",
            "--exposure",
            "-2",
            "--refresh-interval",
            "750ms",
            "--preview",
            "indirect",
            "--exit-when-done",
            "false",
            &scene_arg,
            "16",
            "2",
        ]);
        let cfg = build_config(&args).unwrap();
        assert_eq!(cfg.scene, scene);
        assert_eq!(cfg.engine, PathBuf::from("pbrt"));
        assert_eq!(cfg.indirect_workers, 16);
        assert_eq!(cfg.direct_workers, 2);
        assert_eq!(cfg.converter_args, vec!["tools/pfm_tonemap.py"]);
        assert_eq!(cfg.exposure, Exposure::Manual(-2));
        assert_eq!(cfg.refresh_interval, Duration::from_millis(750));
        assert_eq!(cfg.finish_grace, Duration::from_secs(10));
        assert_eq!(cfg.preview, PreviewTarget::Indirect);
        assert!(cfg.auto_refresh);
        assert!(!cfg.exit_when_done);
    }

    #[test]
    fn missing_positionals_are_a_configuration_error() {
        let args = parse(&["scene.pbrt", "16"]);
        let err = build_config(&args).unwrap_err();
        let err = err
            .downcast_ref::<crate::error::SessionError>()
            .expect("configuration error");
        assert!(matches!(err, crate::error::SessionError::Configuration(_)));
    }

    #[test]
    fn renders_events_for_humans() {
        assert_eq!(
            render_event(&SessionEvent::Progress {
                indirect: 0.5,
                direct: 0.25
            }),
            "Indirect  50.0%  Direct  25.0%"
        );
        assert_eq!(
            render_event(&SessionEvent::EngineExited {
                code: Some(0),
                signal: None,
                elapsed_ms: 1500
            }),
            "Completed in [1.5] seconds (exit code 0)"
        );
    }
}
