//! Session lifecycle controller.
//!
//! Joins engine events, user commands and preview outcomes in one loop, keeps
//! the displayed progress monotonic, and tears the session down in order:
//! engine first, then the scheduler, then the control directory.

use super::session::Session;
use crate::engine::{self, EngineState};
use crate::model::{
    EngineEvent, Exposure, PreviewTarget, ProgressState, SessionEvent, SessionSummary,
    TonemapOutcome,
};
use crate::preview::{RefreshScheduler, Selection, TonemapPipeline};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{Duration, Instant};

/// Commands emitted by the front end.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum UiCommand {
    Show(PreviewTarget),
    Exposure(i32),
    AutoExposure,
    Refresh,
    SaveAs(PathBuf),
    Quit,
}

/// Mutable bookkeeping for one controller run.
struct RunState {
    progress: ProgressState,
    selection: Selection,
    exit: Option<(Option<i32>, Option<i32>)>,
    elapsed: Option<Duration>,
    converted: u64,
    failed: u64,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => futures::future::pending().await,
    }
}

/// Run the session until the user quits or the render is done.
pub(crate) async fn run_controller(
    session: &Session,
    event_tx: UnboundedSender<SessionEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<SessionSummary> {
    let cfg = session.config();
    let channel = session.channel().clone();

    if let Err(e) = channel.set_exposure(cfg.exposure) {
        tracing::warn!(error = %e, "failed to write initial exposure");
    }

    let (engine_tx, mut engine_rx) = mpsc::unbounded_channel::<EngineEvent>();
    let handle = engine::start(&session.engine_args(), &channel, engine_tx)?;
    let _ = event_tx.send(SessionEvent::Started {
        pid: handle.pid(),
        control_dir: channel.path().to_path_buf(),
    });

    let pipeline = Arc::new(TonemapPipeline::new(session.converter(), channel.clone()));
    let (preview_tx, mut preview_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let mut st = RunState {
        progress: ProgressState::default(),
        selection: Selection {
            target: cfg.preview,
            exposure: cfg.exposure,
        },
        exit: None,
        elapsed: None,
        converted: 0,
        failed: 0,
    };
    let scheduler = RefreshScheduler::spawn(pipeline, st.selection, cfg.finish_grace, preview_tx);
    if cfg.auto_refresh {
        scheduler.start_auto_loop(cfg.refresh_interval);
    }

    let mut engine_open = true;
    let mut quit_at: Option<Instant> = None;

    loop {
        tokio::select! {
            ev = engine_rx.recv(), if engine_open => {
                let Some(ev) = ev else {
                    engine_open = false;
                    continue;
                };
                match ev {
                    EngineEvent::IndirectProgress(r) => {
                        if st.progress.update_indirect(r) {
                            send_progress(&event_tx, &st.progress);
                        }
                    }
                    EngineEvent::DirectProgress(r) => {
                        if st.progress.update_direct(r) {
                            send_progress(&event_tx, &st.progress);
                        }
                    }
                    EngineEvent::RenderFinished => {
                        if st.progress.mark_finished() {
                            let _ = event_tx.send(SessionEvent::RenderFinished);
                            scheduler.render_finished();
                            let _ = scheduler.run_once(st.selection.target, st.selection.exposure);
                        }
                    }
                    EngineEvent::Exited { code, signal } => {
                        let elapsed = session.started().elapsed();
                        st.exit = Some((code, signal));
                        st.elapsed = Some(elapsed);
                        let _ = event_tx.send(SessionEvent::EngineExited {
                            code,
                            signal,
                            elapsed_ms: elapsed.as_millis() as u64,
                        });
                        if cfg.exit_when_done {
                            // Leave room for the last refreshes after a finished render.
                            let wait = if st.progress.finished { cfg.finish_grace } else { Duration::ZERO };
                            quit_at = Some(Instant::now() + wait);
                        }
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UiCommand::Quit) | None => break,
                    Some(cmd) => handle_command(cmd, &mut st, &scheduler, session, &event_tx).await,
                }
            }
            Some(ev) = preview_rx.recv() => {
                record_preview(&ev, &mut st);
                let _ = event_tx.send(ev);
            }
            _ = sleep_until_opt(quit_at) => break,
        }
    }

    // Teardown: engine, then scheduler (waits for an in-flight conversion),
    // then the control directory.
    if handle.is_running() {
        let _ = event_tx.send(SessionEvent::info("Stopping render engine…"));
    }
    let state = handle.shutdown(cfg.stop_grace).await;
    if st.exit.is_none() {
        if let EngineState::Exited { code, signal } = state {
            st.exit = Some((code, signal));
            st.elapsed = Some(session.started().elapsed());
        }
    }
    scheduler.stop().await;
    while let Ok(ev) = preview_rx.try_recv() {
        record_preview(&ev, &mut st);
        let _ = event_tx.send(ev);
    }
    let exposure = channel.read_exposure().unwrap_or(st.selection.exposure);
    session.close();

    let (exit_code, exit_signal) = st.exit.unwrap_or((None, None));
    Ok(SessionSummary {
        started_utc: session.started_utc().to_string(),
        config: cfg.clone(),
        control_dir: session.control_dir().to_path_buf(),
        progress: st.progress,
        exposure,
        exit_code,
        exit_signal,
        elapsed: st.elapsed,
        previews_converted: st.converted,
        previews_failed: st.failed,
    })
}

fn send_progress(event_tx: &UnboundedSender<SessionEvent>, progress: &ProgressState) {
    let _ = event_tx.send(SessionEvent::Progress {
        indirect: progress.indirect,
        direct: progress.direct,
    });
}

fn record_preview(ev: &SessionEvent, st: &mut RunState) {
    if let SessionEvent::PreviewUpdated { outcome, .. } = ev {
        match outcome {
            TonemapOutcome::Converted(_) => st.converted += 1,
            TonemapOutcome::Unavailable => st.failed += 1,
            TonemapOutcome::Skipped => {}
        }
    }
}

async fn handle_command(
    cmd: UiCommand,
    st: &mut RunState,
    scheduler: &RefreshScheduler,
    session: &Session,
    event_tx: &UnboundedSender<SessionEvent>,
) {
    let channel = session.channel();
    match cmd {
        UiCommand::Show(target) => st.selection.target = target,
        UiCommand::Exposure(gain) => {
            if let Err(e) = channel.write_exposure(gain) {
                let _ = event_tx.send(SessionEvent::info(format!("Failed to set exposure: {e}")));
            }
            st.selection.exposure = Exposure::Manual(gain);
        }
        UiCommand::AutoExposure => {
            if let Err(e) = channel.clear_exposure() {
                let _ = event_tx.send(SessionEvent::info(format!(
                    "Failed to enable auto-exposure: {e}"
                )));
            }
            st.selection.exposure = Exposure::Auto;
        }
        UiCommand::Refresh => {}
        UiCommand::SaveAs(dest) => {
            let src = channel.display_path(st.selection.target);
            let msg = match tokio::fs::copy(&src, &dest).await {
                Ok(_) => format!("Saved {} preview to {}", st.selection.target, dest.display()),
                Err(e) => format!("Save to {} failed: {e}", dest.display()),
            };
            let _ = event_tx.send(SessionEvent::info(msg));
            return;
        }
        UiCommand::Quit => return,
    }
    let _ = scheduler.run_once(st.selection.target, st.selection.exposure);
}
