//! Preview refresh scheduling.
//!
//! A single task owns the refresh loop and awaits each conversion inline, so
//! two cycles can never overlap. Triggers that arrive while a conversion is
//! running are coalesced into one follow-up refresh that starts as soon as the
//! current one completes. The auto loop sleeps *after* each cycle instead of
//! ticking at a fixed rate, so a slow converter just stretches the period.

use super::tonemap::TonemapPipeline;
use crate::model::{Exposure, PreviewTarget, SessionEvent, TonemapOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub target: PreviewTarget,
    pub exposure: Exposure,
}

#[derive(Debug)]
enum SchedulerCommand {
    Refresh {
        selection: Selection,
        done: Option<oneshot::Sender<TonemapOutcome>>,
    },
    StartAuto(Duration),
    RenderFinished,
    Stop,
}

pub struct RefreshScheduler {
    cmd_tx: mpsc::UnboundedSender<SchedulerCommand>,
    handle: JoinHandle<()>,
}

/// A refresh that has been requested but not started yet.
struct Pending {
    selection: Selection,
    waiters: Vec<oneshot::Sender<TonemapOutcome>>,
}

struct Worker {
    pipeline: Arc<TonemapPipeline>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    finish_grace: Duration,
    selection: Selection,
    interval: Option<Duration>,
    next_tick: Option<Instant>,
    disable_at: Option<Instant>,
    finished: bool,
    pending: Option<Pending>,
}

impl RefreshScheduler {
    /// Spawn the scheduler task. Nothing runs until a trigger arrives or the
    /// auto loop is started.
    pub fn spawn(
        pipeline: Arc<TonemapPipeline>,
        selection: Selection,
        finish_grace: Duration,
        event_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            pipeline,
            event_tx,
            finish_grace,
            selection,
            interval: None,
            next_tick: None,
            disable_at: None,
            finished: false,
            pending: None,
        };
        let handle = tokio::spawn(worker.run(cmd_rx));
        Self { cmd_tx, handle }
    }

    /// Refresh `target` with `exposure` and make it the auto loop's selection.
    ///
    /// The returned receiver resolves when the refresh that covers this
    /// request has completed. It is dropped unresolved if the scheduler
    /// stops first.
    pub fn run_once(
        &self,
        target: PreviewTarget,
        exposure: Exposure,
    ) -> oneshot::Receiver<TonemapOutcome> {
        let (done, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(SchedulerCommand::Refresh {
            selection: Selection { target, exposure },
            done: Some(done),
        });
        rx
    }

    /// Refresh every `interval`, measured from the end of the previous cycle.
    pub fn start_auto_loop(&self, interval: Duration) {
        let _ = self.cmd_tx.send(SchedulerCommand::StartAuto(interval));
    }

    /// Keep auto-refreshing for the finish grace period, then stop for good.
    pub fn render_finished(&self) {
        let _ = self.cmd_tx.send(SchedulerCommand::RenderFinished);
    }

    /// Stop scheduling. Resolves once an in-flight conversion has completed.
    pub async fn stop(self) {
        let _ = self.cmd_tx.send(SchedulerCommand::Stop);
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "refresh scheduler task failed");
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => futures::future::pending().await,
    }
}

impl Worker {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<SchedulerCommand>) {
        loop {
            if let Some(pending) = self.pending.take() {
                self.refresh(pending).await;
                // Pick up whatever queued up while converting before sleeping.
                if self.drain(&mut cmd_rx) {
                    break;
                }
                continue;
            }

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let stop = match cmd {
                        Some(cmd) => self.handle(cmd),
                        None => true,
                    };
                    if stop {
                        break;
                    }
                }
                _ = sleep_until_opt(self.next_tick) => {
                    self.next_tick = None;
                    self.enqueue(self.selection, None);
                }
                _ = sleep_until_opt(self.disable_at) => {
                    tracing::info!("finish grace elapsed, auto refresh disabled");
                    self.disable_at = None;
                    self.interval = None;
                    self.next_tick = None;
                }
            }
        }
        tracing::debug!("refresh scheduler stopped");
    }

    /// Apply queued commands without blocking. Returns true on stop.
    fn drain(&mut self, cmd_rx: &mut mpsc::UnboundedReceiver<SchedulerCommand>) -> bool {
        loop {
            match cmd_rx.try_recv() {
                Ok(cmd) => {
                    if self.handle(cmd) {
                        return true;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => return false,
                Err(mpsc::error::TryRecvError::Disconnected) => return true,
            }
        }
    }

    /// Returns true on stop.
    fn handle(&mut self, cmd: SchedulerCommand) -> bool {
        match cmd {
            SchedulerCommand::Refresh { selection, done } => {
                self.selection = selection;
                self.enqueue(selection, done);
            }
            SchedulerCommand::StartAuto(interval) => {
                if self.finished {
                    tracing::debug!("render finished, ignoring auto refresh start");
                } else {
                    self.interval = Some(interval);
                    if self.next_tick.is_none() {
                        self.next_tick = Some(Instant::now() + interval);
                    }
                }
            }
            SchedulerCommand::RenderFinished => {
                if !self.finished {
                    self.finished = true;
                    self.disable_at = Some(Instant::now() + self.finish_grace);
                }
            }
            SchedulerCommand::Stop => {
                self.interval = None;
                self.pending = None;
                return true;
            }
        }
        false
    }

    /// Coalesce with any refresh already waiting; the newest selection wins.
    fn enqueue(&mut self, selection: Selection, done: Option<oneshot::Sender<TonemapOutcome>>) {
        let pending = self.pending.get_or_insert_with(|| Pending {
            selection,
            waiters: Vec::new(),
        });
        pending.selection = selection;
        pending.waiters.extend(done);
    }

    async fn refresh(&mut self, pending: Pending) {
        let Selection { target, exposure } = pending.selection;
        let outcome = self.pipeline.convert(target, exposure).await;
        let _ = self.event_tx.send(SessionEvent::PreviewUpdated {
            target,
            exposure,
            outcome: outcome.clone(),
        });
        for waiter in pending.waiters {
            let _ = waiter.send(outcome.clone());
        }
        // Sleep-after-completion: the next tick is measured from now.
        self.next_tick = self.interval.map(|i| Instant::now() + i);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlChannel;
    use crate::preview::tonemap::Converter;
    use std::fs;
    use std::path::PathBuf;

    /// Records start/end of every call so overlaps are visible.
    const SLOW_CONVERTER: &str = r#"
in="$1"
dir="$(dirname "$in")"
echo "start ${2:-auto}" >> "$dir/calls.log"
sleep 0.2
cp "$in" "${in%.pfm}.bmp"
echo "end" >> "$dir/calls.log"
"#;

    struct Fixture {
        _root: tempfile::TempDir,
        _tools: tempfile::TempDir,
        pipeline: Arc<TonemapPipeline>,
        event_rx: mpsc::UnboundedReceiver<SessionEvent>,
        scheduler: RefreshScheduler,
    }

    fn fixture(finish_grace: Duration) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let tools = tempfile::tempdir().unwrap();
        let script = tools.path().join("convert.sh");
        fs::write(&script, SLOW_CONVERTER).unwrap();
        let channel = Arc::new(ControlChannel::open(root.path()).unwrap());
        for target in PreviewTarget::ALL {
            fs::write(channel.frame_path(target), target.as_str()).unwrap();
        }
        let pipeline = Arc::new(TonemapPipeline::new(
            Converter {
                program: PathBuf::from("/bin/sh"),
                args: vec![script.to_string_lossy().into_owned()],
            },
            channel,
        ));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let scheduler = RefreshScheduler::spawn(
            pipeline.clone(),
            Selection {
                target: PreviewTarget::Combined,
                exposure: Exposure::Auto,
            },
            finish_grace,
            event_tx,
        );
        Fixture {
            _root: root,
            _tools: tools,
            pipeline,
            event_rx,
            scheduler,
        }
    }

    fn calls(p: &TonemapPipeline) -> Vec<String> {
        fs::read_to_string(p.channel().path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    fn assert_no_overlap(calls: &[String]) {
        let mut open = false;
        for c in calls {
            if c.starts_with("start") {
                assert!(!open, "overlapping conversions: {calls:?}");
                open = true;
            } else {
                open = false;
            }
        }
    }

    #[tokio::test]
    async fn run_once_converts_and_reports() {
        let mut fx = fixture(Duration::from_secs(1));
        let outcome = fx
            .scheduler
            .run_once(PreviewTarget::Direct, Exposure::Manual(4))
            .await
            .unwrap();
        let expected = fx.pipeline.channel().display_path(PreviewTarget::Direct);
        assert_eq!(outcome, TonemapOutcome::Converted(expected));
        match fx.event_rx.recv().await {
            Some(SessionEvent::PreviewUpdated {
                target, exposure, ..
            }) => {
                assert_eq!(target, PreviewTarget::Direct);
                assert_eq!(exposure, Exposure::Manual(4));
            }
            other => panic!("unexpected event {other:?}"),
        }
        fx.scheduler.stop().await;
    }

    #[tokio::test]
    async fn triggers_during_a_refresh_are_coalesced() {
        let fx = fixture(Duration::from_secs(1));
        let first = fx.scheduler.run_once(PreviewTarget::Combined, Exposure::Auto);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = fx.scheduler.run_once(PreviewTarget::Combined, Exposure::Manual(1));
        let third = fx.scheduler.run_once(PreviewTarget::Combined, Exposure::Manual(2));

        assert!(matches!(first.await.unwrap(), TonemapOutcome::Converted(_)));
        let (second, third) = (second.await.unwrap(), third.await.unwrap());
        assert_eq!(second, third);

        let calls = calls(&fx.pipeline);
        assert_eq!(calls, vec!["start auto", "end", "start 2", "end"]);
        fx.scheduler.stop().await;
    }

    #[tokio::test]
    async fn auto_loop_never_overlaps_slow_cycles() {
        let fx = fixture(Duration::from_secs(5));
        // Interval shorter than a single conversion.
        fx.scheduler.start_auto_loop(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(900)).await;
        let _ = fx.scheduler.run_once(PreviewTarget::Indirect, Exposure::Auto);
        tokio::time::sleep(Duration::from_millis(300)).await;
        fx.scheduler.stop().await;

        let calls = calls(&fx.pipeline);
        let starts = calls.iter().filter(|c| c.starts_with("start")).count();
        assert!(starts >= 3, "expected several cycles, got {calls:?}");
        assert_no_overlap(&calls);
        assert!(!fx.pipeline.is_in_progress(PreviewTarget::Combined));
        assert!(!fx.pipeline.is_in_progress(PreviewTarget::Indirect));
    }

    #[tokio::test]
    async fn auto_loop_stops_after_finish_grace() {
        let fx = fixture(Duration::from_millis(300));
        fx.scheduler.start_auto_loop(Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(100)).await;
        fx.scheduler.render_finished();
        tokio::time::sleep(Duration::from_millis(900)).await;

        let settled = calls(&fx.pipeline).len();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(calls(&fx.pipeline).len(), settled, "loop kept running");

        // Restarting the loop is refused, explicit refreshes still work.
        fx.scheduler.start_auto_loop(Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(calls(&fx.pipeline).len(), settled);
        let outcome = fx
            .scheduler
            .run_once(PreviewTarget::Combined, Exposure::Auto)
            .await
            .unwrap();
        assert!(matches!(outcome, TonemapOutcome::Converted(_)));
        fx.scheduler.stop().await;
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_conversion() {
        let fx = fixture(Duration::from_secs(1));
        let pending = fx.scheduler.run_once(PreviewTarget::Combined, Exposure::Auto);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.pipeline.is_in_progress(PreviewTarget::Combined));

        fx.scheduler.stop().await;
        assert!(!fx.pipeline.is_in_progress(PreviewTarget::Combined));
        assert_eq!(calls(&fx.pipeline), vec!["start auto", "end"]);
        assert!(matches!(pending.await, Ok(TonemapOutcome::Converted(_))));
    }
}
