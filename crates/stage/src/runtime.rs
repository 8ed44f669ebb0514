//! Dedicated render thread. The engine is built on that thread and never
//! leaves it; callers get a [`StageHandle`] and a notification receiver.
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Select, Sender};
use settings::StageSettings;
use tracing::{debug, info};

use crate::dispatcher::StageHandle;
use crate::engine::EngineFactory;
use crate::error::{ErrorCode, StageError};
use crate::notify::Notification;
use crate::queue::PumpReport;
use crate::render::RenderLoop;

/// Longest the render thread sleeps when frames are paused.
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Spaces frames at a fixed interval; `None` disables frame ticks so the
/// thread only wakes for commands.
#[derive(Debug, Clone)]
pub struct FramePacer {
    interval: Option<Duration>,
    last: Option<Instant>,
}

impl FramePacer {
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn ready_for_frame(&self, now: Instant) -> bool {
        match (self.interval, self.last) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(interval), Some(last)) => now.saturating_duration_since(last) >= interval,
        }
    }

    pub fn mark_rendered(&mut self, now: Instant) {
        self.last = Some(now);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let interval = self.interval?;
        Some(self.last.map_or_else(Instant::now, |last| last + interval))
    }

    /// How long to wait for work before the next frame is due.
    pub fn wait_time(&self, now: Instant) -> Duration {
        self.next_deadline()
            .map_or(IDLE_WAIT, |deadline| deadline.saturating_duration_since(now))
    }
}

enum Control {
    Shutdown,
}

type Ready = Result<(StageHandle, Receiver<Notification>), StageError>;

pub struct StageRuntime {
    handle: StageHandle,
    notifications: Receiver<Notification>,
    control: Sender<Control>,
    join_handle: Option<JoinHandle<Result<()>>>,
}

impl StageRuntime {
    /// Starts the render thread, builds the engine there through `factory`
    /// and waits until it is ready to accept commands.
    pub fn spawn(settings: StageSettings, factory: EngineFactory) -> Result<Self> {
        let (ready_tx, ready_rx) = bounded::<Ready>(1);
        let (control_tx, control_rx) = unbounded();
        let join_handle = thread::Builder::new()
            .name("stage-render".into())
            .spawn(move || run_render_thread(settings, factory, ready_tx, control_rx))
            .context("failed to spawn render thread")?;

        let (handle, notifications) = ready_rx
            .recv()
            .map_err(|err| anyhow!("render thread failed to initialise: {err}"))??;

        Ok(Self {
            handle,
            notifications,
            control: control_tx,
            join_handle: Some(join_handle),
        })
    }

    pub fn handle(&self) -> StageHandle {
        self.handle.clone()
    }

    pub fn notifications(&self) -> &Receiver<Notification> {
        &self.notifications
    }

    /// Stops the render thread after it has torn everything down.
    pub fn shutdown(mut self) -> Result<()> {
        if let Some(join_handle) = self.join_handle.take() {
            let _ = self.control.send(Control::Shutdown);
            join_handle
                .join()
                .map_err(|err| anyhow!("render thread panicked: {err:?}"))??;
        }
        Ok(())
    }
}

impl Drop for StageRuntime {
    fn drop(&mut self) {
        if let Some(join_handle) = self.join_handle.take() {
            let _ = self.control.send(Control::Shutdown);
            let _ = join_handle.join();
        }
    }
}

fn run_render_thread(
    settings: StageSettings,
    factory: EngineFactory,
    ready_tx: Sender<Ready>,
    control: Receiver<Control>,
) -> Result<()> {
    let engine = match factory() {
        Ok(engine) => engine,
        Err(err) => {
            let err = StageError::engine("engine construction", ErrorCode::GlInitError, err);
            let message = err.to_string();
            let _ = ready_tx.send(Err(err));
            return Err(anyhow!(message));
        }
    };

    let mut pacer = FramePacer::new(settings.frame_interval());
    let (mut render, handle, notifications) = RenderLoop::new(engine, settings);
    ready_tx
        .send(Ok((handle, notifications)))
        .map_err(|_| anyhow!("runtime owner went away during start-up"))?;
    info!("render thread running");

    loop {
        let wait = pacer.wait_time(Instant::now());
        let (control_index, ready) = {
            let mut select = Select::new();
            let control_index = select.recv(&control);
            select.recv(render.command_receiver());
            select.recv(render.surface_receiver());
            (control_index, select.ready_timeout(wait))
        };

        match ready {
            Ok(index) if index == control_index => match control.try_recv() {
                Ok(Control::Shutdown) => break,
                Err(err) if err.is_disconnected() => break,
                Err(_) => {}
            },
            Ok(_) | Err(_) => {}
        }

        render.drain_surface_events();
        let report = render.pump();
        if report != PumpReport::default() {
            debug!(
                executed = report.executed,
                stale = report.skipped_stale,
                failed = report.failed,
                "commands processed"
            );
        }

        let now = Instant::now();
        if pacer.ready_for_frame(now) {
            render.frame(now);
            pacer.mark_rendered(now);
        }
    }

    render.drain_surface_events();
    render.pump();
    render.destroy();
    info!("render thread stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;
    use crate::engine::{EngineError, RenderEngine};
    use crate::testing::{test_settings, write_model, EngineProbe, RecordingEngine};
    use crate::types::{LifecycleState, SurfaceRef};

    fn spawn(probe: &EngineProbe) -> StageRuntime {
        let engine_probe = probe.clone();
        let factory: EngineFactory = Box::new(move || {
            let engine: Box<dyn RenderEngine> = Box::new(RecordingEngine::new(engine_probe));
            Ok(engine)
        });
        StageRuntime::spawn(test_settings(), factory).expect("spawn runtime")
    }

    fn wait_for(
        notifications: &Receiver<Notification>,
        wanted: impl Fn(&Notification) -> bool,
    ) -> Notification {
        loop {
            let notification = notifications
                .recv_timeout(Duration::from_secs(5))
                .expect("notification in time");
            if wanted(&notification) {
                return notification;
            }
        }
    }

    #[test]
    fn pacer_spaces_frames() {
        let start = Instant::now();
        let mut pacer = FramePacer::new(Some(Duration::from_millis(10)));
        assert!(pacer.ready_for_frame(start));
        pacer.mark_rendered(start);
        assert!(!pacer.ready_for_frame(start + Duration::from_millis(5)));
        assert!(pacer.ready_for_frame(start + Duration::from_millis(10)));
        assert_eq!(
            pacer.wait_time(start + Duration::from_millis(4)),
            Duration::from_millis(6)
        );
    }

    #[test]
    fn paused_pacer_never_ticks() {
        let pacer = FramePacer::new(None);
        assert!(!pacer.ready_for_frame(Instant::now()));
        assert_eq!(pacer.next_deadline(), None);
        assert_eq!(pacer.wait_time(Instant::now()), IDLE_WAIT);
    }

    #[test]
    fn engine_is_only_touched_on_the_render_thread() {
        let temp = tempfile::tempdir().unwrap();
        let model = write_model(temp.path(), "haru");
        let probe = EngineProbe::default();
        let runtime = spawn(&probe);
        let handle = runtime.handle();

        let callers: Vec<_> = (0..3)
            .map(|worker| {
                let handle = handle.clone();
                let model = model.display().to_string();
                thread::spawn(move || {
                    if worker == 0 {
                        handle.surface_created().unwrap();
                        handle.start(SurfaceRef::new(7, 640, 480)).unwrap();
                        handle.load_model(&model).unwrap();
                    }
                    handle.set_scale(1.0 + worker as f32 / 10.0).unwrap();
                    handle.set_expression("e1").unwrap();
                })
            })
            .collect();
        for caller in callers {
            caller.join().unwrap();
        }

        wait_for(runtime.notifications(), |n| {
            matches!(n, Notification::ModelLoaded { .. })
        });
        handle.surface_lost().unwrap();
        handle.surface_created().unwrap();
        handle.start_motion("TapBody", 1).unwrap();
        runtime.shutdown().expect("clean shutdown");

        let log = probe.log();
        assert_eq!(log.threads.len(), 1);
        assert!(!log.threads.contains(&thread::current().id()));
        assert!(log.disposed);
        assert_eq!(log.textures_created.len(), log.textures_deleted.len() + 2);
        let released: HashSet<_> = log.textures_deleted.iter().collect();
        assert_eq!(released.len(), 2);
    }

    #[test]
    fn lifecycle_state_is_published_to_callers() {
        let probe = EngineProbe::default();
        let runtime = spawn(&probe);
        let handle = runtime.handle();
        assert_eq!(handle.lifecycle_state(), LifecycleState::Uninitialized);

        handle.surface_created().unwrap();
        handle.start(SurfaceRef::new(1, 320, 240)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.lifecycle_state() != LifecycleState::Ready {
            assert!(Instant::now() < deadline, "never became ready");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handle.generation().value(), 1);

        drop(runtime);
        assert!(probe.log().disposed);
        assert!(matches!(handle.set_scale(1.1), Err(StageError::Disconnected)));
    }

    #[test]
    fn engine_construction_failure_is_reported() {
        let factory: EngineFactory =
            Box::new(|| Err::<Box<dyn RenderEngine>, _>(EngineError::new("no display")));
        let result = StageRuntime::spawn(test_settings(), factory);
        let err = result.err().expect("spawn should fail");
        assert!(err.to_string().contains("no display"));
    }
}
