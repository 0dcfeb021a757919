//! The per-frame protocol.
//!
//! Every call to [`FrameLoop::run_frame`] performs, strictly in order:
//!
//! 1. drain the debug channel and the event queue (state changes land here)
//! 2. wait for the runtime's pacing clock (the one intentional block)
//! 3. begin the frame
//! 4. when renderable: sync actions, locate views, and per view
//!    acquire -> wait -> render -> blit -> release
//! 5. assemble at most one projection layer
//! 6. end the frame, always, with whatever layers exist
//!
//! A fatal error in step 4 is held until step 6 has run so frame pacing is
//! never left with an open begin.

use std::time::Instant;

use anyhow::Context;
use tracing::{debug, trace, warn};

use super::actions::ActionRegistry;
use super::frame_timing::{FramePhases, FrameTiming};
use super::negotiate::DebugChannel;
use super::render::{CameraState, EyeView, SceneGraph, SwapchainTarget, ViewRenderer};
use super::runtime::{
    CompositionLayer, ProjectionLayer, ProjectionView, Rect2D, SubImage, SwapchainImageGuard,
    XrRuntime,
};
use super::session::{ExitReason, SessionController};
use super::swapchain::SwapchainManager;
use super::types::{BlendMode, FrameState, Hand};

/// The live per-session components the frame loop drives.
pub struct ActiveSession {
    pub debug: DebugChannel,
    pub session: SessionController,
    pub actions: ActionRegistry,
    pub swapchains: SwapchainManager,
}

/// What one frame did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Session not begun (or already ended); no frame calls were made.
    NotRunning,
    /// Wait/begin/end ran but nothing was rendered.
    Skipped,
    /// `views` views were submitted in one projection layer.
    Rendered { views: usize },
    /// The session reached a terminal state; the host should shut down.
    Exit(ExitReason),
}

/// Per-frame scratch state, reset at the start of every frame.
#[derive(Debug, Default)]
pub struct FrameContext {
    pub frame_state: Option<FrameState>,
    /// Camera as it was before the first eye overwrote it.
    pub saved_camera: Option<CameraState>,
    pub layer_views: Vec<ProjectionView>,
    pub dropped_views: usize,
}

impl FrameContext {
    fn reset(&mut self) {
        self.frame_state = None;
        self.saved_camera = None;
        self.layer_views.clear();
        self.dropped_views = 0;
    }
}

pub struct FrameLoop {
    context: FrameContext,
    timing: FrameTiming,
    frames: u64,
    near_z: f32,
    far_z: f32,
}

impl FrameLoop {
    pub fn new(near_z: f32, far_z: f32) -> Self {
        Self {
            context: FrameContext::default(),
            timing: FrameTiming::default(),
            frames: 0,
            near_z,
            far_z,
        }
    }

    pub fn timing(&self) -> &FrameTiming {
        &self.timing
    }

    /// Frames that completed the wait/begin/end protocol.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Scratch state of the most recent frame.
    pub fn context(&self) -> &FrameContext {
        &self.context
    }

    /// Run one frame of the protocol.
    pub fn run_frame<R, V, S>(
        &mut self,
        runtime: &mut R,
        active: &mut ActiveSession,
        renderer: &mut V,
        scene: &mut S,
    ) -> anyhow::Result<FrameOutcome>
    where
        R: XrRuntime + ?Sized,
        V: ViewRenderer + ?Sized,
        S: SceneGraph + ?Sized,
    {
        self.context.reset();

        active.debug.drain();
        let events = active.session.drain_events(runtime)?;
        if events.profile_refresh {
            active
                .actions
                .refresh_profiles(runtime, active.session.session());
        }
        if let Some(reason) = active.session.exit_reason() {
            debug!("VR: frame skipped, session {}", reason.as_str());
            return Ok(FrameOutcome::Exit(reason));
        }
        if !active.session.is_running() {
            trace!("VR: session not running ({})", active.session.state().as_str());
            return Ok(FrameOutcome::NotRunning);
        }

        let session = active.session.session();
        let wait_start = Instant::now();
        let frame_state = runtime
            .wait_frame(session)
            .context("VR: failed to wait for frame")?;
        let wait = wait_start.elapsed();
        self.context.frame_state = Some(frame_state);
        self.timing
            .set_display_period_ns(frame_state.predicted_display_period_ns);

        let render_start = Instant::now();
        runtime
            .begin_frame(session)
            .context("VR: failed to begin frame")?;

        let render_result = if active.session.is_renderable() && frame_state.should_render {
            self.render_views(runtime, active, renderer, scene, &frame_state)
        } else {
            Ok(())
        };
        let render = render_start.elapsed();

        let blend_mode = active.swapchains.blend_mode();
        let layers: Vec<CompositionLayer> = if self.context.layer_views.is_empty() {
            Vec::new()
        } else {
            vec![CompositionLayer::Projection(ProjectionLayer {
                space: active.session.reference_space(),
                views: self.context.layer_views.clone(),
                blend_texture_source_alpha: blend_mode == BlendMode::AlphaBlend,
            })]
        };

        let submit_start = Instant::now();
        let end_result = runtime
            .end_frame(
                session,
                frame_state.predicted_display_time,
                blend_mode,
                &layers,
            )
            .context("VR: failed to end frame");
        let submit = submit_start.elapsed();

        render_result?;
        end_result?;

        self.frames += 1;
        self.timing.record_frame(FramePhases {
            wait,
            render,
            submit,
        });

        let views = self.context.layer_views.len();
        Ok(if views > 0 {
            FrameOutcome::Rendered { views }
        } else {
            FrameOutcome::Skipped
        })
    }

    /// Sync input, then render every view. The scene camera is restored
    /// afterwards on every path.
    fn render_views<R, V, S>(
        &mut self,
        runtime: &mut R,
        active: &mut ActiveSession,
        renderer: &mut V,
        scene: &mut S,
        frame_state: &FrameState,
    ) -> anyhow::Result<()>
    where
        R: XrRuntime + ?Sized,
        V: ViewRenderer + ?Sized,
        S: SceneGraph + ?Sized,
    {
        let session = active.session.session();
        let reference = active.session.reference_space();
        let time = frame_state.predicted_display_time;

        active.actions.sync(runtime, session, reference, time)?;
        for hand in Hand::BOTH {
            scene.set_controller(hand, active.actions.snapshot(hand));
        }

        let views = runtime
            .locate_views(
                session,
                active.swapchains.view_configuration(),
                time,
                reference,
            )
            .context("VR: failed to locate views")?;
        if views.len() != active.swapchains.view_count() {
            warn!(
                "VR: runtime located {} views, {} swapchains exist",
                views.len(),
                active.swapchains.view_count()
            );
        }

        let saved = scene.camera();
        self.context.saved_camera = Some(saved);
        let result = self.render_each(runtime, active, renderer, scene, &views);
        scene.set_camera(saved);
        result
    }

    fn render_each<R, V, S>(
        &mut self,
        runtime: &mut R,
        active: &ActiveSession,
        renderer: &mut V,
        scene: &mut S,
        views: &[super::types::View],
    ) -> anyhow::Result<()>
    where
        R: XrRuntime + ?Sized,
        V: ViewRenderer + ?Sized,
        S: SceneGraph + ?Sized,
    {
        for (i, (view, sc)) in views
            .iter()
            .zip(active.swapchains.swapchains())
            .enumerate()
        {
            let guard = SwapchainImageGuard::acquire(runtime, sc.swapchain)
                .with_context(|| format!("VR: failed to acquire swapchain image for view {}", i))?;
            let image_index = guard.index();

            let eye = EyeView::new(
                i,
                view.pose,
                view.fov,
                sc.width,
                sc.height,
                self.near_z,
                self.far_z,
            );
            scene.set_camera(CameraState {
                pose: view.pose,
                projection: eye.projection,
            });

            let drawn = match sc.images.get(image_index as usize) {
                Some(image) => {
                    let target = SwapchainTarget {
                        view_index: i,
                        image_index,
                        image: *image,
                        width: sc.width,
                        height: sc.height,
                    };
                    renderer
                        .render_view(&eye)
                        .and_then(|rendered| renderer.blit(&rendered, &target))
                }
                None => Err(anyhow::anyhow!(
                    "image index {} outside pool of {}",
                    image_index,
                    sc.images.len()
                )),
            };

            guard
                .release()
                .with_context(|| format!("VR: failed to release swapchain image for view {}", i))?;

            match drawn {
                Ok(()) => self.context.layer_views.push(ProjectionView {
                    pose: view.pose,
                    fov: view.fov,
                    sub_image: SubImage {
                        swapchain: sc.swapchain,
                        rect: Rect2D {
                            x: 0,
                            y: 0,
                            width: sc.width as i32,
                            height: sc.height as i32,
                        },
                        array_index: 0,
                    },
                }),
                Err(e) => {
                    warn!("VR: view {} dropped from frame: {:#}", i, e);
                    self.context.dropped_views += 1;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::XrConfig;
    use crate::xr::error::RuntimeError;
    use crate::xr::negotiate::{negotiate, resolve_system};
    use crate::xr::render::{HeadlessRenderer, RenderedImage};
    use crate::xr::rig::XrRig;
    use crate::xr::runtime::{GraphicsBinding, HandleScope, SwapchainId};
    use crate::xr::sim::{SimCall, SimConfig, SimRuntime};
    use crate::xr::swapchain::ViewSetup;
    use crate::xr::types::{SessionState, ViewConfigurationType};
    use std::time::Duration;

    /// Renderer whose render or blit step fails for chosen views.
    #[derive(Default)]
    struct FlakyRenderer {
        fail_render: Vec<usize>,
        fail_blit: Vec<usize>,
        cameras: Vec<usize>,
    }

    impl ViewRenderer for FlakyRenderer {
        fn render_view(&mut self, eye: &EyeView) -> anyhow::Result<RenderedImage> {
            self.cameras.push(eye.index);
            if self.fail_render.contains(&eye.index) {
                anyhow::bail!("render failed");
            }
            Ok(RenderedImage {
                framebuffer: 1,
                width: eye.width,
                height: eye.height,
            })
        }

        fn blit(&mut self, _image: &RenderedImage, target: &SwapchainTarget) -> anyhow::Result<()> {
            if self.fail_blit.contains(&target.view_index) {
                anyhow::bail!("blit failed");
            }
            Ok(())
        }
    }

    struct Harness {
        sim: SimRuntime,
        _scope: HandleScope,
        active: ActiveSession,
        frame_loop: FrameLoop,
        scene: XrRig,
    }

    fn harness(sim_config: SimConfig) -> Harness {
        let config = XrConfig::default();
        let binding = GraphicsBinding::Headless;
        let mut sim = SimRuntime::new(sim_config);
        let mut scope = HandleScope::new();
        let negotiated = negotiate(&mut sim, &mut scope, &config, &binding).unwrap();
        resolve_system(&mut sim, config.form_factor).unwrap();
        let mut actions =
            ActionRegistry::create(&mut sim, &mut scope, config.haptics).unwrap();
        actions
            .suggest_bindings(&mut sim, &config.interaction_profiles)
            .unwrap();
        let setup = ViewSetup::resolve(&mut sim, &config).unwrap();
        let session = SessionController::create(
            &mut sim,
            &mut scope,
            &binding,
            setup.view_configuration,
            config.reference_space,
        )
        .unwrap();
        actions.attach(&mut sim, &mut scope, session.session()).unwrap();
        let swapchains =
            SwapchainManager::create(&mut sim, &mut scope, session.session(), setup, &binding)
                .unwrap();
        Harness {
            sim,
            _scope: scope,
            active: ActiveSession {
                debug: negotiated.debug,
                session,
                actions,
                swapchains,
            },
            frame_loop: FrameLoop::new(config.near_z, config.far_z),
            scene: XrRig::new(),
        }
    }

    impl Harness {
        fn frame(&mut self, renderer: &mut dyn ViewRenderer) -> anyhow::Result<FrameOutcome> {
            self.frame_loop
                .run_frame(&mut self.sim, &mut self.active, renderer, &mut self.scene)
        }

        fn swapchain_ids(&self) -> Vec<SwapchainId> {
            self.active
                .swapchains
                .swapchains()
                .iter()
                .map(|s| s.swapchain)
                .collect()
        }
    }

    fn count(sim: &SimRuntime, f: impl Fn(&SimCall) -> bool) -> usize {
        sim.count_calls(f)
    }

    #[test]
    fn test_first_frame_renders_both_eyes() {
        let mut h = harness(SimConfig::default());
        let mut renderer = HeadlessRenderer::default();
        let outcome = h.frame(&mut renderer).unwrap();
        assert_eq!(outcome, FrameOutcome::Rendered { views: 2 });
        assert_eq!(renderer.rendered, 2);
        assert_eq!(h.sim.frames_ended(), 1);
        match &h.sim.last_layers()[0] {
            CompositionLayer::Projection(p) => {
                assert_eq!(p.views.len(), 2);
                assert_eq!(p.space, h.active.session.reference_space());
            }
        }
    }

    #[test]
    fn test_protocol_order() {
        let mut h = harness(SimConfig::default());
        h.frame(&mut HeadlessRenderer::default()).unwrap();
        let frame_calls: Vec<SimCall> = h
            .sim
            .calls()
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    SimCall::WaitFrame
                        | SimCall::BeginFrame
                        | SimCall::SyncActions
                        | SimCall::LocateViews
                        | SimCall::AcquireImage(_)
                        | SimCall::WaitImage(_)
                        | SimCall::ReleaseImage(_)
                        | SimCall::EndFrame { .. }
                )
            })
            .cloned()
            .collect();
        let ids = h.swapchain_ids();
        assert_eq!(
            frame_calls,
            vec![
                SimCall::WaitFrame,
                SimCall::BeginFrame,
                SimCall::SyncActions,
                SimCall::LocateViews,
                SimCall::AcquireImage(ids[0]),
                SimCall::WaitImage(ids[0]),
                SimCall::ReleaseImage(ids[0]),
                SimCall::AcquireImage(ids[1]),
                SimCall::WaitImage(ids[1]),
                SimCall::ReleaseImage(ids[1]),
                SimCall::EndFrame {
                    layer_count: 1,
                    view_count: 2
                },
            ]
        );
    }

    #[test]
    fn test_not_running_makes_no_frame_calls() {
        let mut h = harness(SimConfig {
            auto_lifecycle: false,
            ..SimConfig::default()
        });
        let outcome = h.frame(&mut HeadlessRenderer::default()).unwrap();
        assert_eq!(outcome, FrameOutcome::NotRunning);
        assert_eq!(count(&h.sim, |c| *c == SimCall::WaitFrame), 0);
    }

    #[test]
    fn test_non_renderable_state_submits_zero_layers() {
        let mut h = harness(SimConfig {
            auto_lifecycle: false,
            ..SimConfig::default()
        });
        h.sim.push_state(SessionState::Idle);
        h.sim.push_state(SessionState::Ready);
        let mut renderer = HeadlessRenderer::default();
        let outcome = h.frame(&mut renderer).unwrap();
        assert_eq!(outcome, FrameOutcome::Skipped);
        assert_eq!(count(&h.sim, |c| *c == SimCall::BeginFrame), 1);
        assert_eq!(
            count(&h.sim, |c| *c
                == SimCall::EndFrame {
                    layer_count: 0,
                    view_count: 0
                }),
            1
        );
        assert_eq!(count(&h.sim, |c| *c == SimCall::SyncActions), 0);
        assert_eq!(renderer.rendered, 0);
    }

    #[test]
    fn test_synchronized_without_should_render_skips() {
        let mut h = harness(SimConfig {
            auto_lifecycle: false,
            ..SimConfig::default()
        });
        h.sim.push_state(SessionState::Idle);
        h.sim.push_state(SessionState::Ready);
        h.sim.push_state(SessionState::Synchronized);
        let outcome = h.frame(&mut HeadlessRenderer::default()).unwrap();
        assert!(h.active.session.is_renderable());
        assert_eq!(outcome, FrameOutcome::Skipped);
        assert_eq!(h.sim.frames_ended(), 1);
    }

    #[test]
    fn test_render_failure_still_releases() {
        let mut h = harness(SimConfig::default());
        let mut renderer = FlakyRenderer {
            fail_render: vec![0],
            ..FlakyRenderer::default()
        };
        let outcome = h.frame(&mut renderer).unwrap();
        assert_eq!(outcome, FrameOutcome::Rendered { views: 1 });
        assert_eq!(h.frame_loop.context().dropped_views, 1);
        assert_eq!(count(&h.sim, |c| matches!(c, SimCall::ReleaseImage(_))), 2);
        for id in h.swapchain_ids() {
            assert!(!h.sim.has_outstanding_image(id));
        }
    }

    #[test]
    fn test_all_blits_failing_submits_zero_layers() {
        let mut h = harness(SimConfig::default());
        let mut renderer = FlakyRenderer {
            fail_blit: vec![0, 1],
            ..FlakyRenderer::default()
        };
        let outcome = h.frame(&mut renderer).unwrap();
        assert_eq!(outcome, FrameOutcome::Skipped);
        assert_eq!(count(&h.sim, |c| matches!(c, SimCall::ReleaseImage(_))), 2);
        assert!(h.sim.last_layers().is_empty());
    }

    #[test]
    fn test_slow_gpu_one_acquire_per_view() {
        let mut h = harness(SimConfig {
            gpu_delay: Duration::from_millis(3),
            ..SimConfig::default()
        });
        let mut renderer = HeadlessRenderer::default();
        for _ in 0..3 {
            h.frame(&mut renderer).unwrap();
        }
        for id in h.swapchain_ids() {
            assert_eq!(count(&h.sim, |c| *c == SimCall::AcquireImage(id)), 3);
            assert_eq!(count(&h.sim, |c| *c == SimCall::WaitImage(id)), 3);
            assert_eq!(count(&h.sim, |c| *c == SimCall::ReleaseImage(id)), 3);
        }
        assert_eq!(h.frame_loop.frames(), 3);
    }

    #[test]
    fn test_sync_failure_still_ends_frame() {
        let mut h = harness(SimConfig::default());
        h.sim.fail_next("sync_actions", RuntimeError::SessionLost);
        let result = h.frame(&mut HeadlessRenderer::default());
        assert!(result.is_err());
        assert_eq!(
            count(&h.sim, |c| matches!(c, SimCall::EndFrame { .. })),
            1
        );
        assert_eq!(h.sim.frames_ended(), 1);
    }

    #[test]
    fn test_stopping_mid_frame_ends_session_next_frame() {
        let mut h = harness(SimConfig::default());
        let mut renderer = HeadlessRenderer::default();
        h.frame(&mut renderer).unwrap();

        // Arrives while the frame is in flight; not seen until the next drain.
        h.sim.push_state(SessionState::Stopping);
        h.sim.clear_calls();
        let outcome = h.frame(&mut renderer).unwrap();
        assert_eq!(outcome, FrameOutcome::NotRunning);
        assert_eq!(
            h.sim.calls().iter().position(|c| *c == SimCall::EndSession),
            Some(0)
        );
        assert_eq!(count(&h.sim, |c| *c == SimCall::WaitFrame), 0);
        assert_eq!(renderer.rendered, 2);
    }

    #[test]
    fn test_exit_state_reported() {
        let mut h = harness(SimConfig::default());
        h.frame(&mut HeadlessRenderer::default()).unwrap();
        let session = h.active.session.session();
        h.sim.request_exit_session(session).unwrap();
        let outcome = h.frame(&mut HeadlessRenderer::default()).unwrap();
        assert_eq!(outcome, FrameOutcome::Exit(ExitReason::Exiting));
    }

    #[test]
    fn test_camera_restored_and_controllers_written() {
        let mut h = harness(SimConfig::default());
        let before = h.scene.camera;
        h.frame(&mut HeadlessRenderer::default()).unwrap();
        assert_eq!(h.scene.camera, before);
        assert_eq!(h.scene.updates, 2);
        assert_eq!(h.frame_loop.context().saved_camera, Some(before));
    }

    #[test]
    fn test_profile_change_requeried() {
        let mut h = harness(SimConfig::default());
        h.frame(&mut HeadlessRenderer::default()).unwrap();
        assert_eq!(
            h.active.actions.current_profile(Hand::Left),
            Some("/interaction_profiles/oculus/touch_controller")
        );
        h.sim
            .set_current_profile("/user/hand/left", "/interaction_profiles/khr/simple_controller");
        h.frame(&mut HeadlessRenderer::default()).unwrap();
        assert_eq!(
            h.active.actions.current_profile(Hand::Left),
            Some("/interaction_profiles/khr/simple_controller")
        );
    }

    #[test]
    fn test_mono_configuration_single_view() {
        let mut h = harness(SimConfig {
            view_configurations: vec![ViewConfigurationType::PrimaryMono],
            ..SimConfig::default()
        });
        let outcome = h.frame(&mut HeadlessRenderer::default()).unwrap();
        assert_eq!(outcome, FrameOutcome::Rendered { views: 1 });
    }
}
