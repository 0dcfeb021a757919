//! The public facade: one object owning the whole XR lifecycle.
//!
//! `initialize` runs negotiation through swapchain creation in a fixed
//! order; every handle created on the way is tracked so that a failure at
//! any step, an explicit `shutdown`, or drop releases exactly what exists,
//! newest first.

use tracing::{debug, info, warn};

use super::actions::{ActionRegistry, Axis, Button};
use super::frame_loop::{ActiveSession, FrameLoop, FrameOutcome};
use super::frame_timing::FrameTimingStats;
use super::negotiate::{negotiate, resolve_system};
use super::render::{SceneGraph, ViewRenderer};
use super::runtime::{GraphicsBinding, HandleScope, XrRuntime};
use super::session::SessionController;
use super::swapchain::{SwapchainManager, ViewSetup};
use super::types::{Hand, InstanceProperties, Pose, SessionState, SystemDescriptor};
use crate::config::XrConfig;

/// Facts about the initialized runtime, for status output.
#[derive(Debug, Clone)]
pub struct RuntimeSummary {
    pub instance: InstanceProperties,
    pub enabled_extensions: Vec<String>,
    pub enabled_layers: Vec<String>,
    pub system: SystemDescriptor,
}

struct Live {
    summary: RuntimeSummary,
    active: ActiveSession,
}

pub struct XrBridge<R: XrRuntime> {
    runtime: R,
    config: XrConfig,
    scope: HandleScope,
    live: Option<Live>,
    frame_loop: FrameLoop,
}

impl<R: XrRuntime> XrBridge<R> {
    pub fn new(runtime: R, config: XrConfig) -> Self {
        let frame_loop = FrameLoop::new(config.near_z, config.far_z);
        Self {
            runtime,
            config,
            scope: HandleScope::new(),
            live: None,
            frame_loop,
        }
    }

    /// Bring the runtime up to a created session with attached input and
    /// per-view swapchains. The session begins once the runtime reports
    /// READY, which is observed by [`run_frame`](Self::run_frame).
    pub fn initialize(&mut self, binding: &GraphicsBinding) -> anyhow::Result<()> {
        if self.live.is_some() {
            anyhow::bail!("VR: already initialized");
        }
        info!("VR: initializing ({})", binding.as_str());
        match self.build(binding) {
            Ok(live) => {
                info!(
                    "VR: ready on {} with {} view(s)",
                    live.summary.system.system_name,
                    live.active.swapchains.view_count()
                );
                self.live = Some(live);
                Ok(())
            }
            Err(e) => {
                let tracked = self.scope.len();
                let failures = self.scope.release_all(&mut self.runtime);
                warn!(
                    "VR: initialization failed, released {} handle(s) ({} failed)",
                    tracked, failures
                );
                Err(e)
            }
        }
    }

    /// Negotiate an instance and resolve the HMD without creating a
    /// session, then release everything again.
    pub fn probe(&mut self, binding: &GraphicsBinding) -> anyhow::Result<RuntimeSummary> {
        if self.live.is_some() {
            anyhow::bail!("VR: cannot probe an initialized bridge");
        }
        let result = negotiate(&mut self.runtime, &mut self.scope, &self.config, binding).and_then(
            |negotiated| {
                let system = resolve_system(&mut self.runtime, self.config.form_factor)?;
                Ok(RuntimeSummary {
                    instance: negotiated.properties,
                    enabled_extensions: negotiated.enabled_extensions,
                    enabled_layers: negotiated.enabled_layers,
                    system,
                })
            },
        );
        self.scope.release_all(&mut self.runtime);
        result
    }

    fn build(&mut self, binding: &GraphicsBinding) -> anyhow::Result<Live> {
        let runtime = &mut self.runtime;
        let scope = &mut self.scope;
        let config = &self.config;

        let negotiated = negotiate(runtime, scope, config, binding)?;
        let system = resolve_system(runtime, config.form_factor)?;

        let mut actions = ActionRegistry::create(runtime, scope, config.haptics)?;
        actions.suggest_bindings(runtime, &config.interaction_profiles)?;

        let setup = ViewSetup::resolve(runtime, config)?;
        let session = SessionController::create(
            runtime,
            scope,
            binding,
            setup.view_configuration,
            config.reference_space,
        )?;
        actions.attach(runtime, scope, session.session())?;
        let swapchains = SwapchainManager::create(runtime, scope, session.session(), setup, binding)?;

        Ok(Live {
            summary: RuntimeSummary {
                instance: negotiated.properties,
                enabled_extensions: negotiated.enabled_extensions,
                enabled_layers: negotiated.enabled_layers,
                system,
            },
            active: ActiveSession {
                debug: negotiated.debug,
                session,
                actions,
                swapchains,
            },
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.live.is_some()
    }

    /// Run one frame. Before `initialize` (or after `shutdown`) this is a
    /// no-op reporting [`FrameOutcome::NotRunning`].
    pub fn run_frame<V, S>(&mut self, renderer: &mut V, scene: &mut S) -> anyhow::Result<FrameOutcome>
    where
        V: ViewRenderer + ?Sized,
        S: SceneGraph + ?Sized,
    {
        match self.live.as_mut() {
            Some(live) => self
                .frame_loop
                .run_frame(&mut self.runtime, &mut live.active, renderer, scene),
            None => Ok(FrameOutcome::NotRunning),
        }
    }

    /// Ask the runtime to end the session. Frames keep running until the
    /// state machine reaches EXITING.
    pub fn request_exit(&mut self) -> anyhow::Result<()> {
        match self.live.as_mut() {
            Some(live) => live.active.session.request_exit(&mut self.runtime),
            None => Ok(()),
        }
    }

    /// Destroy every runtime handle. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.live.take().is_none() && self.scope.is_empty() {
            return;
        }
        info!("VR: shutting down");
        let failures = self.scope.release_all(&mut self.runtime);
        if failures > 0 {
            warn!("VR: {} handle(s) failed to release", failures);
        }
        debug!("VR: shutdown complete");
    }

    // ── Controller queries ─────────────────────────────────

    /// Last known palm pose. Keeps the previous value while untracked.
    pub fn controller_pose(&self, hand: Hand) -> Pose {
        self.live
            .as_ref()
            .map(|l| l.active.actions.snapshot(hand).pose)
            .unwrap_or_default()
    }

    pub fn pose_active(&self, hand: Hand) -> bool {
        self.live
            .as_ref()
            .is_some_and(|l| l.active.actions.snapshot(hand).pose_active)
    }

    pub fn button(&self, hand: Hand, button: Button) -> bool {
        self.live
            .as_ref()
            .is_some_and(|l| l.active.actions.snapshot(hand).button(button))
    }

    pub fn axis(&self, hand: Hand, axis: Axis) -> f32 {
        self.live
            .as_ref()
            .map_or(0.0, |l| l.active.actions.snapshot(hand).axis(axis))
    }

    /// Start a buzz on `hand`; it decays over the next frames.
    pub fn vibrate(&mut self, hand: Hand, amplitude: f32) {
        if let Some(live) = self.live.as_mut() {
            live.active.actions.vibrate(hand, amplitude);
        }
    }

    pub fn current_profile(&self, hand: Hand) -> Option<&str> {
        self.live
            .as_ref()
            .and_then(|l| l.active.actions.current_profile(hand))
    }

    // ── Status ─────────────────────────────────────────────

    pub fn session_state(&self) -> SessionState {
        self.live
            .as_ref()
            .map_or(SessionState::Unknown, |l| l.active.session.state())
    }

    pub fn is_running(&self) -> bool {
        self.live
            .as_ref()
            .is_some_and(|l| l.active.session.is_running())
    }

    pub fn summary(&self) -> Option<&RuntimeSummary> {
        self.live.as_ref().map(|l| &l.summary)
    }

    pub fn frames(&self) -> u64 {
        self.frame_loop.frames()
    }

    pub fn timing_stats(&self) -> FrameTimingStats {
        self.frame_loop.timing().stats()
    }

    pub fn config(&self) -> &XrConfig {
        &self.config
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut R {
        &mut self.runtime
    }
}

impl<R: XrRuntime> Drop for XrBridge<R> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InteractionProfileTable;
    use crate::xr::error::RuntimeError;
    use crate::xr::render::HeadlessRenderer;
    use crate::xr::rig::XrRig;
    use crate::xr::runtime::Handle;
    use crate::xr::session::ExitReason;
    use crate::xr::sim::{SimCall, SimConfig, SimRuntime};
    use crate::xr::types::{FormFactor, SpaceLocation};
    use glam::{Quat, Vec3};

    fn bridge(sim_config: SimConfig) -> XrBridge<SimRuntime> {
        XrBridge::new(SimRuntime::new(sim_config), XrConfig::default())
    }

    fn destroyed(sim: &SimRuntime) -> Vec<Handle> {
        sim.calls()
            .iter()
            .filter_map(|c| match c {
                SimCall::Destroy(h) => Some(*h),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_initialize_and_render() {
        let mut b = bridge(SimConfig::default());
        b.initialize(&GraphicsBinding::Headless).unwrap();
        assert!(b.is_initialized());
        let summary = b.summary().unwrap();
        assert_eq!(summary.system.system_name, "Simulated HMD");
        assert!(summary
            .enabled_extensions
            .iter()
            .any(|e| e == "XR_KHR_composition_layer_depth"));

        let mut renderer = HeadlessRenderer::default();
        let mut rig = XrRig::new();
        assert_eq!(
            b.run_frame(&mut renderer, &mut rig).unwrap(),
            FrameOutcome::Rendered { views: 2 }
        );
        assert!(b.is_running());
        assert_eq!(b.session_state(), SessionState::Focused);
        assert_eq!(b.frames(), 1);
        assert_eq!(b.timing_stats().total_frames, 1);
    }

    #[test]
    fn test_probe_releases_instance() {
        let mut b = bridge(SimConfig::default());
        let summary = b.probe(&GraphicsBinding::Headless).unwrap();
        assert_eq!(summary.instance.runtime_name, "Simulated Runtime");
        assert_eq!(summary.system.form_factor, FormFactor::HeadMountedDisplay);
        assert!(!b.is_initialized());
        assert_eq!(b.runtime().count_calls(|c| *c == SimCall::CreateSession), 0);
        let gone = destroyed(b.runtime());
        assert!(matches!(gone.last(), Some(Handle::Instance)));
    }

    #[test]
    fn test_run_frame_before_initialize() {
        let mut b = bridge(SimConfig::default());
        let outcome = b
            .run_frame(&mut HeadlessRenderer::default(), &mut XrRig::new())
            .unwrap();
        assert_eq!(outcome, FrameOutcome::NotRunning);
        assert_eq!(b.session_state(), SessionState::Unknown);
    }

    #[test]
    fn test_double_initialize_rejected() {
        let mut b = bridge(SimConfig::default());
        b.initialize(&GraphicsBinding::Headless).unwrap();
        assert!(b.initialize(&GraphicsBinding::Headless).is_err());
        assert!(b.is_initialized());
    }

    #[test]
    fn test_missing_graphics_extension_fails_cleanly() {
        let mut b = bridge(SimConfig {
            extensions: vec!["XR_EXT_debug_utils".to_string()],
            ..SimConfig::default()
        });
        let err = b.initialize(&GraphicsBinding::Headless).unwrap_err();
        assert!(format!("{:#}", err).contains("XR_MND_headless"));
        assert!(!b.is_initialized());
        assert_eq!(b.runtime().count_calls(|c| *c == SimCall::CreateInstance), 0);
    }

    #[test]
    fn test_no_hmd_releases_instance() {
        let mut b = bridge(SimConfig {
            form_factors: vec![FormFactor::HandheldDisplay],
            ..SimConfig::default()
        });
        let err = b.initialize(&GraphicsBinding::Headless).unwrap_err();
        assert!(err.to_string().contains("no head-mounted-display device"));
        let handles = destroyed(b.runtime());
        assert_eq!(handles.len(), 2);
        assert!(matches!(handles[0], Handle::Messenger(_)));
        assert_eq!(handles[1], Handle::Instance);
    }

    #[test]
    fn test_swapchain_failure_releases_everything_created() {
        let mut b = bridge(SimConfig::default());
        b.runtime_mut()
            .fail_next("create_swapchain", RuntimeError::ValidationFailure("no".into()));
        assert!(b.initialize(&GraphicsBinding::Headless).is_err());
        let handles = destroyed(b.runtime());
        // instance, messenger, action set, session, reference space, two hand spaces
        assert_eq!(handles.len(), 7);
        assert_eq!(handles.last(), Some(&Handle::Instance));
        assert!(matches!(handles[0], Handle::Space(_)));
        b.shutdown();
        assert_eq!(destroyed(b.runtime()).len(), 7);
    }

    #[test]
    fn test_all_binding_tables_rejected() {
        let mut b = bridge(SimConfig {
            interaction_profiles: vec![],
            ..SimConfig::default()
        });
        let err = b.initialize(&GraphicsBinding::Headless).unwrap_err();
        assert!(err.to_string().contains("rejected all 3"));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut b = bridge(SimConfig::default());
        b.initialize(&GraphicsBinding::Headless).unwrap();
        b.shutdown();
        let after_first = destroyed(b.runtime()).len();
        // two swapchains on top of the seven handles above
        assert_eq!(after_first, 9);
        b.shutdown();
        assert_eq!(destroyed(b.runtime()).len(), after_first);
        assert!(!b.is_initialized());
        assert_eq!(
            b.run_frame(&mut HeadlessRenderer::default(), &mut XrRig::new())
                .unwrap(),
            FrameOutcome::NotRunning
        );
    }

    #[test]
    fn test_request_exit_reaches_exit_outcome() {
        let mut b = bridge(SimConfig::default());
        b.initialize(&GraphicsBinding::Headless).unwrap();
        let mut renderer = HeadlessRenderer::default();
        let mut rig = XrRig::new();
        b.run_frame(&mut renderer, &mut rig).unwrap();
        b.request_exit().unwrap();
        assert_eq!(
            b.run_frame(&mut renderer, &mut rig).unwrap(),
            FrameOutcome::Exit(ExitReason::Exiting)
        );
        assert!(!b.is_running());
    }

    #[test]
    fn test_controller_queries_follow_sync() {
        let mut b = bridge(SimConfig::default());
        b.initialize(&GraphicsBinding::Headless).unwrap();
        let mut renderer = HeadlessRenderer::default();
        let mut rig = XrRig::new();
        b.run_frame(&mut renderer, &mut rig).unwrap();

        let located = Pose::new(Vec3::new(0.2, 1.1, -0.3), Quat::IDENTITY);
        let sim = b.runtime_mut();
        sim.set_float("trigger", "/user/hand/right", 0.75);
        sim.set_boolean("primary-button", "/user/hand/right", true);
        sim.set_pose_active("palm-pose", "/user/hand/right", true);
        sim.set_action_space_location(
            "palm-pose",
            "/user/hand/right",
            SpaceLocation {
                pose: located,
                position_valid: true,
                orientation_valid: true,
            },
        );
        b.run_frame(&mut renderer, &mut rig).unwrap();

        assert_eq!(b.axis(Hand::Right, Axis::Trigger), 0.75);
        assert!(b.button(Hand::Right, Button::Primary));
        assert!(!b.button(Hand::Left, Button::Primary));
        assert!(b.pose_active(Hand::Right));
        assert_eq!(b.controller_pose(Hand::Right), located);
        assert_eq!(rig.controller(Hand::Right).pose(), located);
        assert_eq!(
            b.current_profile(Hand::Right),
            Some("/interaction_profiles/oculus/touch_controller")
        );
    }

    #[test]
    fn test_vibrate_reaches_runtime() {
        let mut b = bridge(SimConfig::default());
        b.initialize(&GraphicsBinding::Headless).unwrap();
        b.vibrate(Hand::Left, 0.8);
        b.run_frame(&mut HeadlessRenderer::default(), &mut XrRig::new())
            .unwrap();
        assert_eq!(b.runtime().last_haptic("/user/hand/left"), Some(0.4));
        assert_eq!(b.runtime().last_haptic("/user/hand/right"), Some(0.0));
    }

    #[test]
    fn test_custom_profile_table_only() {
        let config = XrConfig {
            interaction_profiles: vec![InteractionProfileTable::khr_simple()],
            ..XrConfig::default()
        };
        let mut b = XrBridge::new(SimRuntime::new(SimConfig::default()), config);
        b.initialize(&GraphicsBinding::Headless).unwrap();
        b.run_frame(&mut HeadlessRenderer::default(), &mut XrRig::new())
            .unwrap();
        assert_eq!(
            b.current_profile(Hand::Left),
            Some("/interaction_profiles/khr/simple_controller")
        );
    }
}
