//! The runtime seam: every call the bridge makes into an XR runtime.
//!
//! Components never touch a concrete runtime. They are written against
//! [`XrRuntime`], which is implemented by the OpenXR loader backend
//! (`openxr_runtime`, feature `vr`) and by the in-process simulator
//! (`sim`). Handles are arena-style ids owned by the runtime; the bridge
//! tracks the ones it creates in a [`HandleScope`] so teardown happens on
//! every exit path.

use std::sync::mpsc::Sender;

use tracing::{debug, warn};

use super::error::XrResult;
use super::types::{
    ActionState, ActionType, ApplicationInfo, BlendMode, DebugMessage, FormFactor, Fov,
    FrameState, HapticVibration, InstanceProperties, Pose, ReferenceSpaceType, SessionState,
    SpaceLocation, SystemDescriptor, View, ViewConfigurationType, ViewConfigurationView, XrTime,
};

// ── Handle ids ─────────────────────────────────────────────

macro_rules! handle_id {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);
        )*
    };
}

handle_id! {
    /// Runtime-interned path (`/user/hand/left`, profile paths, ...).
    XrPath;
    SessionId;
    ActionSetId;
    ActionId;
    SpaceId;
    SwapchainId;
    MessengerId;
}

/// A destroyable runtime object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handle {
    Instance,
    Messenger(MessengerId),
    ActionSet(ActionSetId),
    Session(SessionId),
    Space(SpaceId),
    Swapchain(SwapchainId),
}

impl Handle {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Instance => "instance",
            Self::Messenger(_) => "debug-messenger",
            Self::ActionSet(_) => "action-set",
            Self::Session(_) => "session",
            Self::Space(_) => "space",
            Self::Swapchain(_) => "swapchain",
        }
    }
}

// ── Graphics binding ───────────────────────────────────────

/// Native graphics context the session renders with.
///
/// Handles are carried as plain integers; the backend casts them to the
/// platform types it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphicsBinding {
    OpenGlXlib {
        x_display: usize,
        visual_id: u32,
        glx_fb_config: usize,
        glx_drawable: u64,
        glx_context: usize,
    },
    OpenGlWin32 {
        h_dc: usize,
        h_glrc: usize,
    },
    /// No graphics at all (runtimes exposing `XR_MND_headless`).
    Headless,
}

/// `GL_SRGB8_ALPHA8`
pub const GL_SRGB8_ALPHA8: i64 = 0x8C43;
/// `GL_RGBA8`
pub const GL_RGBA8: i64 = 0x8058;

impl GraphicsBinding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenGlXlib { .. } => "opengl-xlib",
            Self::OpenGlWin32 { .. } => "opengl-win32",
            Self::Headless => "headless",
        }
    }

    /// The instance extension this binding cannot work without.
    pub fn required_extension(&self) -> &'static str {
        match self {
            Self::OpenGlXlib { .. } | Self::OpenGlWin32 { .. } => "XR_KHR_opengl_enable",
            Self::Headless => "XR_MND_headless",
        }
    }

    /// Color formats in order of preference.
    pub fn preferred_color_formats(&self) -> &'static [i64] {
        match self {
            Self::OpenGlXlib { .. } | Self::OpenGlWin32 { .. } => &[GL_SRGB8_ALPHA8, GL_RGBA8],
            Self::Headless => &[],
        }
    }
}

// ── Swapchains and layers ─────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainCreateInfo {
    pub format: i64,
    pub width: u32,
    pub height: u32,
    pub sample_count: u32,
    pub face_count: u32,
    pub array_size: u32,
    pub mip_count: u32,
    pub color_attachment: bool,
    pub sampled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect2D {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Region of a swapchain image referenced by a layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubImage {
    pub swapchain: SwapchainId,
    pub rect: Rect2D,
    pub array_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionView {
    pub pose: Pose,
    pub fov: Fov,
    pub sub_image: SubImage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionLayer {
    pub space: SpaceId,
    pub views: Vec<ProjectionView>,
    pub blend_texture_source_alpha: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompositionLayer {
    Projection(ProjectionLayer),
}

// ── Events ─────────────────────────────────────────────────

/// Runtime event, decoded once at the backend boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum XrEvent {
    EventsLost {
        lost_event_count: u32,
    },
    InstanceLossPending {
        loss_time: XrTime,
    },
    InteractionProfileChanged {
        session: SessionId,
    },
    ReferenceSpaceChangePending {
        session: SessionId,
        reference_space_type: ReferenceSpaceType,
        change_time: XrTime,
    },
    SessionStateChanged {
        session: SessionId,
        state: SessionState,
        time: XrTime,
    },
    Other,
}

// ── The seam ───────────────────────────────────────────────

/// Calls into an XR runtime.
///
/// Methods map one-to-one onto runtime entry points. All of them take
/// `&mut self`; the bridge is single-threaded and a runtime is driven by
/// exactly one control thread.
pub trait XrRuntime {
    fn enumerate_api_layers(&mut self) -> XrResult<Vec<String>>;
    fn enumerate_extensions(&mut self) -> XrResult<Vec<String>>;
    fn create_instance(
        &mut self,
        app: &ApplicationInfo,
        extensions: &[String],
        api_layers: &[String],
    ) -> XrResult<InstanceProperties>;
    fn create_debug_messenger(&mut self, sink: Sender<DebugMessage>) -> XrResult<MessengerId>;
    fn system(&mut self, form_factor: FormFactor) -> XrResult<SystemDescriptor>;

    fn string_to_path(&mut self, path: &str) -> XrResult<XrPath>;
    fn path_to_string(&mut self, path: XrPath) -> XrResult<String>;

    fn create_action_set(
        &mut self,
        name: &str,
        localized_name: &str,
        priority: u32,
    ) -> XrResult<ActionSetId>;
    fn create_action(
        &mut self,
        set: ActionSetId,
        name: &str,
        localized_name: &str,
        ty: ActionType,
        subaction_paths: &[XrPath],
    ) -> XrResult<ActionId>;
    fn suggest_bindings(
        &mut self,
        profile: XrPath,
        bindings: &[(ActionId, XrPath)],
    ) -> XrResult<()>;

    fn enumerate_view_configurations(&mut self) -> XrResult<Vec<ViewConfigurationType>>;
    fn enumerate_view_configuration_views(
        &mut self,
        ty: ViewConfigurationType,
    ) -> XrResult<Vec<ViewConfigurationView>>;
    fn enumerate_blend_modes(&mut self, ty: ViewConfigurationType) -> XrResult<Vec<BlendMode>>;

    fn create_session(&mut self, binding: &GraphicsBinding) -> XrResult<SessionId>;
    fn attach_action_sets(&mut self, session: SessionId, sets: &[ActionSetId]) -> XrResult<()>;
    fn create_action_space(
        &mut self,
        session: SessionId,
        action: ActionId,
        subaction_path: XrPath,
        pose_in_action_space: Pose,
    ) -> XrResult<SpaceId>;
    fn create_reference_space(
        &mut self,
        session: SessionId,
        ty: ReferenceSpaceType,
        pose_in_reference_space: Pose,
    ) -> XrResult<SpaceId>;

    fn enumerate_swapchain_formats(&mut self, session: SessionId) -> XrResult<Vec<i64>>;
    fn create_swapchain(
        &mut self,
        session: SessionId,
        info: &SwapchainCreateInfo,
    ) -> XrResult<SwapchainId>;
    /// Native image names (GL texture ids) of the swapchain's ring.
    fn enumerate_swapchain_images(&mut self, swapchain: SwapchainId) -> XrResult<Vec<u32>>;

    /// Non-blocking; `None` when the queue is empty.
    fn poll_event(&mut self) -> XrResult<Option<XrEvent>>;

    fn begin_session(&mut self, session: SessionId, ty: ViewConfigurationType) -> XrResult<()>;
    fn end_session(&mut self, session: SessionId) -> XrResult<()>;
    fn request_exit_session(&mut self, session: SessionId) -> XrResult<()>;
    fn current_interaction_profile(
        &mut self,
        session: SessionId,
        top_level_path: XrPath,
    ) -> XrResult<Option<XrPath>>;

    fn sync_actions(&mut self, session: SessionId, sets: &[ActionSetId]) -> XrResult<()>;
    fn action_state_boolean(
        &mut self,
        session: SessionId,
        action: ActionId,
        subaction_path: XrPath,
    ) -> XrResult<ActionState<bool>>;
    fn action_state_float(
        &mut self,
        session: SessionId,
        action: ActionId,
        subaction_path: XrPath,
    ) -> XrResult<ActionState<f32>>;
    /// Whether the pose action is currently bound and tracking.
    fn action_state_pose(
        &mut self,
        session: SessionId,
        action: ActionId,
        subaction_path: XrPath,
    ) -> XrResult<bool>;
    fn locate_space(&mut self, space: SpaceId, base: SpaceId, time: XrTime)
        -> XrResult<SpaceLocation>;
    fn apply_haptic_feedback(
        &mut self,
        session: SessionId,
        action: ActionId,
        subaction_path: XrPath,
        vibration: &HapticVibration,
    ) -> XrResult<()>;

    /// Blocks until the runtime's pacing clock releases the next frame.
    fn wait_frame(&mut self, session: SessionId) -> XrResult<FrameState>;
    fn begin_frame(&mut self, session: SessionId) -> XrResult<()>;
    fn locate_views(
        &mut self,
        session: SessionId,
        ty: ViewConfigurationType,
        time: XrTime,
        space: SpaceId,
    ) -> XrResult<Vec<View>>;
    fn acquire_swapchain_image(&mut self, swapchain: SwapchainId) -> XrResult<u32>;
    /// Waits with an unbounded timeout.
    fn wait_swapchain_image(&mut self, swapchain: SwapchainId) -> XrResult<()>;
    fn release_swapchain_image(&mut self, swapchain: SwapchainId) -> XrResult<()>;
    fn end_frame(
        &mut self,
        session: SessionId,
        display_time: XrTime,
        blend_mode: BlendMode,
        layers: &[CompositionLayer],
    ) -> XrResult<()>;

    fn destroy(&mut self, handle: Handle) -> XrResult<()>;
}

// ── Scoped teardown ────────────────────────────────────────

/// Every handle the bridge created, in creation order.
///
/// Released in reverse order so children go before their parents
/// (spaces and swapchains before the session, the session before the
/// instance).
#[derive(Debug, Default)]
pub struct HandleScope {
    handles: Vec<Handle>,
}

impl HandleScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, handle: Handle) {
        debug!("VR: tracking {} handle", handle.kind());
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.handles.contains(&handle)
    }

    /// Destroy everything, newest first. Failures are logged and do not
    /// stop the remaining releases. Returns the number of failures.
    pub fn release_all<R: XrRuntime + ?Sized>(&mut self, runtime: &mut R) -> usize {
        let mut failures = 0;
        while let Some(handle) = self.handles.pop() {
            if let Err(e) = runtime.destroy(handle) {
                warn!("VR: failed to destroy {} handle: {}", handle.kind(), e);
                failures += 1;
            }
        }
        failures
    }
}

/// One acquired swapchain image.
///
/// Acquisition and the unbounded wait happen in [`acquire`](Self::acquire);
/// a waited image is released exactly once, either through
/// [`release`](Self::release) or when the guard is dropped.
pub struct SwapchainImageGuard<'a, R: XrRuntime + ?Sized> {
    runtime: &'a mut R,
    swapchain: SwapchainId,
    index: u32,
    waited: bool,
    released: bool,
}

impl<'a, R: XrRuntime + ?Sized> SwapchainImageGuard<'a, R> {
    /// Acquire the next image index and block until it is GPU-ready.
    ///
    /// Release is only legal after a successful wait, so a failed wait
    /// leaves the index acquired.
    pub fn acquire(runtime: &'a mut R, swapchain: SwapchainId) -> XrResult<Self> {
        let index = runtime.acquire_swapchain_image(swapchain)?;
        let mut guard = Self {
            runtime,
            swapchain,
            index,
            waited: false,
            released: false,
        };
        guard.runtime.wait_swapchain_image(swapchain)?;
        guard.waited = true;
        Ok(guard)
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn swapchain(&self) -> SwapchainId {
        self.swapchain
    }

    /// Release now and surface the runtime's answer.
    pub fn release(mut self) -> XrResult<()> {
        self.released = true;
        self.runtime.release_swapchain_image(self.swapchain)
    }
}

impl<R: XrRuntime + ?Sized> Drop for SwapchainImageGuard<'_, R> {
    fn drop(&mut self) {
        if self.released || !self.waited {
            return;
        }
        self.released = true;
        if let Err(e) = self.runtime.release_swapchain_image(self.swapchain) {
            warn!("VR: failed to release swapchain image {}: {}", self.index, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xr::sim::{SimCall, SimConfig, SimRuntime};

    fn running_sim() -> (SimRuntime, SessionId, SwapchainId) {
        let mut sim = SimRuntime::new(SimConfig::default());
        let session = sim.bootstrap_running_session().unwrap();
        let swapchain = sim
            .create_swapchain(
                session,
                &SwapchainCreateInfo {
                    format: GL_SRGB8_ALPHA8,
                    width: 64,
                    height: 64,
                    sample_count: 1,
                    face_count: 1,
                    array_size: 1,
                    mip_count: 1,
                    color_attachment: true,
                    sampled: true,
                },
            )
            .unwrap();
        (sim, session, swapchain)
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let (mut sim, _, sc) = running_sim();
        {
            let guard = SwapchainImageGuard::acquire(&mut sim, sc).unwrap();
            assert_eq!(guard.index(), 0);
        }
        assert_eq!(sim.count_calls(|c| matches!(c, SimCall::ReleaseImage(_))), 1);
        assert!(!sim.has_outstanding_image(sc));
    }

    #[test]
    fn test_guard_explicit_release_not_repeated() {
        let (mut sim, _, sc) = running_sim();
        let guard = SwapchainImageGuard::acquire(&mut sim, sc).unwrap();
        guard.release().unwrap();
        assert_eq!(sim.count_calls(|c| matches!(c, SimCall::ReleaseImage(_))), 1);
    }

    #[test]
    fn test_guard_does_not_release_unwaited_image() {
        let (mut sim, _, sc) = running_sim();
        sim.fail_next("wait_swapchain_image", crate::xr::error::RuntimeError::HandleInvalid);
        let result = SwapchainImageGuard::acquire(&mut sim, sc);
        assert!(result.is_err());
        drop(result);
        assert_eq!(sim.count_calls(|c| matches!(c, SimCall::ReleaseImage(_))), 0);
    }

    #[test]
    fn test_handle_scope_releases_in_reverse() {
        let mut sim = SimRuntime::new(SimConfig::default());
        let mut scope = HandleScope::new();
        sim.create_instance(&crate::config::XrConfig::default().application_info(), &[], &[])
            .unwrap();
        scope.track(Handle::Instance);
        let session = sim.create_session(&GraphicsBinding::Headless).unwrap();
        scope.track(Handle::Session(session));
        let space = sim
            .create_reference_space(session, ReferenceSpaceType::Stage, Pose::IDENTITY)
            .unwrap();
        scope.track(Handle::Space(space));

        assert_eq!(scope.release_all(&mut sim), 0);
        assert!(scope.is_empty());
        let destroyed: Vec<Handle> = sim
            .calls()
            .iter()
            .filter_map(|c| match c {
                SimCall::Destroy(h) => Some(*h),
                _ => None,
            })
            .collect();
        assert_eq!(
            destroyed,
            vec![Handle::Space(space), Handle::Session(session), Handle::Instance]
        );
    }

    #[test]
    fn test_binding_extensions_and_formats() {
        let gl = GraphicsBinding::OpenGlWin32 { h_dc: 1, h_glrc: 2 };
        assert_eq!(gl.required_extension(), "XR_KHR_opengl_enable");
        assert_eq!(gl.preferred_color_formats()[0], GL_SRGB8_ALPHA8);
        assert_eq!(GraphicsBinding::Headless.required_extension(), "XR_MND_headless");
    }
}
