//! OpenXR loader backend.
//!
//! Implements [`XrRuntime`] on top of the `openxr` crate with an OpenGL
//! graphics binding. The loader is opened at construction; every handle
//! the trait hands out is an id into one of the maps below, and
//! [`destroy`](XrRuntime::destroy) drops the wrapped object.

use std::collections::HashMap;
use std::ffi::{c_void, CStr};
use std::os::raw::c_char;
use std::sync::mpsc::Sender;

use openxrs as xr;
use tracing::{debug, info, warn};

use super::error::{RuntimeError, XrResult};
use super::runtime::{
    ActionId, ActionSetId, CompositionLayer, GraphicsBinding, Handle, MessengerId, SessionId,
    SpaceId, SwapchainCreateInfo, SwapchainId, XrEvent, XrPath, XrRuntime,
};
use super::types::{
    ActionState, ActionType, ApplicationInfo, BlendMode, DebugMessage, DebugSeverity, FormFactor,
    Fov, FrameState, HapticVibration, InstanceProperties, Pose, ReferenceSpaceType, SessionState,
    SpaceLocation, SystemDescriptor, Version, View, ViewConfigurationType, ViewConfigurationView,
    XrTime,
};

// ── Conversions ────────────────────────────────────────────

impl From<xr::sys::Result> for RuntimeError {
    fn from(result: xr::sys::Result) -> Self {
        match result {
            xr::sys::Result::ERROR_FORM_FACTOR_UNAVAILABLE => Self::FormFactorUnavailable,
            xr::sys::Result::ERROR_EXTENSION_NOT_PRESENT => {
                Self::ExtensionNotPresent(result.to_string())
            }
            xr::sys::Result::ERROR_API_LAYER_NOT_PRESENT => {
                Self::ApiLayerNotPresent(result.to_string())
            }
            xr::sys::Result::ERROR_SESSION_NOT_RUNNING => Self::SessionNotRunning,
            xr::sys::Result::ERROR_SESSION_NOT_READY => Self::SessionNotReady,
            xr::sys::Result::ERROR_SESSION_NOT_STOPPING => Self::SessionNotStopping,
            xr::sys::Result::ERROR_PATH_INVALID => Self::PathInvalid(result.to_string()),
            xr::sys::Result::ERROR_PATH_UNSUPPORTED => Self::PathUnsupported(result.to_string()),
            xr::sys::Result::ERROR_ACTION_TYPE_MISMATCH => Self::ActionTypeMismatch {
                expected: "?",
                actual: "?",
            },
            xr::sys::Result::ERROR_CALL_ORDER_INVALID => {
                Self::CallOrderInvalid("reported by runtime")
            }
            xr::sys::Result::ERROR_VALIDATION_FAILURE => Self::ValidationFailure(result.to_string()),
            xr::sys::Result::ERROR_HANDLE_INVALID => Self::HandleInvalid,
            xr::sys::Result::ERROR_INSTANCE_LOST => Self::InstanceLost,
            xr::sys::Result::ERROR_SESSION_LOST => Self::SessionLost,
            other => Self::Other {
                code: other.into_raw(),
                message: other.to_string(),
            },
        }
    }
}

fn to_xr_pose(pose: Pose) -> xr::Posef {
    xr::Posef {
        orientation: xr::Quaternionf {
            x: pose.orientation.x,
            y: pose.orientation.y,
            z: pose.orientation.z,
            w: pose.orientation.w,
        },
        position: xr::Vector3f {
            x: pose.position.x,
            y: pose.position.y,
            z: pose.position.z,
        },
    }
}

fn from_xr_pose(pose: xr::Posef) -> Pose {
    Pose::new(
        glam::Vec3::new(pose.position.x, pose.position.y, pose.position.z),
        glam::Quat::from_xyzw(
            pose.orientation.x,
            pose.orientation.y,
            pose.orientation.z,
            pose.orientation.w,
        ),
    )
}

fn to_xr_fov(fov: Fov) -> xr::Fovf {
    xr::Fovf {
        angle_left: fov.angle_left,
        angle_right: fov.angle_right,
        angle_up: fov.angle_up,
        angle_down: fov.angle_down,
    }
}

fn form_factor(ff: FormFactor) -> xr::FormFactor {
    match ff {
        FormFactor::HeadMountedDisplay => xr::FormFactor::HEAD_MOUNTED_DISPLAY,
        FormFactor::HandheldDisplay => xr::FormFactor::HANDHELD_DISPLAY,
    }
}

fn view_configuration(ty: ViewConfigurationType) -> xr::ViewConfigurationType {
    match ty {
        ViewConfigurationType::PrimaryMono => xr::ViewConfigurationType::PRIMARY_MONO,
        ViewConfigurationType::PrimaryStereo => xr::ViewConfigurationType::PRIMARY_STEREO,
    }
}

fn blend_mode(mode: BlendMode) -> xr::EnvironmentBlendMode {
    match mode {
        BlendMode::Opaque => xr::EnvironmentBlendMode::OPAQUE,
        BlendMode::Additive => xr::EnvironmentBlendMode::ADDITIVE,
        BlendMode::AlphaBlend => xr::EnvironmentBlendMode::ALPHA_BLEND,
    }
}

fn reference_space(ty: ReferenceSpaceType) -> xr::ReferenceSpaceType {
    match ty {
        ReferenceSpaceType::Local => xr::ReferenceSpaceType::LOCAL,
        ReferenceSpaceType::Stage => xr::ReferenceSpaceType::STAGE,
        ReferenceSpaceType::View => xr::ReferenceSpaceType::VIEW,
    }
}

fn reference_space_from(ty: xr::ReferenceSpaceType) -> ReferenceSpaceType {
    match ty {
        xr::ReferenceSpaceType::STAGE => ReferenceSpaceType::Stage,
        xr::ReferenceSpaceType::VIEW => ReferenceSpaceType::View,
        _ => ReferenceSpaceType::Local,
    }
}

fn session_state(state: xr::SessionState) -> SessionState {
    match state {
        xr::SessionState::IDLE => SessionState::Idle,
        xr::SessionState::READY => SessionState::Ready,
        xr::SessionState::SYNCHRONIZED => SessionState::Synchronized,
        xr::SessionState::VISIBLE => SessionState::Visible,
        xr::SessionState::FOCUSED => SessionState::Focused,
        xr::SessionState::STOPPING => SessionState::Stopping,
        xr::SessionState::LOSS_PENDING => SessionState::LossPending,
        xr::SessionState::EXITING => SessionState::Exiting,
        _ => SessionState::Unknown,
    }
}

fn version(v: xr::Version) -> Version {
    Version::new(v.major(), v.minor(), v.patch())
}

// ── Extension sets ─────────────────────────────────────────

/// Names of the extensions this backend knows how to enable, read from a
/// typed extension set.
fn extension_names(set: &xr::ExtensionSet) -> Vec<String> {
    let known = [
        ("XR_KHR_opengl_enable", set.khr_opengl_enable),
        ("XR_MND_headless", set.mnd_headless),
        ("XR_EXT_debug_utils", set.ext_debug_utils),
        (
            "XR_KHR_composition_layer_depth",
            set.khr_composition_layer_depth,
        ),
    ];
    let mut names: Vec<String> = known
        .iter()
        .filter(|(_, on)| *on)
        .map(|(name, _)| name.to_string())
        .collect();
    names.extend(set.other.iter().cloned());
    names
}

fn extension_set(names: &[String]) -> xr::ExtensionSet {
    let mut set = xr::ExtensionSet::default();
    for name in names {
        match name.as_str() {
            "XR_KHR_opengl_enable" => set.khr_opengl_enable = true,
            "XR_MND_headless" => set.mnd_headless = true,
            "XR_EXT_debug_utils" => set.ext_debug_utils = true,
            "XR_KHR_composition_layer_depth" => set.khr_composition_layer_depth = true,
            other => set.other.push(other.to_string()),
        }
    }
    set
}

// ── Debug messenger ────────────────────────────────────────

unsafe fn lossy(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

/// Runtime-invoked callback; forwards into the channel given at creation.
unsafe extern "system" fn debug_callback(
    severity: xr::sys::DebugUtilsMessageSeverityFlagsEXT,
    _types: xr::sys::DebugUtilsMessageTypeFlagsEXT,
    data: *const xr::sys::DebugUtilsMessengerCallbackDataEXT,
    user_data: *mut c_void,
) -> xr::sys::Bool32 {
    if data.is_null() || user_data.is_null() {
        return xr::sys::FALSE;
    }
    let sink = &*(user_data as *const Sender<DebugMessage>);
    let data = &*data;
    let severity = if severity.contains(xr::sys::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        DebugSeverity::Error
    } else if severity.contains(xr::sys::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        DebugSeverity::Warning
    } else if severity.contains(xr::sys::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        DebugSeverity::Info
    } else {
        DebugSeverity::Verbose
    };
    let _ = sink.send(DebugMessage {
        severity,
        message_id: lossy(data.message_id),
        function_name: lossy(data.function_name),
        message: lossy(data.message),
    });
    xr::sys::FALSE
}

struct Messenger {
    id: MessengerId,
    raw: xr::sys::DebugUtilsMessengerEXT,
    sink: *mut Sender<DebugMessage>,
}

// ── Owned objects ──────────────────────────────────────────

enum AnyAction {
    Pose(xr::Action<xr::Posef>),
    Boolean(xr::Action<bool>),
    Float(xr::Action<f32>),
    Haptic(xr::Action<xr::Haptic>),
}

impl AnyAction {
    fn action_type(&self) -> ActionType {
        match self {
            Self::Pose(_) => ActionType::Pose,
            Self::Boolean(_) => ActionType::Boolean,
            Self::Float(_) => ActionType::Float,
            Self::Haptic(_) => ActionType::Vibration,
        }
    }
}

fn mismatch(expected: ActionType, actual: &AnyAction) -> RuntimeError {
    RuntimeError::ActionTypeMismatch {
        expected: expected.as_str(),
        actual: actual.action_type().as_str(),
    }
}

struct LiveSession {
    id: SessionId,
    session: xr::Session<xr::OpenGL>,
    waiter: xr::FrameWaiter,
    stream: xr::FrameStream<xr::OpenGL>,
}

/// The real runtime, reached through the dynamically loaded loader.
pub struct OpenXrRuntime {
    entry: xr::Entry,
    instance: Option<xr::Instance>,
    system: Option<xr::SystemId>,
    messenger: Option<Messenger>,
    action_sets: HashMap<ActionSetId, xr::ActionSet>,
    actions: HashMap<ActionId, AnyAction>,
    session: Option<LiveSession>,
    spaces: HashMap<SpaceId, xr::Space>,
    swapchains: HashMap<SwapchainId, xr::Swapchain<xr::OpenGL>>,
    event_buffer: xr::EventDataBuffer,
    next_id: u64,
}

impl OpenXrRuntime {
    /// Open the system OpenXR loader.
    pub fn load() -> anyhow::Result<Self> {
        // SAFETY: loading the loader library runs its initializers, which
        // the OpenXR loader contract allows from any thread.
        let entry = unsafe { xr::Entry::load() }
            .map_err(|e| anyhow::anyhow!("VR: failed to load OpenXR loader: {}", e))?;
        info!("VR: OpenXR loader loaded");
        Ok(Self {
            entry,
            instance: None,
            system: None,
            messenger: None,
            action_sets: HashMap::new(),
            actions: HashMap::new(),
            session: None,
            spaces: HashMap::new(),
            swapchains: HashMap::new(),
            event_buffer: xr::EventDataBuffer::new(),
            next_id: 1,
        })
    }

    fn next_handle(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn instance(&self) -> XrResult<&xr::Instance> {
        self.instance.as_ref().ok_or(RuntimeError::HandleInvalid)
    }

    fn system_id(&self) -> XrResult<xr::SystemId> {
        self.system
            .ok_or(RuntimeError::CallOrderInvalid("system not resolved"))
    }

    fn live(&self, id: SessionId) -> XrResult<&LiveSession> {
        match self.session.as_ref() {
            Some(s) if s.id == id => Ok(s),
            _ => Err(RuntimeError::HandleInvalid),
        }
    }

    fn live_mut(&mut self, id: SessionId) -> XrResult<&mut LiveSession> {
        match self.session.as_mut() {
            Some(s) if s.id == id => Ok(s),
            _ => Err(RuntimeError::HandleInvalid),
        }
    }

    fn action(&self, id: ActionId) -> XrResult<&AnyAction> {
        self.actions.get(&id).ok_or(RuntimeError::HandleInvalid)
    }

    fn swapchain_mut(&mut self, id: SwapchainId) -> XrResult<&mut xr::Swapchain<xr::OpenGL>> {
        self.swapchains.get_mut(&id).ok_or(RuntimeError::HandleInvalid)
    }

    fn destroy_messenger(&mut self) -> bool {
        let Some(messenger) = self.messenger.take() else {
            return false;
        };
        if let Some(instance) = self.instance.as_ref() {
            if let Some(debug_utils) = instance.exts().ext_debug_utils.as_ref() {
                // SAFETY: the messenger was created on this instance and is
                // destroyed exactly once.
                let result = unsafe { (debug_utils.destroy_debug_utils_messenger)(messenger.raw) };
                if result.into_raw() < 0 {
                    warn!("VR: debug messenger destroy returned {:?}", result);
                }
            }
        }
        // SAFETY: the runtime no longer holds the pointer once the
        // messenger is destroyed (or the instance is gone).
        drop(unsafe { Box::from_raw(messenger.sink) });
        debug!("VR: debug messenger {} destroyed", messenger.id.0);
        true
    }
}

impl Drop for OpenXrRuntime {
    fn drop(&mut self) {
        self.swapchains.clear();
        self.spaces.clear();
        self.session = None;
        self.actions.clear();
        self.action_sets.clear();
        self.destroy_messenger();
        self.instance = None;
    }
}

impl XrRuntime for OpenXrRuntime {
    fn enumerate_api_layers(&mut self) -> XrResult<Vec<String>> {
        Ok(self
            .entry
            .enumerate_layers()?
            .into_iter()
            .map(|l| l.layer_name)
            .collect())
    }

    fn enumerate_extensions(&mut self) -> XrResult<Vec<String>> {
        let set = self.entry.enumerate_extensions()?;
        Ok(extension_names(&set))
    }

    fn create_instance(
        &mut self,
        app: &ApplicationInfo,
        extensions: &[String],
        api_layers: &[String],
    ) -> XrResult<InstanceProperties> {
        if self.instance.is_some() {
            return Err(RuntimeError::CallOrderInvalid("instance already created"));
        }
        let app_info = xr::ApplicationInfo {
            application_name: &app.application_name,
            application_version: app.application_version,
            engine_name: &app.engine_name,
            engine_version: app.engine_version,
            api_version: xr::Version::new(
                app.api_version.major,
                app.api_version.minor,
                app.api_version.patch,
            ),
        };
        let layers: Vec<&str> = api_layers.iter().map(String::as_str).collect();
        let instance = self
            .entry
            .create_instance(&app_info, &extension_set(extensions), &layers)?;
        let props = instance.properties()?;
        self.instance = Some(instance);
        Ok(InstanceProperties {
            runtime_name: props.runtime_name,
            runtime_version: version(props.runtime_version),
        })
    }

    fn create_debug_messenger(&mut self, sink: Sender<DebugMessage>) -> XrResult<MessengerId> {
        let instance = self.instance()?;
        let debug_utils = instance
            .exts()
            .ext_debug_utils
            .as_ref()
            .ok_or_else(|| RuntimeError::ExtensionNotPresent("XR_EXT_debug_utils".to_string()))?;

        let sink = Box::into_raw(Box::new(sink));
        let info = xr::sys::DebugUtilsMessengerCreateInfoEXT {
            ty: xr::sys::DebugUtilsMessengerCreateInfoEXT::TYPE,
            next: std::ptr::null(),
            message_severities: xr::sys::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | xr::sys::DebugUtilsMessageSeverityFlagsEXT::INFO
                | xr::sys::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | xr::sys::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            message_types: xr::sys::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | xr::sys::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | xr::sys::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                | xr::sys::DebugUtilsMessageTypeFlagsEXT::CONFORMANCE,
            user_callback: Some(debug_callback),
            user_data: sink as *mut c_void,
        };
        let mut raw = xr::sys::DebugUtilsMessengerEXT::NULL;
        // SAFETY: `info` is fully initialized and `sink` outlives the
        // messenger (freed in `destroy_messenger`).
        let result = unsafe {
            (debug_utils.create_debug_utils_messenger)(instance.as_raw(), &info, &mut raw)
        };
        if result.into_raw() < 0 {
            drop(unsafe { Box::from_raw(sink) });
            return Err(result.into());
        }
        let id = MessengerId(self.next_handle());
        self.messenger = Some(Messenger { id, raw, sink });
        Ok(id)
    }

    fn system(&mut self, ff: FormFactor) -> XrResult<SystemDescriptor> {
        let instance = self.instance()?;
        let system = instance.system(form_factor(ff))?;
        let props = instance.system_properties(system)?;
        self.system = Some(system);
        Ok(SystemDescriptor {
            system_id: props.system_id.into_raw(),
            form_factor: ff,
            system_name: props.system_name,
            vendor_id: props.vendor_id,
            max_swapchain_width: props.graphics_properties.max_swapchain_image_width,
            max_swapchain_height: props.graphics_properties.max_swapchain_image_height,
            max_layer_count: props.graphics_properties.max_layer_count,
            orientation_tracking: props.tracking_properties.orientation_tracking,
            position_tracking: props.tracking_properties.position_tracking,
        })
    }

    fn string_to_path(&mut self, path: &str) -> XrResult<XrPath> {
        Ok(XrPath(self.instance()?.string_to_path(path)?.into_raw()))
    }

    fn path_to_string(&mut self, path: XrPath) -> XrResult<String> {
        Ok(self
            .instance()?
            .path_to_string(xr::Path::from_raw(path.0))?)
    }

    fn create_action_set(
        &mut self,
        name: &str,
        localized_name: &str,
        priority: u32,
    ) -> XrResult<ActionSetId> {
        let set = self
            .instance()?
            .create_action_set(name, localized_name, priority)?;
        let id = ActionSetId(self.next_handle());
        self.action_sets.insert(id, set);
        Ok(id)
    }

    fn create_action(
        &mut self,
        set: ActionSetId,
        name: &str,
        localized_name: &str,
        ty: ActionType,
        subaction_paths: &[XrPath],
    ) -> XrResult<ActionId> {
        let set = self.action_sets.get(&set).ok_or(RuntimeError::HandleInvalid)?;
        let paths: Vec<xr::Path> = subaction_paths
            .iter()
            .map(|p| xr::Path::from_raw(p.0))
            .collect();
        let action = match ty {
            ActionType::Pose => {
                AnyAction::Pose(set.create_action::<xr::Posef>(name, localized_name, &paths)?)
            }
            ActionType::Boolean => {
                AnyAction::Boolean(set.create_action::<bool>(name, localized_name, &paths)?)
            }
            ActionType::Float => {
                AnyAction::Float(set.create_action::<f32>(name, localized_name, &paths)?)
            }
            ActionType::Vibration => {
                AnyAction::Haptic(set.create_action::<xr::Haptic>(name, localized_name, &paths)?)
            }
        };
        let id = ActionId(self.next_handle());
        self.actions.insert(id, action);
        Ok(id)
    }

    fn suggest_bindings(
        &mut self,
        profile: XrPath,
        bindings: &[(ActionId, XrPath)],
    ) -> XrResult<()> {
        let mut suggested = Vec::with_capacity(bindings.len());
        for (action, path) in bindings {
            let path = xr::Path::from_raw(path.0);
            suggested.push(match self.action(*action)? {
                AnyAction::Pose(a) => xr::Binding::new(a, path),
                AnyAction::Boolean(a) => xr::Binding::new(a, path),
                AnyAction::Float(a) => xr::Binding::new(a, path),
                AnyAction::Haptic(a) => xr::Binding::new(a, path),
            });
        }
        self.instance()?
            .suggest_interaction_profile_bindings(xr::Path::from_raw(profile.0), &suggested)?;
        Ok(())
    }

    fn enumerate_view_configurations(&mut self) -> XrResult<Vec<ViewConfigurationType>> {
        let system = self.system_id()?;
        Ok(self
            .instance()?
            .enumerate_view_configurations(system)?
            .into_iter()
            .filter_map(|ty| match ty {
                xr::ViewConfigurationType::PRIMARY_MONO => Some(ViewConfigurationType::PrimaryMono),
                xr::ViewConfigurationType::PRIMARY_STEREO => {
                    Some(ViewConfigurationType::PrimaryStereo)
                }
                _ => None,
            })
            .collect())
    }

    fn enumerate_view_configuration_views(
        &mut self,
        ty: ViewConfigurationType,
    ) -> XrResult<Vec<ViewConfigurationView>> {
        let system = self.system_id()?;
        Ok(self
            .instance()?
            .enumerate_view_configuration_views(system, view_configuration(ty))?
            .into_iter()
            .map(|v| ViewConfigurationView {
                recommended_width: v.recommended_image_rect_width,
                recommended_height: v.recommended_image_rect_height,
                recommended_sample_count: v.recommended_swapchain_sample_count,
                max_width: v.max_image_rect_width,
                max_height: v.max_image_rect_height,
                max_sample_count: v.max_swapchain_sample_count,
            })
            .collect())
    }

    fn enumerate_blend_modes(&mut self, ty: ViewConfigurationType) -> XrResult<Vec<BlendMode>> {
        let system = self.system_id()?;
        Ok(self
            .instance()?
            .enumerate_environment_blend_modes(system, view_configuration(ty))?
            .into_iter()
            .filter_map(|mode| match mode {
                xr::EnvironmentBlendMode::OPAQUE => Some(BlendMode::Opaque),
                xr::EnvironmentBlendMode::ADDITIVE => Some(BlendMode::Additive),
                xr::EnvironmentBlendMode::ALPHA_BLEND => Some(BlendMode::AlphaBlend),
                _ => None,
            })
            .collect())
    }

    fn create_session(&mut self, binding: &GraphicsBinding) -> XrResult<SessionId> {
        if self.session.is_some() {
            return Err(RuntimeError::CallOrderInvalid("session already exists"));
        }
        let system = self.system_id()?;
        let instance = self.instance()?;
        let info = match *binding {
            GraphicsBinding::OpenGlXlib {
                x_display,
                visual_id,
                glx_fb_config,
                glx_drawable,
                glx_context,
            } => xr::opengl::SessionCreateInfo::Xlib {
                x_display: x_display as *mut _,
                visualid: visual_id,
                glx_fb_config: glx_fb_config as *mut _,
                glx_drawable: glx_drawable as _,
                glx_context: glx_context as *mut _,
            },
            GraphicsBinding::OpenGlWin32 { h_dc, h_glrc } => {
                xr::opengl::SessionCreateInfo::Windows {
                    h_dc: h_dc as *mut _,
                    h_glrc: h_glrc as *mut _,
                }
            }
            GraphicsBinding::Headless => {
                return Err(RuntimeError::GraphicsBindingUnsupported(binding.as_str()))
            }
        };

        // The runtime rejects session creation until the requirements have
        // been queried.
        let reqs = instance.graphics_requirements::<xr::OpenGL>(system)?;
        debug!(
            "VR: OpenGL requirements {}..{}",
            reqs.min_api_version_supported, reqs.max_api_version_supported
        );

        // SAFETY: the handles come from the host's current GL context, which
        // must stay alive for the session's lifetime.
        let (session, waiter, stream) =
            unsafe { instance.create_session::<xr::OpenGL>(system, &info)? };
        let id = SessionId(self.next_handle());
        self.session = Some(LiveSession {
            id,
            session,
            waiter,
            stream,
        });
        Ok(id)
    }

    fn attach_action_sets(&mut self, session: SessionId, sets: &[ActionSetId]) -> XrResult<()> {
        let sets: Vec<&xr::ActionSet> = sets
            .iter()
            .map(|id| self.action_sets.get(id).ok_or(RuntimeError::HandleInvalid))
            .collect::<XrResult<_>>()?;
        self.live(session)?.session.attach_action_sets(&sets)?;
        Ok(())
    }

    fn create_action_space(
        &mut self,
        session: SessionId,
        action: ActionId,
        subaction_path: XrPath,
        pose_in_action_space: Pose,
    ) -> XrResult<SpaceId> {
        let live = self.live(session)?;
        let space = match self.action(action)? {
            AnyAction::Pose(a) => a.create_space(
                live.session.clone(),
                xr::Path::from_raw(subaction_path.0),
                to_xr_pose(pose_in_action_space),
            )?,
            other => return Err(mismatch(ActionType::Pose, other)),
        };
        let id = SpaceId(self.next_handle());
        self.spaces.insert(id, space);
        Ok(id)
    }

    fn create_reference_space(
        &mut self,
        session: SessionId,
        ty: ReferenceSpaceType,
        pose_in_reference_space: Pose,
    ) -> XrResult<SpaceId> {
        let space = self
            .live(session)?
            .session
            .create_reference_space(reference_space(ty), to_xr_pose(pose_in_reference_space))?;
        let id = SpaceId(self.next_handle());
        self.spaces.insert(id, space);
        Ok(id)
    }

    fn enumerate_swapchain_formats(&mut self, session: SessionId) -> XrResult<Vec<i64>> {
        Ok(self
            .live(session)?
            .session
            .enumerate_swapchain_formats()?
            .into_iter()
            .map(i64::from)
            .collect())
    }

    fn create_swapchain(
        &mut self,
        session: SessionId,
        info: &SwapchainCreateInfo,
    ) -> XrResult<SwapchainId> {
        let mut usage = xr::SwapchainUsageFlags::EMPTY;
        if info.color_attachment {
            usage |= xr::SwapchainUsageFlags::COLOR_ATTACHMENT;
        }
        if info.sampled {
            usage |= xr::SwapchainUsageFlags::SAMPLED;
        }
        let format = u32::try_from(info.format).map_err(|_| {
            RuntimeError::ValidationFailure(format!("format {:#x} out of range", info.format))
        })?;
        let swapchain = self
            .live(session)?
            .session
            .create_swapchain(&xr::SwapchainCreateInfo {
                create_flags: xr::SwapchainCreateFlags::EMPTY,
                usage_flags: usage,
                format,
                sample_count: info.sample_count,
                width: info.width,
                height: info.height,
                face_count: info.face_count,
                array_size: info.array_size,
                mip_count: info.mip_count,
            })?;
        let id = SwapchainId(self.next_handle());
        self.swapchains.insert(id, swapchain);
        Ok(id)
    }

    fn enumerate_swapchain_images(&mut self, swapchain: SwapchainId) -> XrResult<Vec<u32>> {
        Ok(self.swapchain_mut(swapchain)?.enumerate_images()?)
    }

    fn poll_event(&mut self) -> XrResult<Option<XrEvent>> {
        let current = self.session.as_ref().map(|s| (s.session.as_raw(), s.id));
        let session_id = |raw: xr::sys::Session| match current {
            Some((live, id)) if live == raw => id,
            _ => SessionId(0),
        };
        let instance = self.instance.as_ref().ok_or(RuntimeError::HandleInvalid)?;
        let event = match instance.poll_event(&mut self.event_buffer)? {
            None => return Ok(None),
            Some(xr::Event::EventsLost(e)) => XrEvent::EventsLost {
                lost_event_count: e.lost_event_count(),
            },
            Some(xr::Event::InstanceLossPending(e)) => XrEvent::InstanceLossPending {
                loss_time: XrTime(e.loss_time().as_nanos()),
            },
            Some(xr::Event::SessionStateChanged(e)) => XrEvent::SessionStateChanged {
                session: session_id(e.session()),
                state: session_state(e.state()),
                time: XrTime(e.time().as_nanos()),
            },
            Some(xr::Event::InteractionProfileChanged(e)) => XrEvent::InteractionProfileChanged {
                session: session_id(e.session()),
            },
            Some(xr::Event::ReferenceSpaceChangePending(e)) => {
                XrEvent::ReferenceSpaceChangePending {
                    session: session_id(e.session()),
                    reference_space_type: reference_space_from(e.reference_space_type()),
                    change_time: XrTime(e.change_time().as_nanos()),
                }
            }
            Some(_) => XrEvent::Other,
        };
        Ok(Some(event))
    }

    fn begin_session(&mut self, session: SessionId, ty: ViewConfigurationType) -> XrResult<()> {
        self.live(session)?.session.begin(view_configuration(ty))?;
        Ok(())
    }

    fn end_session(&mut self, session: SessionId) -> XrResult<()> {
        self.live(session)?.session.end()?;
        Ok(())
    }

    fn request_exit_session(&mut self, session: SessionId) -> XrResult<()> {
        self.live(session)?.session.request_exit()?;
        Ok(())
    }

    fn current_interaction_profile(
        &mut self,
        session: SessionId,
        top_level_path: XrPath,
    ) -> XrResult<Option<XrPath>> {
        let path = self
            .live(session)?
            .session
            .current_interaction_profile(xr::Path::from_raw(top_level_path.0))?;
        Ok((path != xr::Path::NULL).then(|| XrPath(path.into_raw())))
    }

    fn sync_actions(&mut self, session: SessionId, sets: &[ActionSetId]) -> XrResult<()> {
        let active: Vec<xr::ActiveActionSet> = sets
            .iter()
            .map(|id| {
                self.action_sets
                    .get(id)
                    .map(xr::ActiveActionSet::new)
                    .ok_or(RuntimeError::HandleInvalid)
            })
            .collect::<XrResult<_>>()?;
        self.live(session)?.session.sync_actions(&active)?;
        Ok(())
    }

    fn action_state_boolean(
        &mut self,
        session: SessionId,
        action: ActionId,
        subaction_path: XrPath,
    ) -> XrResult<ActionState<bool>> {
        let live = self.live(session)?;
        match self.action(action)? {
            AnyAction::Boolean(a) => {
                let s = a.state(&live.session, xr::Path::from_raw(subaction_path.0))?;
                Ok(ActionState {
                    current_state: s.current_state,
                    changed_since_last_sync: s.changed_since_last_sync,
                    is_active: s.is_active,
                })
            }
            other => Err(mismatch(ActionType::Boolean, other)),
        }
    }

    fn action_state_float(
        &mut self,
        session: SessionId,
        action: ActionId,
        subaction_path: XrPath,
    ) -> XrResult<ActionState<f32>> {
        let live = self.live(session)?;
        match self.action(action)? {
            AnyAction::Float(a) => {
                let s = a.state(&live.session, xr::Path::from_raw(subaction_path.0))?;
                Ok(ActionState {
                    current_state: s.current_state,
                    changed_since_last_sync: s.changed_since_last_sync,
                    is_active: s.is_active,
                })
            }
            other => Err(mismatch(ActionType::Float, other)),
        }
    }

    fn action_state_pose(
        &mut self,
        session: SessionId,
        action: ActionId,
        subaction_path: XrPath,
    ) -> XrResult<bool> {
        let live = self.live(session)?;
        match self.action(action)? {
            AnyAction::Pose(a) => Ok(a.is_active(&live.session, xr::Path::from_raw(subaction_path.0))?),
            other => Err(mismatch(ActionType::Pose, other)),
        }
    }

    fn locate_space(
        &mut self,
        space: SpaceId,
        base: SpaceId,
        time: XrTime,
    ) -> XrResult<SpaceLocation> {
        let space = self.spaces.get(&space).ok_or(RuntimeError::HandleInvalid)?;
        let base = self.spaces.get(&base).ok_or(RuntimeError::HandleInvalid)?;
        let location = space.locate(base, xr::Time::from_nanos(time.0))?;
        Ok(SpaceLocation {
            pose: from_xr_pose(location.pose),
            position_valid: location
                .location_flags
                .contains(xr::SpaceLocationFlags::POSITION_VALID),
            orientation_valid: location
                .location_flags
                .contains(xr::SpaceLocationFlags::ORIENTATION_VALID),
        })
    }

    fn apply_haptic_feedback(
        &mut self,
        session: SessionId,
        action: ActionId,
        subaction_path: XrPath,
        vibration: &HapticVibration,
    ) -> XrResult<()> {
        let live = self.live(session)?;
        let duration = vibration
            .duration_ns
            .map_or(xr::Duration::MIN_HAPTIC, xr::Duration::from_nanos);
        let event = xr::HapticVibration::new()
            .amplitude(vibration.amplitude)
            .duration(duration)
            .frequency(vibration.frequency.unwrap_or(0.0));
        match self.action(action)? {
            AnyAction::Haptic(a) => {
                a.apply_feedback(&live.session, xr::Path::from_raw(subaction_path.0), &event)?;
                Ok(())
            }
            other => Err(mismatch(ActionType::Vibration, other)),
        }
    }

    fn wait_frame(&mut self, session: SessionId) -> XrResult<FrameState> {
        let state = self.live_mut(session)?.waiter.wait()?;
        Ok(FrameState {
            predicted_display_time: XrTime(state.predicted_display_time.as_nanos()),
            predicted_display_period_ns: state.predicted_display_period.as_nanos(),
            should_render: state.should_render,
        })
    }

    fn begin_frame(&mut self, session: SessionId) -> XrResult<()> {
        self.live_mut(session)?.stream.begin()?;
        Ok(())
    }

    fn locate_views(
        &mut self,
        session: SessionId,
        ty: ViewConfigurationType,
        time: XrTime,
        space: SpaceId,
    ) -> XrResult<Vec<View>> {
        let space = self.spaces.get(&space).ok_or(RuntimeError::HandleInvalid)?;
        let (_flags, views) = self.live(session)?.session.locate_views(
            view_configuration(ty),
            xr::Time::from_nanos(time.0),
            space,
        )?;
        Ok(views
            .into_iter()
            .map(|v| View {
                pose: from_xr_pose(v.pose),
                fov: Fov {
                    angle_left: v.fov.angle_left,
                    angle_right: v.fov.angle_right,
                    angle_up: v.fov.angle_up,
                    angle_down: v.fov.angle_down,
                },
            })
            .collect())
    }

    fn acquire_swapchain_image(&mut self, swapchain: SwapchainId) -> XrResult<u32> {
        Ok(self.swapchain_mut(swapchain)?.acquire_image()?)
    }

    fn wait_swapchain_image(&mut self, swapchain: SwapchainId) -> XrResult<()> {
        self.swapchain_mut(swapchain)?
            .wait_image(xr::Duration::INFINITE)?;
        Ok(())
    }

    fn release_swapchain_image(&mut self, swapchain: SwapchainId) -> XrResult<()> {
        self.swapchain_mut(swapchain)?.release_image()?;
        Ok(())
    }

    fn end_frame(
        &mut self,
        session: SessionId,
        display_time: XrTime,
        mode: BlendMode,
        layers: &[CompositionLayer],
    ) -> XrResult<()> {
        let live = match self.session.as_mut() {
            Some(s) if s.id == session => s,
            _ => return Err(RuntimeError::HandleInvalid),
        };
        let time = xr::Time::from_nanos(display_time.0);

        // Projection views borrow their swapchains, so build them all before
        // the layers that point at them.
        let mut view_sets: Vec<Vec<xr::CompositionLayerProjectionView<xr::OpenGL>>> =
            Vec::with_capacity(layers.len());
        for layer in layers {
            let CompositionLayer::Projection(projection) = layer;
            let mut views = Vec::with_capacity(projection.views.len());
            for view in &projection.views {
                let swapchain = self
                    .swapchains
                    .get(&view.sub_image.swapchain)
                    .ok_or(RuntimeError::HandleInvalid)?;
                let rect = view.sub_image.rect;
                views.push(
                    xr::CompositionLayerProjectionView::new()
                        .pose(to_xr_pose(view.pose))
                        .fov(to_xr_fov(view.fov))
                        .sub_image(
                            xr::SwapchainSubImage::new()
                                .swapchain(swapchain)
                                .image_array_index(view.sub_image.array_index)
                                .image_rect(xr::Rect2Di {
                                    offset: xr::Offset2Di {
                                        x: rect.x,
                                        y: rect.y,
                                    },
                                    extent: xr::Extent2Di {
                                        width: rect.width,
                                        height: rect.height,
                                    },
                                }),
                        ),
                );
            }
            view_sets.push(views);
        }

        let mut projections = Vec::with_capacity(layers.len());
        for (layer, views) in layers.iter().zip(&view_sets) {
            let CompositionLayer::Projection(projection) = layer;
            let space = self
                .spaces
                .get(&projection.space)
                .ok_or(RuntimeError::HandleInvalid)?;
            let flags = if projection.blend_texture_source_alpha {
                xr::CompositionLayerFlags::BLEND_TEXTURE_SOURCE_ALPHA
            } else {
                xr::CompositionLayerFlags::EMPTY
            };
            projections.push(
                xr::CompositionLayerProjection::new()
                    .layer_flags(flags)
                    .space(space)
                    .views(views.as_slice()),
            );
        }
        let refs: Vec<&xr::CompositionLayerBase<xr::OpenGL>> =
            projections.iter().map(|p| &**p).collect();

        live.stream.end(time, blend_mode(mode), &refs)?;
        Ok(())
    }

    fn destroy(&mut self, handle: Handle) -> XrResult<()> {
        let found = match handle {
            Handle::Instance => {
                self.swapchains.clear();
                self.spaces.clear();
                self.session = None;
                self.actions.clear();
                self.action_sets.clear();
                self.destroy_messenger();
                self.system = None;
                self.instance.take().is_some()
            }
            Handle::Messenger(_) => self.destroy_messenger(),
            Handle::ActionSet(id) => {
                // Actions are owned by their set and go with it.
                self.actions.clear();
                self.action_sets.remove(&id).is_some()
            }
            Handle::Session(id) => {
                if self.session.as_ref().is_some_and(|s| s.id == id) {
                    self.session = None;
                    true
                } else {
                    false
                }
            }
            Handle::Space(id) => self.spaces.remove(&id).is_some(),
            Handle::Swapchain(id) => self.swapchains.remove(&id).is_some(),
        };
        if found {
            Ok(())
        } else {
            Err(RuntimeError::HandleInvalid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_mapping() {
        assert_eq!(
            RuntimeError::from(xr::sys::Result::ERROR_FORM_FACTOR_UNAVAILABLE),
            RuntimeError::FormFactorUnavailable
        );
        assert_eq!(
            RuntimeError::from(xr::sys::Result::ERROR_SESSION_NOT_READY),
            RuntimeError::SessionNotReady
        );
        assert!(RuntimeError::from(xr::sys::Result::ERROR_SESSION_LOST).is_loss());
        assert!(matches!(
            RuntimeError::from(xr::sys::Result::ERROR_RUNTIME_FAILURE),
            RuntimeError::Other { .. }
        ));
    }

    #[test]
    fn test_extension_set_round_trip() {
        let names = vec![
            "XR_KHR_opengl_enable".to_string(),
            "XR_EXT_debug_utils".to_string(),
            "XR_FB_unknown_thing".to_string(),
        ];
        let set = extension_set(&names);
        assert!(set.khr_opengl_enable);
        assert!(set.ext_debug_utils);
        assert!(!set.mnd_headless);
        assert_eq!(extension_names(&set), names);
    }

    #[test]
    fn test_pose_conversion() {
        let pose = Pose::new(glam::Vec3::new(1.0, 2.0, 3.0), glam::Quat::from_rotation_y(0.5));
        assert_eq!(from_xr_pose(to_xr_pose(pose)), pose);
    }
}
