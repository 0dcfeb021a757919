//! In-process simulated XR runtime.
//!
//! Implements [`XrRuntime`] without a loader or a headset. It enforces the
//! same ordering rules a conforming runtime does (frame pairing, the image
//! acquire/wait/release discipline, session begin/end state checks, typed
//! action queries) and records every protocol call so tests can assert on
//! order and counts. The CLI uses it for `--runtime sim`.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::Sender;
use std::time::Duration;

use glam::Vec3;
use tracing::{debug, trace};

use super::error::{RuntimeError, XrResult};
use super::runtime::{
    ActionId, ActionSetId, CompositionLayer, GraphicsBinding, Handle, MessengerId, SessionId,
    SpaceId, SwapchainCreateInfo, SwapchainId, XrEvent, XrPath, XrRuntime, GL_RGBA8,
    GL_SRGB8_ALPHA8,
};
use super::types::{
    ActionState, ActionType, ApplicationInfo, BlendMode, DebugMessage, FormFactor, Fov,
    FrameState, HapticVibration, InstanceProperties, Pose, ReferenceSpaceType, SessionState,
    SpaceLocation, SystemDescriptor, Version, View, ViewConfigurationType, ViewConfigurationView,
    XrTime,
};

/// Half the simulated interpupillary distance, in meters.
const HALF_IPD: f32 = 0.032;
const FIRST_DISPLAY_TIME_NS: i64 = 1_000_000_000;

// ── Configuration ──────────────────────────────────────────

/// What the simulated runtime advertises and how it behaves.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub runtime_name: String,
    pub runtime_version: Version,
    pub api_layers: Vec<String>,
    pub extensions: Vec<String>,
    pub form_factors: Vec<FormFactor>,
    pub system_name: String,
    pub view_configurations: Vec<ViewConfigurationType>,
    pub view_recommendation: ViewConfigurationView,
    pub blend_modes: Vec<BlendMode>,
    /// Interaction profiles whose binding suggestions are accepted.
    pub interaction_profiles: Vec<String>,
    pub swapchain_formats: Vec<i64>,
    /// Images per swapchain ring.
    pub swapchain_length: u32,
    /// Time spent inside each swapchain image wait.
    pub gpu_delay: Duration,
    pub display_period_ns: i64,
    /// Queue the lifecycle events a runtime would emit on its own.
    pub auto_lifecycle: bool,
    /// Head pose in the reference space; views are offset from it.
    pub head_pose: Pose,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            runtime_name: "Simulated Runtime".to_string(),
            runtime_version: Version::new(1, 0, 0),
            api_layers: vec!["XR_APILAYER_LUNARG_core_validation".to_string()],
            extensions: vec![
                "XR_KHR_opengl_enable".to_string(),
                "XR_MND_headless".to_string(),
                "XR_EXT_debug_utils".to_string(),
                "XR_KHR_composition_layer_depth".to_string(),
            ],
            form_factors: vec![FormFactor::HeadMountedDisplay],
            system_name: "Simulated HMD".to_string(),
            view_configurations: vec![
                ViewConfigurationType::PrimaryStereo,
                ViewConfigurationType::PrimaryMono,
            ],
            view_recommendation: ViewConfigurationView {
                recommended_width: 1440,
                recommended_height: 1600,
                recommended_sample_count: 1,
                max_width: 4096,
                max_height: 4096,
                max_sample_count: 4,
            },
            blend_modes: vec![BlendMode::Opaque],
            interaction_profiles: vec![
                "/interaction_profiles/khr/simple_controller".to_string(),
                "/interaction_profiles/oculus/touch_controller".to_string(),
                "/interaction_profiles/valve/index_controller".to_string(),
            ],
            swapchain_formats: vec![GL_RGBA8, GL_SRGB8_ALPHA8],
            swapchain_length: 3,
            gpu_delay: Duration::ZERO,
            display_period_ns: 11_111_111,
            auto_lifecycle: true,
            head_pose: Pose::new(Vec3::new(0.0, 1.6, 0.0), glam::Quat::IDENTITY),
        }
    }
}

// ── Call log ───────────────────────────────────────────────

/// One recorded protocol call. Recorded on entry, before validation.
#[derive(Debug, Clone, PartialEq)]
pub enum SimCall {
    CreateInstance,
    CreateDebugMessenger,
    System,
    CreateActionSet(String),
    CreateAction(String),
    SuggestBindings(String),
    CreateSession,
    AttachActionSets,
    CreateActionSpace,
    CreateReferenceSpace(ReferenceSpaceType),
    CreateSwapchain(SwapchainCreateInfo),
    BeginSession,
    EndSession,
    RequestExitSession,
    CurrentInteractionProfile,
    SyncActions,
    ApplyHaptic { subaction: String, amplitude: f32 },
    WaitFrame,
    BeginFrame,
    LocateViews,
    AcquireImage(SwapchainId),
    WaitImage(SwapchainId),
    ReleaseImage(SwapchainId),
    EndFrame { layer_count: usize, view_count: usize },
    Destroy(Handle),
}

// ── Internal state ─────────────────────────────────────────

#[derive(Debug)]
struct SimAction {
    set: ActionSetId,
    name: String,
    ty: ActionType,
    subaction_paths: Vec<XrPath>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SimInput {
    Boolean(bool),
    Float(f32),
    Pose(bool),
}

#[derive(Debug, Clone, Copy)]
enum SimSpace {
    Reference(ReferenceSpaceType),
    Action { action: ActionId, subaction: XrPath },
}

#[derive(Debug)]
struct SimSwapchain {
    images: Vec<u32>,
    next: u32,
    acquired: Option<u32>,
    waited: bool,
}

#[derive(Debug)]
struct SimSession {
    id: SessionId,
    state: SessionState,
    running: bool,
    exit_requested: bool,
    view_configuration: Option<ViewConfigurationType>,
    attached: Vec<ActionSetId>,
}

#[derive(Debug, Default)]
struct FrameSlot {
    waited: bool,
    began: bool,
    display_time: XrTime,
}

/// The simulated runtime.
pub struct SimRuntime {
    config: SimConfig,
    calls: Vec<SimCall>,
    next_id: u64,
    injected: HashMap<&'static str, RuntimeError>,

    instance: bool,
    enabled_extensions: Vec<String>,
    debug_sink: Option<Sender<DebugMessage>>,
    system: Option<SystemDescriptor>,

    paths: Vec<String>,
    action_sets: HashMap<ActionSetId, String>,
    actions: HashMap<ActionId, SimAction>,
    suggested: Vec<(XrPath, Vec<(ActionId, XrPath)>)>,
    pending_inputs: HashMap<(ActionId, XrPath), SimInput>,
    synced_inputs: HashMap<(ActionId, XrPath), SimInput>,
    changed_inputs: HashMap<(ActionId, XrPath), bool>,
    action_space_locations: HashMap<(ActionId, XrPath), SpaceLocation>,
    current_profiles: HashMap<XrPath, XrPath>,
    haptics: HashMap<XrPath, f32>,

    session: Option<SimSession>,
    spaces: HashMap<SpaceId, SimSpace>,
    swapchains: HashMap<SwapchainId, SimSwapchain>,
    events: VecDeque<XrEvent>,
    frame: FrameSlot,
    frames_ended: u64,
    last_layers: Vec<CompositionLayer>,
}

impl SimRuntime {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            calls: Vec::new(),
            next_id: 1,
            injected: HashMap::new(),
            instance: false,
            enabled_extensions: Vec::new(),
            debug_sink: None,
            system: None,
            paths: Vec::new(),
            action_sets: HashMap::new(),
            actions: HashMap::new(),
            suggested: Vec::new(),
            pending_inputs: HashMap::new(),
            synced_inputs: HashMap::new(),
            changed_inputs: HashMap::new(),
            action_space_locations: HashMap::new(),
            current_profiles: HashMap::new(),
            haptics: HashMap::new(),
            session: None,
            spaces: HashMap::new(),
            swapchains: HashMap::new(),
            events: VecDeque::new(),
            frame: FrameSlot::default(),
            frames_ended: 0,
            last_layers: Vec::new(),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    // ── Test and host controls ─────────────────────────────

    /// Make the next call to `op` (a trait method name) fail with `error`.
    pub fn fail_next(&mut self, op: &'static str, error: RuntimeError) {
        self.injected.insert(op, error);
    }

    pub fn calls(&self) -> &[SimCall] {
        &self.calls
    }

    pub fn count_calls(&self, pred: impl Fn(&SimCall) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    pub fn push_event(&mut self, event: XrEvent) {
        self.events.push_back(event);
    }

    /// Queue a state change for the current session.
    pub fn push_state(&mut self, state: SessionState) {
        if let Some(id) = self.session.as_ref().map(|s| s.id) {
            self.queue_state(id, state);
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn session_state(&self) -> SessionState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(SessionState::Unknown)
    }

    pub fn is_session_running(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.running)
    }

    pub fn enabled_extensions(&self) -> &[String] {
        &self.enabled_extensions
    }

    pub fn has_outstanding_image(&self, swapchain: SwapchainId) -> bool {
        self.swapchains
            .get(&swapchain)
            .is_some_and(|sc| sc.acquired.is_some())
    }

    pub fn frames_ended(&self) -> u64 {
        self.frames_ended
    }

    /// Layers passed to the most recent successful end-frame.
    pub fn last_layers(&self) -> &[CompositionLayer] {
        &self.last_layers
    }

    /// Amplitude of the last vibration applied on a hand path.
    pub fn last_haptic(&self, subaction_path: &str) -> Option<f32> {
        let path = self.lookup_path(subaction_path)?;
        self.haptics.get(&path).copied()
    }

    pub fn set_boolean(&mut self, action: &str, subaction_path: &str, value: bool) {
        self.set_input(action, subaction_path, SimInput::Boolean(value));
    }

    pub fn set_float(&mut self, action: &str, subaction_path: &str, value: f32) {
        self.set_input(action, subaction_path, SimInput::Float(value));
    }

    pub fn set_pose_active(&mut self, action: &str, subaction_path: &str, active: bool) {
        self.set_input(action, subaction_path, SimInput::Pose(active));
    }

    /// Location reported for the action space of `action` on a hand.
    pub fn set_action_space_location(
        &mut self,
        action: &str,
        subaction_path: &str,
        location: SpaceLocation,
    ) {
        if let Some(key) = self.input_key(action, subaction_path) {
            self.action_space_locations.insert(key, location);
        }
    }

    /// Rebind a hand to another profile and notify the application.
    pub fn set_current_profile(&mut self, subaction_path: &str, profile: &str) {
        let hand = self.intern(subaction_path);
        let profile = self.intern(profile);
        self.current_profiles.insert(hand, profile);
        if let Some(session) = self.session_id() {
            self.events
                .push_back(XrEvent::InteractionProfileChanged { session });
        }
    }

    /// Deliver a message on the debug channel, if one is attached.
    pub fn emit_debug(&mut self, message: DebugMessage) -> bool {
        match &self.debug_sink {
            Some(sink) => sink.send(message).is_ok(),
            None => false,
        }
    }

    /// Create instance, system and a headless session, then drive the
    /// lifecycle until the session is focused.
    pub fn bootstrap_running_session(&mut self) -> XrResult<SessionId> {
        let app = ApplicationInfo {
            application_name: "sim".to_string(),
            application_version: 1,
            engine_name: "sim".to_string(),
            engine_version: 1,
            api_version: Version::new(1, 0, 0),
        };
        self.create_instance(&app, &["XR_MND_headless".to_string()], &[])?;
        self.system(FormFactor::HeadMountedDisplay)?;
        let session = self.create_session(&GraphicsBinding::Headless)?;
        self.queue_state(session, SessionState::Idle);
        self.queue_state(session, SessionState::Ready);
        while self.poll_event()?.is_some() {}
        self.begin_session(session, ViewConfigurationType::PrimaryStereo)?;
        self.queue_state(session, SessionState::Synchronized);
        self.queue_state(session, SessionState::Visible);
        self.queue_state(session, SessionState::Focused);
        while self.poll_event()?.is_some() {}
        Ok(session)
    }

    // ── Internals ──────────────────────────────────────────

    fn enter(&mut self, op: &'static str, call: Option<SimCall>) -> XrResult<()> {
        if let Some(call) = call {
            trace!("VR: sim call {:?}", call);
            self.calls.push(call);
        }
        match self.injected.remove(op) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn next_handle(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn intern(&mut self, path: &str) -> XrPath {
        match self.lookup_path(path) {
            Some(p) => p,
            None => {
                self.paths.push(path.to_string());
                XrPath(self.paths.len() as u64)
            }
        }
    }

    fn lookup_path(&self, path: &str) -> Option<XrPath> {
        self.paths
            .iter()
            .position(|p| p == path)
            .map(|i| XrPath(i as u64 + 1))
    }

    fn input_key(&self, action: &str, subaction_path: &str) -> Option<(ActionId, XrPath)> {
        let path = self.lookup_path(subaction_path)?;
        let id = self
            .actions
            .iter()
            .find(|(_, a)| a.name == action)
            .map(|(id, _)| *id)?;
        Some((id, path))
    }

    fn set_input(&mut self, action: &str, subaction_path: &str, input: SimInput) {
        if let Some(key) = self.input_key(action, subaction_path) {
            self.pending_inputs.insert(key, input);
        }
    }

    fn queue_state(&mut self, session: SessionId, state: SessionState) {
        self.events.push_back(XrEvent::SessionStateChanged {
            session,
            state,
            time: XrTime(FIRST_DISPLAY_TIME_NS + self.frames_ended as i64),
        });
    }

    fn require_instance(&self) -> XrResult<()> {
        if self.instance {
            Ok(())
        } else {
            Err(RuntimeError::HandleInvalid)
        }
    }

    fn session_mut(&mut self, id: SessionId) -> XrResult<&mut SimSession> {
        match self.session.as_mut() {
            Some(s) if s.id == id => Ok(s),
            _ => Err(RuntimeError::HandleInvalid),
        }
    }

    fn require_running(&mut self, id: SessionId) -> XrResult<()> {
        if self.session_mut(id)?.running {
            Ok(())
        } else {
            Err(RuntimeError::SessionNotRunning)
        }
    }

    fn typed_action(
        &self,
        session: SessionId,
        action: ActionId,
        subaction_path: XrPath,
        expected: ActionType,
    ) -> XrResult<()> {
        let attached = match self.session.as_ref() {
            Some(s) if s.id == session => &s.attached,
            _ => return Err(RuntimeError::HandleInvalid),
        };
        let action = self.actions.get(&action).ok_or(RuntimeError::HandleInvalid)?;
        if !attached.contains(&action.set) {
            return Err(RuntimeError::CallOrderInvalid("action set not attached"));
        }
        if action.ty != expected {
            return Err(RuntimeError::ActionTypeMismatch {
                expected: expected.as_str(),
                actual: action.ty.as_str(),
            });
        }
        if !action.subaction_paths.contains(&subaction_path) {
            return Err(RuntimeError::PathUnsupported(format!(
                "{} has no such subaction path",
                action.name
            )));
        }
        Ok(())
    }

    fn view_count(ty: ViewConfigurationType) -> usize {
        match ty {
            ViewConfigurationType::PrimaryMono => 1,
            ViewConfigurationType::PrimaryStereo => 2,
        }
    }

    fn apply_event(&mut self, event: &XrEvent) {
        if let XrEvent::SessionStateChanged { session, state, .. } = event {
            if let Some(s) = self.session.as_mut().filter(|s| s.id == *session) {
                debug!("VR: sim session {} -> {}", s.state.as_str(), state.as_str());
                s.state = *state;
            }
        }
    }
}

impl XrRuntime for SimRuntime {
    fn enumerate_api_layers(&mut self) -> XrResult<Vec<String>> {
        self.enter("enumerate_api_layers", None)?;
        Ok(self.config.api_layers.clone())
    }

    fn enumerate_extensions(&mut self) -> XrResult<Vec<String>> {
        self.enter("enumerate_extensions", None)?;
        Ok(self.config.extensions.clone())
    }

    fn create_instance(
        &mut self,
        _app: &ApplicationInfo,
        extensions: &[String],
        api_layers: &[String],
    ) -> XrResult<InstanceProperties> {
        self.enter("create_instance", Some(SimCall::CreateInstance))?;
        if self.instance {
            return Err(RuntimeError::CallOrderInvalid("instance already created"));
        }
        if let Some(ext) = extensions
            .iter()
            .find(|e| !self.config.extensions.contains(e))
        {
            return Err(RuntimeError::ExtensionNotPresent(ext.clone()));
        }
        if let Some(layer) = api_layers
            .iter()
            .find(|l| !self.config.api_layers.contains(l))
        {
            return Err(RuntimeError::ApiLayerNotPresent(layer.clone()));
        }
        self.instance = true;
        self.enabled_extensions = extensions.to_vec();
        Ok(InstanceProperties {
            runtime_name: self.config.runtime_name.clone(),
            runtime_version: self.config.runtime_version,
        })
    }

    fn create_debug_messenger(&mut self, sink: Sender<DebugMessage>) -> XrResult<MessengerId> {
        self.enter("create_debug_messenger", Some(SimCall::CreateDebugMessenger))?;
        self.require_instance()?;
        if !self.enabled_extensions.iter().any(|e| e == "XR_EXT_debug_utils") {
            return Err(RuntimeError::ExtensionNotPresent(
                "XR_EXT_debug_utils".to_string(),
            ));
        }
        self.debug_sink = Some(sink);
        Ok(MessengerId(self.next_handle()))
    }

    fn system(&mut self, form_factor: FormFactor) -> XrResult<SystemDescriptor> {
        self.enter("system", Some(SimCall::System))?;
        self.require_instance()?;
        if !self.config.form_factors.contains(&form_factor) {
            return Err(RuntimeError::FormFactorUnavailable);
        }
        let rec = self.config.view_recommendation;
        let system = SystemDescriptor {
            system_id: 1,
            form_factor,
            system_name: self.config.system_name.clone(),
            vendor_id: 0,
            max_swapchain_width: rec.max_width,
            max_swapchain_height: rec.max_height,
            max_layer_count: 16,
            orientation_tracking: true,
            position_tracking: true,
        };
        self.system = Some(system.clone());
        Ok(system)
    }

    fn string_to_path(&mut self, path: &str) -> XrResult<XrPath> {
        self.enter("string_to_path", None)?;
        self.require_instance()?;
        super::paths::validate_path(path)
            .map_err(|e| RuntimeError::PathInvalid(e.to_string()))?;
        Ok(self.intern(path))
    }

    fn path_to_string(&mut self, path: XrPath) -> XrResult<String> {
        self.enter("path_to_string", None)?;
        self.require_instance()?;
        path.0
            .checked_sub(1)
            .and_then(|i| self.paths.get(i as usize))
            .cloned()
            .ok_or_else(|| RuntimeError::PathInvalid(format!("unknown path id {}", path.0)))
    }

    fn create_action_set(
        &mut self,
        name: &str,
        _localized_name: &str,
        _priority: u32,
    ) -> XrResult<ActionSetId> {
        self.enter("create_action_set", Some(SimCall::CreateActionSet(name.to_string())))?;
        self.require_instance()?;
        let id = ActionSetId(self.next_handle());
        self.action_sets.insert(id, name.to_string());
        Ok(id)
    }

    fn create_action(
        &mut self,
        set: ActionSetId,
        name: &str,
        _localized_name: &str,
        ty: ActionType,
        subaction_paths: &[XrPath],
    ) -> XrResult<ActionId> {
        self.enter("create_action", Some(SimCall::CreateAction(name.to_string())))?;
        if !self.action_sets.contains_key(&set) {
            return Err(RuntimeError::HandleInvalid);
        }
        if self
            .session
            .as_ref()
            .is_some_and(|s| s.attached.contains(&set))
        {
            return Err(RuntimeError::CallOrderInvalid("action set already attached"));
        }
        if self.actions.values().any(|a| a.set == set && a.name == name) {
            return Err(RuntimeError::ValidationFailure(format!(
                "duplicate action name {}",
                name
            )));
        }
        let id = ActionId(self.next_handle());
        self.actions.insert(
            id,
            SimAction {
                set,
                name: name.to_string(),
                ty,
                subaction_paths: subaction_paths.to_vec(),
            },
        );
        Ok(id)
    }

    fn suggest_bindings(
        &mut self,
        profile: XrPath,
        bindings: &[(ActionId, XrPath)],
    ) -> XrResult<()> {
        let profile_name = self.paths.get(profile.0.saturating_sub(1) as usize).cloned();
        self.enter(
            "suggest_bindings",
            Some(SimCall::SuggestBindings(profile_name.clone().unwrap_or_default())),
        )?;
        let profile_name =
            profile_name.ok_or_else(|| RuntimeError::PathInvalid("unknown profile".into()))?;
        if !self.config.interaction_profiles.contains(&profile_name) {
            return Err(RuntimeError::PathUnsupported(profile_name));
        }
        if self.session.as_ref().is_some_and(|s| !s.attached.is_empty()) {
            return Err(RuntimeError::CallOrderInvalid("action sets already attached"));
        }
        for (action, binding) in bindings {
            if !self.actions.contains_key(action) {
                return Err(RuntimeError::HandleInvalid);
            }
            let binding_str = self
                .paths
                .get(binding.0.saturating_sub(1) as usize)
                .cloned()
                .unwrap_or_default();
            if !binding_str.starts_with("/user/") {
                return Err(RuntimeError::PathUnsupported(binding_str));
            }
        }
        self.suggested.retain(|(p, _)| *p != profile);
        self.suggested.push((profile, bindings.to_vec()));
        Ok(())
    }

    fn enumerate_view_configurations(&mut self) -> XrResult<Vec<ViewConfigurationType>> {
        self.enter("enumerate_view_configurations", None)?;
        self.require_instance()?;
        Ok(self.config.view_configurations.clone())
    }

    fn enumerate_view_configuration_views(
        &mut self,
        ty: ViewConfigurationType,
    ) -> XrResult<Vec<ViewConfigurationView>> {
        self.enter("enumerate_view_configuration_views", None)?;
        if !self.config.view_configurations.contains(&ty) {
            return Err(RuntimeError::ValidationFailure(format!(
                "view configuration {} unsupported",
                ty.as_str()
            )));
        }
        Ok(vec![self.config.view_recommendation; Self::view_count(ty)])
    }

    fn enumerate_blend_modes(&mut self, ty: ViewConfigurationType) -> XrResult<Vec<BlendMode>> {
        self.enter("enumerate_blend_modes", None)?;
        if !self.config.view_configurations.contains(&ty) {
            return Err(RuntimeError::ValidationFailure(format!(
                "view configuration {} unsupported",
                ty.as_str()
            )));
        }
        Ok(self.config.blend_modes.clone())
    }

    fn create_session(&mut self, binding: &GraphicsBinding) -> XrResult<SessionId> {
        self.enter("create_session", Some(SimCall::CreateSession))?;
        self.require_instance()?;
        if self.system.is_none() {
            return Err(RuntimeError::CallOrderInvalid("system not resolved"));
        }
        if self.session.is_some() {
            return Err(RuntimeError::CallOrderInvalid("session already exists"));
        }
        let ext = binding.required_extension();
        if !self.enabled_extensions.iter().any(|e| e == ext) {
            return Err(RuntimeError::ExtensionNotPresent(ext.to_string()));
        }
        let id = SessionId(self.next_handle());
        self.session = Some(SimSession {
            id,
            state: SessionState::Unknown,
            running: false,
            exit_requested: false,
            view_configuration: None,
            attached: Vec::new(),
        });
        if self.config.auto_lifecycle {
            self.queue_state(id, SessionState::Idle);
            self.queue_state(id, SessionState::Ready);
        }
        Ok(id)
    }

    fn attach_action_sets(&mut self, session: SessionId, sets: &[ActionSetId]) -> XrResult<()> {
        self.enter("attach_action_sets", Some(SimCall::AttachActionSets))?;
        if sets.iter().any(|s| !self.action_sets.contains_key(s)) {
            return Err(RuntimeError::HandleInvalid);
        }
        let s = self.session_mut(session)?;
        if !s.attached.is_empty() {
            return Err(RuntimeError::CallOrderInvalid("action sets already attached"));
        }
        s.attached = sets.to_vec();

        // The first accepted suggestion becomes the bound profile.
        if let Some((profile, _)) = self.suggested.first().cloned() {
            for hand in ["/user/hand/left", "/user/hand/right"] {
                let hand = self.intern(hand);
                self.current_profiles.insert(hand, profile);
            }
            self.events
                .push_back(XrEvent::InteractionProfileChanged { session });
        }
        Ok(())
    }

    fn create_action_space(
        &mut self,
        session: SessionId,
        action: ActionId,
        subaction_path: XrPath,
        _pose_in_action_space: Pose,
    ) -> XrResult<SpaceId> {
        self.enter("create_action_space", Some(SimCall::CreateActionSpace))?;
        self.session_mut(session)?;
        let a = self.actions.get(&action).ok_or(RuntimeError::HandleInvalid)?;
        if a.ty != ActionType::Pose {
            return Err(RuntimeError::ActionTypeMismatch {
                expected: ActionType::Pose.as_str(),
                actual: a.ty.as_str(),
            });
        }
        let id = SpaceId(self.next_handle());
        self.spaces.insert(
            id,
            SimSpace::Action {
                action,
                subaction: subaction_path,
            },
        );
        Ok(id)
    }

    fn create_reference_space(
        &mut self,
        session: SessionId,
        ty: ReferenceSpaceType,
        _pose_in_reference_space: Pose,
    ) -> XrResult<SpaceId> {
        self.enter("create_reference_space", Some(SimCall::CreateReferenceSpace(ty)))?;
        self.session_mut(session)?;
        let id = SpaceId(self.next_handle());
        self.spaces.insert(id, SimSpace::Reference(ty));
        Ok(id)
    }

    fn enumerate_swapchain_formats(&mut self, session: SessionId) -> XrResult<Vec<i64>> {
        self.enter("enumerate_swapchain_formats", None)?;
        self.session_mut(session)?;
        Ok(self.config.swapchain_formats.clone())
    }

    fn create_swapchain(
        &mut self,
        session: SessionId,
        info: &SwapchainCreateInfo,
    ) -> XrResult<SwapchainId> {
        self.enter("create_swapchain", Some(SimCall::CreateSwapchain(*info)))?;
        self.session_mut(session)?;
        if !self.config.swapchain_formats.contains(&info.format) {
            return Err(RuntimeError::ValidationFailure(format!(
                "unsupported swapchain format {:#x}",
                info.format
            )));
        }
        let rec = self.config.view_recommendation;
        if info.width == 0
            || info.height == 0
            || info.width > rec.max_width
            || info.height > rec.max_height
            || info.sample_count > rec.max_sample_count
        {
            return Err(RuntimeError::ValidationFailure(format!(
                "swapchain {}x{} x{} out of range",
                info.width, info.height, info.sample_count
            )));
        }
        let id = SwapchainId(self.next_handle());
        let base = (id.0 as u32) * 100;
        self.swapchains.insert(
            id,
            SimSwapchain {
                images: (0..self.config.swapchain_length).map(|i| base + i).collect(),
                next: 0,
                acquired: None,
                waited: false,
            },
        );
        Ok(id)
    }

    fn enumerate_swapchain_images(&mut self, swapchain: SwapchainId) -> XrResult<Vec<u32>> {
        self.enter("enumerate_swapchain_images", None)?;
        self.swapchains
            .get(&swapchain)
            .map(|sc| sc.images.clone())
            .ok_or(RuntimeError::HandleInvalid)
    }

    fn poll_event(&mut self) -> XrResult<Option<XrEvent>> {
        self.enter("poll_event", None)?;
        self.require_instance()?;
        let event = self.events.pop_front();
        if let Some(e) = &event {
            self.apply_event(e);
        }
        Ok(event)
    }

    fn begin_session(&mut self, session: SessionId, ty: ViewConfigurationType) -> XrResult<()> {
        self.enter("begin_session", Some(SimCall::BeginSession))?;
        let supported = self.config.view_configurations.contains(&ty);
        let auto = self.config.auto_lifecycle;
        let s = self.session_mut(session)?;
        if s.running {
            return Err(RuntimeError::CallOrderInvalid("session already running"));
        }
        if s.state != SessionState::Ready {
            return Err(RuntimeError::SessionNotReady);
        }
        if !supported {
            return Err(RuntimeError::ValidationFailure(format!(
                "view configuration {} unsupported",
                ty.as_str()
            )));
        }
        s.running = true;
        s.view_configuration = Some(ty);
        if auto {
            self.queue_state(session, SessionState::Synchronized);
            self.queue_state(session, SessionState::Visible);
            self.queue_state(session, SessionState::Focused);
        }
        Ok(())
    }

    fn end_session(&mut self, session: SessionId) -> XrResult<()> {
        self.enter("end_session", Some(SimCall::EndSession))?;
        let auto = self.config.auto_lifecycle;
        let s = self.session_mut(session)?;
        if !s.running {
            return Err(RuntimeError::SessionNotRunning);
        }
        if s.state != SessionState::Stopping {
            return Err(RuntimeError::SessionNotStopping);
        }
        s.running = false;
        s.view_configuration = None;
        let exiting = s.exit_requested;
        self.frame = FrameSlot::default();
        if auto {
            self.queue_state(session, SessionState::Idle);
            if exiting {
                self.queue_state(session, SessionState::Exiting);
            }
        }
        Ok(())
    }

    fn request_exit_session(&mut self, session: SessionId) -> XrResult<()> {
        self.enter("request_exit_session", Some(SimCall::RequestExitSession))?;
        let auto = self.config.auto_lifecycle;
        let s = self.session_mut(session)?;
        if !s.running {
            return Err(RuntimeError::SessionNotRunning);
        }
        s.exit_requested = true;
        if auto {
            self.queue_state(session, SessionState::Stopping);
        }
        Ok(())
    }

    fn current_interaction_profile(
        &mut self,
        session: SessionId,
        top_level_path: XrPath,
    ) -> XrResult<Option<XrPath>> {
        self.enter(
            "current_interaction_profile",
            Some(SimCall::CurrentInteractionProfile),
        )?;
        if self.session_mut(session)?.attached.is_empty() {
            return Err(RuntimeError::CallOrderInvalid("action sets not attached"));
        }
        Ok(self.current_profiles.get(&top_level_path).copied())
    }

    fn sync_actions(&mut self, session: SessionId, sets: &[ActionSetId]) -> XrResult<()> {
        self.enter("sync_actions", Some(SimCall::SyncActions))?;
        let s = self.session_mut(session)?;
        if sets.iter().any(|set| !s.attached.contains(set)) {
            return Err(RuntimeError::CallOrderInvalid("action set not attached"));
        }
        let focused = s.state == SessionState::Focused;

        let previous = std::mem::take(&mut self.synced_inputs);
        if focused {
            self.synced_inputs = self.pending_inputs.clone();
        }
        self.changed_inputs.clear();
        for (key, value) in &self.synced_inputs {
            let changed = previous.get(key).map_or(true, |old| old != value);
            self.changed_inputs.insert(*key, changed);
        }
        Ok(())
    }

    fn action_state_boolean(
        &mut self,
        session: SessionId,
        action: ActionId,
        subaction_path: XrPath,
    ) -> XrResult<ActionState<bool>> {
        self.enter("action_state_boolean", None)?;
        self.typed_action(session, action, subaction_path, ActionType::Boolean)?;
        let key = (action, subaction_path);
        Ok(match self.synced_inputs.get(&key) {
            Some(SimInput::Boolean(v)) => ActionState {
                current_state: *v,
                changed_since_last_sync: self.changed_inputs.get(&key).copied().unwrap_or(false),
                is_active: true,
            },
            _ => ActionState {
                current_state: false,
                changed_since_last_sync: false,
                is_active: false,
            },
        })
    }

    fn action_state_float(
        &mut self,
        session: SessionId,
        action: ActionId,
        subaction_path: XrPath,
    ) -> XrResult<ActionState<f32>> {
        self.enter("action_state_float", None)?;
        self.typed_action(session, action, subaction_path, ActionType::Float)?;
        let key = (action, subaction_path);
        Ok(match self.synced_inputs.get(&key) {
            Some(SimInput::Float(v)) => ActionState {
                current_state: *v,
                changed_since_last_sync: self.changed_inputs.get(&key).copied().unwrap_or(false),
                is_active: true,
            },
            _ => ActionState {
                current_state: 0.0,
                changed_since_last_sync: false,
                is_active: false,
            },
        })
    }

    fn action_state_pose(
        &mut self,
        session: SessionId,
        action: ActionId,
        subaction_path: XrPath,
    ) -> XrResult<bool> {
        self.enter("action_state_pose", None)?;
        self.typed_action(session, action, subaction_path, ActionType::Pose)?;
        Ok(matches!(
            self.synced_inputs.get(&(action, subaction_path)),
            Some(SimInput::Pose(true))
        ))
    }

    fn locate_space(
        &mut self,
        space: SpaceId,
        base: SpaceId,
        _time: XrTime,
    ) -> XrResult<SpaceLocation> {
        self.enter("locate_space", None)?;
        if !self.spaces.contains_key(&base) {
            return Err(RuntimeError::HandleInvalid);
        }
        let untracked = SpaceLocation {
            pose: Pose::IDENTITY,
            position_valid: false,
            orientation_valid: false,
        };
        match self.spaces.get(&space) {
            Some(SimSpace::Reference(_)) => Ok(SpaceLocation {
                pose: Pose::IDENTITY,
                position_valid: true,
                orientation_valid: true,
            }),
            Some(SimSpace::Action { action, subaction }) => {
                let key = (*action, *subaction);
                let active = matches!(self.synced_inputs.get(&key), Some(SimInput::Pose(true)));
                if !active {
                    return Ok(untracked);
                }
                Ok(self
                    .action_space_locations
                    .get(&key)
                    .copied()
                    .unwrap_or(untracked))
            }
            None => Err(RuntimeError::HandleInvalid),
        }
    }

    fn apply_haptic_feedback(
        &mut self,
        session: SessionId,
        action: ActionId,
        subaction_path: XrPath,
        vibration: &HapticVibration,
    ) -> XrResult<()> {
        let subaction = self
            .paths
            .get(subaction_path.0.saturating_sub(1) as usize)
            .cloned()
            .unwrap_or_default();
        self.enter(
            "apply_haptic_feedback",
            Some(SimCall::ApplyHaptic {
                subaction,
                amplitude: vibration.amplitude,
            }),
        )?;
        self.typed_action(session, action, subaction_path, ActionType::Vibration)?;
        self.haptics.insert(subaction_path, vibration.amplitude);
        Ok(())
    }

    fn wait_frame(&mut self, session: SessionId) -> XrResult<FrameState> {
        self.enter("wait_frame", Some(SimCall::WaitFrame))?;
        self.require_running(session)?;
        if self.frame.waited && !self.frame.began {
            return Err(RuntimeError::CallOrderInvalid("wait_frame without begin_frame"));
        }
        let state = self.session_state();
        let display_time =
            XrTime(FIRST_DISPLAY_TIME_NS + self.frames_ended as i64 * self.config.display_period_ns);
        self.frame = FrameSlot {
            waited: true,
            began: false,
            display_time,
        };
        Ok(FrameState {
            predicted_display_time: display_time,
            predicted_display_period_ns: self.config.display_period_ns,
            should_render: matches!(state, SessionState::Visible | SessionState::Focused),
        })
    }

    fn begin_frame(&mut self, session: SessionId) -> XrResult<()> {
        self.enter("begin_frame", Some(SimCall::BeginFrame))?;
        self.require_running(session)?;
        if !self.frame.waited || self.frame.began {
            return Err(RuntimeError::CallOrderInvalid("begin_frame without wait_frame"));
        }
        self.frame.began = true;
        Ok(())
    }

    fn locate_views(
        &mut self,
        session: SessionId,
        ty: ViewConfigurationType,
        _time: XrTime,
        space: SpaceId,
    ) -> XrResult<Vec<View>> {
        self.enter("locate_views", Some(SimCall::LocateViews))?;
        self.require_running(session)?;
        if !self.spaces.contains_key(&space) {
            return Err(RuntimeError::HandleInvalid);
        }
        let begun = self.session.as_ref().and_then(|s| s.view_configuration);
        if begun != Some(ty) {
            return Err(RuntimeError::ValidationFailure(format!(
                "view configuration {} not active",
                ty.as_str()
            )));
        }
        let head = self.config.head_pose;
        let fov = Fov::symmetric(std::f32::consts::FRAC_PI_4);
        let offsets: &[f32] = match ty {
            ViewConfigurationType::PrimaryMono => &[0.0],
            ViewConfigurationType::PrimaryStereo => &[-HALF_IPD, HALF_IPD],
        };
        Ok(offsets
            .iter()
            .map(|x| View {
                pose: Pose::new(
                    head.position + head.orientation * Vec3::new(*x, 0.0, 0.0),
                    head.orientation,
                ),
                fov,
            })
            .collect())
    }

    fn acquire_swapchain_image(&mut self, swapchain: SwapchainId) -> XrResult<u32> {
        self.enter("acquire_swapchain_image", Some(SimCall::AcquireImage(swapchain)))?;
        let sc = self
            .swapchains
            .get_mut(&swapchain)
            .ok_or(RuntimeError::HandleInvalid)?;
        if sc.acquired.is_some() {
            return Err(RuntimeError::CallOrderInvalid("image already acquired"));
        }
        let index = sc.next;
        sc.next = (sc.next + 1) % sc.images.len().max(1) as u32;
        sc.acquired = Some(index);
        sc.waited = false;
        Ok(index)
    }

    fn wait_swapchain_image(&mut self, swapchain: SwapchainId) -> XrResult<()> {
        self.enter("wait_swapchain_image", Some(SimCall::WaitImage(swapchain)))?;
        let delay = self.config.gpu_delay;
        let sc = self
            .swapchains
            .get_mut(&swapchain)
            .ok_or(RuntimeError::HandleInvalid)?;
        if sc.acquired.is_none() || sc.waited {
            return Err(RuntimeError::CallOrderInvalid("wait without acquire"));
        }
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        sc.waited = true;
        Ok(())
    }

    fn release_swapchain_image(&mut self, swapchain: SwapchainId) -> XrResult<()> {
        self.enter("release_swapchain_image", Some(SimCall::ReleaseImage(swapchain)))?;
        let sc = self
            .swapchains
            .get_mut(&swapchain)
            .ok_or(RuntimeError::HandleInvalid)?;
        if sc.acquired.is_none() || !sc.waited {
            return Err(RuntimeError::CallOrderInvalid("release without wait"));
        }
        sc.acquired = None;
        sc.waited = false;
        Ok(())
    }

    fn end_frame(
        &mut self,
        session: SessionId,
        display_time: XrTime,
        _blend_mode: BlendMode,
        layers: &[CompositionLayer],
    ) -> XrResult<()> {
        let view_count = layers
            .iter()
            .map(|l| match l {
                CompositionLayer::Projection(p) => p.views.len(),
            })
            .sum();
        self.enter(
            "end_frame",
            Some(SimCall::EndFrame {
                layer_count: layers.len(),
                view_count,
            }),
        )?;
        self.require_running(session)?;
        if !self.frame.began {
            return Err(RuntimeError::CallOrderInvalid("end_frame without begin_frame"));
        }
        if self.swapchains.values().any(|sc| sc.acquired.is_some()) {
            return Err(RuntimeError::CallOrderInvalid(
                "end_frame with an unreleased swapchain image",
            ));
        }
        if display_time != self.frame.display_time {
            return Err(RuntimeError::ValidationFailure(
                "display time does not match wait_frame".to_string(),
            ));
        }
        for layer in layers {
            let CompositionLayer::Projection(p) = layer;
            if !self.spaces.contains_key(&p.space) {
                return Err(RuntimeError::HandleInvalid);
            }
            if p.views.iter().any(|v| !self.swapchains.contains_key(&v.sub_image.swapchain)) {
                return Err(RuntimeError::HandleInvalid);
            }
        }
        self.frame = FrameSlot::default();
        self.frames_ended += 1;
        self.last_layers = layers.to_vec();
        Ok(())
    }

    fn destroy(&mut self, handle: Handle) -> XrResult<()> {
        self.enter("destroy", Some(SimCall::Destroy(handle)))?;
        let found = match handle {
            Handle::Instance => {
                let was = self.instance;
                self.instance = false;
                self.session = None;
                self.spaces.clear();
                self.swapchains.clear();
                self.actions.clear();
                self.action_sets.clear();
                self.suggested.clear();
                self.system = None;
                self.debug_sink = None;
                was
            }
            Handle::Messenger(_) => self.debug_sink.take().is_some(),
            Handle::ActionSet(id) => {
                self.actions.retain(|_, a| a.set != id);
                self.action_sets.remove(&id).is_some()
            }
            Handle::Session(id) => {
                if self.session.as_ref().is_some_and(|s| s.id == id) {
                    self.session = None;
                    self.frame = FrameSlot::default();
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
