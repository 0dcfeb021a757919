//! Action binding registry.
//!
//! Declares the controller actions once (each with a left and a right hand
//! sub-path), suggests the configured interaction-profile tables, and every
//! frame synchronizes the action set and refreshes per-hand input snapshots.
//!
//! Haptics are frame-clocked: the amplitude requested through
//! [`ActionRegistry::vibrate`] decays geometrically each frame and is
//! re-applied, producing a short fading buzz without a timer.

use anyhow::{bail, Context};
use glam::Vec2;
use tracing::{debug, info, warn};

use super::paths;
use super::runtime::{
    ActionId, ActionSetId, Handle, HandleScope, SessionId, SpaceId, XrPath, XrRuntime,
};
use super::types::{ActionType, Hand, HapticVibration, Pose, XrTime};
use crate::config::{HapticConfig, InteractionProfileTable};

const ACTION_SET_NAME: &str = "xr-bridge-controls";

// ── Logical controls ───────────────────────────────────────

/// Logical controller action, declared once for both hands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerAction {
    PalmPose,
    Haptic,
    Trigger,
    Grip,
    PrimaryButton,
    SecondaryButton,
    ThumbstickClick,
    ThumbstickX,
    ThumbstickY,
}

impl ControllerAction {
    pub const ALL: [ControllerAction; 9] = [
        Self::PalmPose,
        Self::Haptic,
        Self::Trigger,
        Self::Grip,
        Self::PrimaryButton,
        Self::SecondaryButton,
        Self::ThumbstickClick,
        Self::ThumbstickX,
        Self::ThumbstickY,
    ];

    /// Runtime action name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PalmPose => "palm-pose",
            Self::Haptic => "buzz",
            Self::Trigger => "trigger",
            Self::Grip => "grip",
            Self::PrimaryButton => "primary-button",
            Self::SecondaryButton => "secondary-button",
            Self::ThumbstickClick => "thumbstick-click",
            Self::ThumbstickX => "thumbstick-x",
            Self::ThumbstickY => "thumbstick-y",
        }
    }

    pub fn localized_name(&self) -> &'static str {
        match self {
            Self::PalmPose => "Palm Pose",
            Self::Haptic => "Haptic Buzz",
            Self::Trigger => "Trigger",
            Self::Grip => "Grip",
            Self::PrimaryButton => "Primary Button",
            Self::SecondaryButton => "Secondary Button",
            Self::ThumbstickClick => "Thumbstick Click",
            Self::ThumbstickX => "Thumbstick X",
            Self::ThumbstickY => "Thumbstick Y",
        }
    }

    pub fn action_type(&self) -> ActionType {
        match self {
            Self::PalmPose => ActionType::Pose,
            Self::Haptic => ActionType::Vibration,
            Self::Trigger | Self::Grip | Self::ThumbstickX | Self::ThumbstickY => ActionType::Float,
            Self::PrimaryButton | Self::SecondaryButton | Self::ThumbstickClick => {
                ActionType::Boolean
            }
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Digital controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    /// A on the right hand, X on the left.
    Primary,
    /// B on the right hand, Y on the left.
    Secondary,
    ThumbstickClick,
}

/// Analog controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Trigger,
    Grip,
    ThumbstickX,
    ThumbstickY,
}

/// Everything known about one controller after the last sync.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerSnapshot {
    /// Last valid palm pose; kept when tracking drops out.
    pub pose: Pose,
    pub pose_active: bool,
    pub trigger: f32,
    pub grip: f32,
    pub thumbstick: Vec2,
    pub primary: bool,
    pub secondary: bool,
    pub thumbstick_click: bool,
}

impl Default for ControllerSnapshot {
    fn default() -> Self {
        Self {
            pose: Pose::IDENTITY,
            pose_active: false,
            trigger: 0.0,
            grip: 0.0,
            thumbstick: Vec2::ZERO,
            primary: false,
            secondary: false,
            thumbstick_click: false,
        }
    }
}

impl ControllerSnapshot {
    pub fn button(&self, button: Button) -> bool {
        match button {
            Button::Primary => self.primary,
            Button::Secondary => self.secondary,
            Button::ThumbstickClick => self.thumbstick_click,
        }
    }

    pub fn axis(&self, axis: Axis) -> f32 {
        match axis {
            Axis::Trigger => self.trigger,
            Axis::Grip => self.grip,
            Axis::ThumbstickX => self.thumbstick.x,
            Axis::ThumbstickY => self.thumbstick.y,
        }
    }
}

// ── Haptic decay ───────────────────────────────────────────

/// Per-hand buzz amplitude driven by the frame clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HapticState {
    amplitude: f32,
    config: HapticConfig,
}

impl HapticState {
    pub fn new(config: HapticConfig) -> Self {
        Self {
            amplitude: 0.0,
            config,
        }
    }

    /// Set a new amplitude, clamped to [0, 1].
    pub fn set(&mut self, amplitude: f32) {
        self.amplitude = if amplitude.is_nan() {
            0.0
        } else {
            amplitude.clamp(0.0, 1.0)
        };
    }

    /// Decay one frame and return the amplitude to apply.
    pub fn step(&mut self) -> f32 {
        self.amplitude *= self.config.decay_factor;
        if self.amplitude < self.config.cutoff {
            self.amplitude = 0.0;
        }
        self.amplitude
    }

    pub fn amplitude(&self) -> f32 {
        self.amplitude
    }
}

// ── Registry ───────────────────────────────────────────────

/// Owns the action set, its actions, and the per-hand results of each sync.
pub struct ActionRegistry {
    set: ActionSetId,
    actions: [ActionId; ControllerAction::ALL.len()],
    hand_paths: [XrPath; 2],
    spaces: [Option<SpaceId>; 2],
    hands: [ControllerSnapshot; 2],
    haptics: [HapticState; 2],
    profiles: [Option<String>; 2],
    accepted_profiles: Vec<String>,
}

impl ActionRegistry {
    /// Create the action set and every controller action.
    pub fn create<R: XrRuntime + ?Sized>(
        runtime: &mut R,
        scope: &mut HandleScope,
        haptics: HapticConfig,
    ) -> anyhow::Result<Self> {
        let hand_paths = [
            paths::to_path(runtime, Hand::Left.user_path())?,
            paths::to_path(runtime, Hand::Right.user_path())?,
        ];

        let set = runtime
            .create_action_set(ACTION_SET_NAME, "XR Bridge Controls", 0)
            .context("VR: failed to create action set")?;
        scope.track(Handle::ActionSet(set));

        let mut actions = [ActionId(0); ControllerAction::ALL.len()];
        for action in ControllerAction::ALL {
            actions[action.index()] = runtime
                .create_action(
                    set,
                    action.name(),
                    action.localized_name(),
                    action.action_type(),
                    &hand_paths,
                )
                .with_context(|| format!("VR: failed to create action {}", action.name()))?;
        }
        debug!("VR: created {} actions", actions.len());

        Ok(Self {
            set,
            actions,
            hand_paths,
            spaces: [None, None],
            hands: [ControllerSnapshot::default(); 2],
            haptics: [HapticState::new(haptics); 2],
            profiles: [None, None],
            accepted_profiles: Vec::new(),
        })
    }

    /// Suggest every table. A rejected table is logged and skipped; it is an
    /// error only when no table at all is accepted.
    pub fn suggest_bindings<R: XrRuntime + ?Sized>(
        &mut self,
        runtime: &mut R,
        tables: &[InteractionProfileTable],
    ) -> anyhow::Result<usize> {
        for table in tables {
            match self.suggest_table(runtime, table) {
                Ok(()) => {
                    info!("VR: bindings accepted for {}", table.profile);
                    self.accepted_profiles.push(table.profile.clone());
                }
                Err(e) => warn!("VR: bindings rejected for {}: {:#}", table.profile, e),
            }
        }
        if self.accepted_profiles.is_empty() {
            bail!(
                "VR: runtime rejected all {} interaction profile binding tables, no input would work",
                tables.len()
            );
        }
        Ok(self.accepted_profiles.len())
    }

    fn suggest_table<R: XrRuntime + ?Sized>(
        &self,
        runtime: &mut R,
        table: &InteractionProfileTable,
    ) -> anyhow::Result<()> {
        let profile = paths::to_path(runtime, &table.profile)?;
        let mut bindings = Vec::with_capacity(table.bindings.len());
        for (action, path) in &table.bindings {
            bindings.push((self.action_id(*action), paths::to_path(runtime, path)?));
        }
        runtime.suggest_bindings(profile, &bindings)?;
        Ok(())
    }

    /// Create the palm-pose spaces and attach the action set to the session.
    pub fn attach<R: XrRuntime + ?Sized>(
        &mut self,
        runtime: &mut R,
        scope: &mut HandleScope,
        session: SessionId,
    ) -> anyhow::Result<()> {
        for hand in Hand::BOTH {
            let space = runtime
                .create_action_space(
                    session,
                    self.action_id(ControllerAction::PalmPose),
                    self.hand_paths[hand.index()],
                    Pose::IDENTITY,
                )
                .with_context(|| format!("VR: failed to create {} hand space", hand.as_str()))?;
            scope.track(Handle::Space(space));
            self.spaces[hand.index()] = Some(space);
        }
        runtime
            .attach_action_sets(session, &[self.set])
            .context("VR: failed to attach action set")?;
        info!("VR: action set attached");
        Ok(())
    }

    /// Make this frame's action values authoritative and read them.
    ///
    /// Sync and read failures mean a broken handle or detached session and
    /// are returned. Pose location failures only mark the hand inactive.
    pub fn sync<R: XrRuntime + ?Sized>(
        &mut self,
        runtime: &mut R,
        session: SessionId,
        reference: SpaceId,
        time: XrTime,
    ) -> anyhow::Result<()> {
        runtime
            .sync_actions(session, &[self.set])
            .context("VR: failed to sync actions")?;

        for hand in Hand::BOTH {
            let i = hand.index();
            let path = self.hand_paths[i];
            let float = |runtime: &mut R, action: ControllerAction| {
                runtime
                    .action_state_float(session, self.action_id(action), path)
                    .map(|s| s.current_state)
                    .with_context(|| format!("VR: failed to read {} ({})", action.name(), hand.as_str()))
            };
            let boolean = |runtime: &mut R, action: ControllerAction| {
                runtime
                    .action_state_boolean(session, self.action_id(action), path)
                    .map(|s| s.current_state)
                    .with_context(|| format!("VR: failed to read {} ({})", action.name(), hand.as_str()))
            };

            let trigger = float(runtime, ControllerAction::Trigger)?;
            let grip = float(runtime, ControllerAction::Grip)?;
            let stick_x = float(runtime, ControllerAction::ThumbstickX)?;
            let stick_y = float(runtime, ControllerAction::ThumbstickY)?;
            let primary = boolean(runtime, ControllerAction::PrimaryButton)?;
            let secondary = boolean(runtime, ControllerAction::SecondaryButton)?;
            let stick_click = boolean(runtime, ControllerAction::ThumbstickClick)?;

            let pose_bound = runtime
                .action_state_pose(session, self.action_id(ControllerAction::PalmPose), path)
                .with_context(|| format!("VR: failed to read palm pose ({})", hand.as_str()))?;

            let located = match (pose_bound, self.spaces[i]) {
                (true, Some(space)) => match runtime.locate_space(space, reference, time) {
                    Ok(location) if location.is_valid() => Some(location.pose),
                    Ok(_) => None,
                    Err(e) => {
                        warn!("VR: failed to locate {} hand: {}", hand.as_str(), e);
                        None
                    }
                },
                _ => None,
            };

            let snapshot = &mut self.hands[i];
            snapshot.trigger = trigger;
            snapshot.grip = grip;
            snapshot.thumbstick = Vec2::new(stick_x, stick_y);
            snapshot.primary = primary;
            snapshot.secondary = secondary;
            snapshot.thumbstick_click = stick_click;
            match located {
                Some(pose) => {
                    snapshot.pose = pose;
                    snapshot.pose_active = true;
                }
                None => snapshot.pose_active = false,
            }
        }

        self.apply_haptics(runtime, session);
        Ok(())
    }

    /// Decay and re-apply both hands' buzz. Fire-and-forget.
    fn apply_haptics<R: XrRuntime + ?Sized>(&mut self, runtime: &mut R, session: SessionId) {
        let action = self.action_id(ControllerAction::Haptic);
        for hand in Hand::BOTH {
            let amplitude = self.haptics[hand.index()].step();
            let vibration = HapticVibration::pulse(amplitude);
            if let Err(e) =
                runtime.apply_haptic_feedback(session, action, self.hand_paths[hand.index()], &vibration)
            {
                warn!("VR: haptic feedback failed ({}): {}", hand.as_str(), e);
            }
        }
    }

    /// Re-query which profile is bound to each hand. Informational only.
    pub fn refresh_profiles<R: XrRuntime + ?Sized>(&mut self, runtime: &mut R, session: SessionId) {
        for hand in Hand::BOTH {
            let i = hand.index();
            let profile = match runtime.current_interaction_profile(session, self.hand_paths[i]) {
                Ok(Some(path)) => match paths::to_string(runtime, path) {
                    Ok(s) => Some(s),
                    Err(e) => {
                        warn!("VR: {:#}", e);
                        continue;
                    }
                },
                Ok(None) => None,
                Err(e) => {
                    warn!("VR: failed to query {} interaction profile: {}", hand.as_str(), e);
                    continue;
                }
            };
            if self.profiles[i] != profile {
                info!(
                    "VR: {} hand interaction profile: {}",
                    hand.as_str(),
                    profile.as_deref().unwrap_or("none")
                );
                self.profiles[i] = profile;
            }
        }
    }

    /// Request a buzz; it fades over the following frames.
    pub fn vibrate(&mut self, hand: Hand, amplitude: f32) {
        self.haptics[hand.index()].set(amplitude);
    }

    pub fn haptic_amplitude(&self, hand: Hand) -> f32 {
        self.haptics[hand.index()].amplitude()
    }

    pub fn snapshot(&self, hand: Hand) -> &ControllerSnapshot {
        &self.hands[hand.index()]
    }

    pub fn current_profile(&self, hand: Hand) -> Option<&str> {
        self.profiles[hand.index()].as_deref()
    }

    pub fn accepted_profiles(&self) -> &[String] {
        &self.accepted_profiles
    }

    pub fn action_set(&self) -> ActionSetId {
        self.set
    }

    pub fn action_id(&self, action: ControllerAction) -> ActionId {
        self.actions[action.index()]
    }
}
