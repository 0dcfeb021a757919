//! Runtime-agnostic XR value types.
//!
//! Plain data shared by every component: poses, fields of view, the session
//! state machine's states, view/blend enumerations and per-frame records.
//! Compiled unconditionally (no openxrs dependency).

use glam::{Mat4, Quat, Vec3};

// ── Time ───────────────────────────────────────────────────

/// A timestamp on the runtime clock, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct XrTime(pub i64);

impl XrTime {
    pub fn as_nanos(&self) -> i64 {
        self.0
    }
}

// ── Pose / FOV ─────────────────────────────────────────────

/// Position (meters) plus orientation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Vec3,
    pub orientation: Quat,
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        position: Vec3::ZERO,
        orientation: Quat::IDENTITY,
    };

    pub fn new(position: Vec3, orientation: Quat) -> Self {
        Self {
            position,
            orientation,
        }
    }

    /// Model matrix for this pose.
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.orientation, self.position)
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Per-view field of view, as four half-angles in radians.
///
/// `angle_left` and `angle_down` are normally negative.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Fov {
    pub angle_left: f32,
    pub angle_right: f32,
    pub angle_up: f32,
    pub angle_down: f32,
}

impl Fov {
    /// Symmetric field of view with the same half-angle on all four sides.
    pub fn symmetric(half_angle: f32) -> Self {
        Self {
            angle_left: -half_angle,
            angle_right: half_angle,
            angle_up: half_angle,
            angle_down: -half_angle,
        }
    }

    /// Asymmetric OpenGL-convention projection (clip-space z in [-1, 1]).
    pub fn projection(&self, near_z: f32, far_z: f32) -> Mat4 {
        let tan_left = self.angle_left.tan();
        let tan_right = self.angle_right.tan();
        let tan_up = self.angle_up.tan();
        let tan_down = self.angle_down.tan();

        let tan_width = tan_right - tan_left;
        let tan_height = tan_up - tan_down;

        if far_z <= near_z {
            // Infinite far plane.
            return Mat4::from_cols_array(&[
                2.0 / tan_width,
                0.0,
                0.0,
                0.0,
                0.0,
                2.0 / tan_height,
                0.0,
                0.0,
                (tan_right + tan_left) / tan_width,
                (tan_up + tan_down) / tan_height,
                -1.0,
                -1.0,
                0.0,
                0.0,
                -2.0 * near_z,
                0.0,
            ]);
        }

        Mat4::from_cols_array(&[
            2.0 / tan_width,
            0.0,
            0.0,
            0.0,
            0.0,
            2.0 / tan_height,
            0.0,
            0.0,
            (tan_right + tan_left) / tan_width,
            (tan_up + tan_down) / tan_height,
            -(far_z + near_z) / (far_z - near_z),
            -1.0,
            0.0,
            0.0,
            -(far_z * (near_z + near_z)) / (far_z - near_z),
            0.0,
        ])
    }
}

// ── Hands ──────────────────────────────────────────────────

/// Which hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hand {
    Left,
    Right,
}

impl Hand {
    pub const BOTH: [Hand; 2] = [Hand::Left, Hand::Right];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
        }
    }

    /// Array slot for per-hand storage (left = 0, right = 1).
    pub fn index(&self) -> usize {
        match self {
            Self::Left => 0,
            Self::Right => 1,
        }
    }

    /// Top-level user path used as the action sub-path.
    pub fn user_path(&self) -> &'static str {
        match self {
            Self::Left => "/user/hand/left",
            Self::Right => "/user/hand/right",
        }
    }
}

// ── Enumerations ───────────────────────────────────────────

/// Device category the system is resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormFactor {
    HeadMountedDisplay,
    HandheldDisplay,
}

impl FormFactor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HeadMountedDisplay => "head-mounted-display",
            Self::HandheldDisplay => "handheld-display",
        }
    }
}

/// View topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewConfigurationType {
    PrimaryMono,
    PrimaryStereo,
}

impl ViewConfigurationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrimaryMono => "primary-mono",
            Self::PrimaryStereo => "primary-stereo",
        }
    }
}

/// How the compositor merges submitted layers with the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendMode {
    Opaque,
    Additive,
    AlphaBlend,
}

impl BlendMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opaque => "opaque",
            Self::Additive => "additive",
            Self::AlphaBlend => "alpha-blend",
        }
    }

    /// Whether the mode lets the physical environment show through.
    pub fn blends_environment(&self) -> bool {
        matches!(self, Self::Additive | Self::AlphaBlend)
    }
}

/// Reference space type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceSpaceType {
    Local,
    Stage,
    View,
}

impl ReferenceSpaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Stage => "stage",
            Self::View => "view",
        }
    }
}

/// Session state (mirrors the runtime's session states).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Unknown,
    Idle,
    Ready,
    Synchronized,
    Visible,
    Focused,
    Stopping,
    LossPending,
    Exiting,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Idle => "idle",
            Self::Ready => "ready",
            Self::Synchronized => "synchronized",
            Self::Visible => "visible",
            Self::Focused => "focused",
            Self::Stopping => "stopping",
            Self::LossPending => "loss-pending",
            Self::Exiting => "exiting",
        }
    }

    /// States in which submitted frames are shown (rendering allowed).
    pub fn is_renderable(&self) -> bool {
        matches!(self, Self::Synchronized | Self::Visible | Self::Focused)
    }

    /// States after which the session cannot be resumed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exiting | Self::LossPending)
    }
}

/// Logical action kind. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    Pose,
    Boolean,
    Float,
    Vibration,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pose => "pose",
            Self::Boolean => "boolean",
            Self::Float => "float",
            Self::Vibration => "vibration",
        }
    }
}

// ── Records returned by the runtime ───────────────────────

/// Semantic version as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u16, minor: u16, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Application identity passed at instance creation.
#[derive(Debug, Clone)]
pub struct ApplicationInfo {
    pub application_name: String,
    pub application_version: u32,
    pub engine_name: String,
    pub engine_version: u32,
    pub api_version: Version,
}

/// Runtime identity reported after instance creation.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceProperties {
    pub runtime_name: String,
    pub runtime_version: Version,
}

/// Resolved device: category plus its static properties.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemDescriptor {
    pub system_id: u64,
    pub form_factor: FormFactor,
    pub system_name: String,
    pub vendor_id: u32,
    pub max_swapchain_width: u32,
    pub max_swapchain_height: u32,
    pub max_layer_count: u32,
    pub orientation_tracking: bool,
    pub position_tracking: bool,
}

/// Per-view recommendations for one view of a view configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewConfigurationView {
    pub recommended_width: u32,
    pub recommended_height: u32,
    pub recommended_sample_count: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub max_sample_count: u32,
}

/// Located view: eye pose and field of view at a display time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct View {
    pub pose: Pose,
    pub fov: Fov,
}

/// Frame timing handed out by the frame-wait call. Valid for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameState {
    pub predicted_display_time: XrTime,
    pub predicted_display_period_ns: i64,
    pub should_render: bool,
}

/// Result of locating one space relative to another.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpaceLocation {
    pub pose: Pose,
    pub position_valid: bool,
    pub orientation_valid: bool,
}

impl SpaceLocation {
    pub fn is_valid(&self) -> bool {
        self.position_valid && self.orientation_valid
    }
}

/// Current value of an input action after the last sync.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActionState<T> {
    pub current_state: T,
    pub changed_since_last_sync: bool,
    pub is_active: bool,
}

/// One haptic pulse. A `duration_ns` of `None` is the runtime minimum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HapticVibration {
    pub amplitude: f32,
    pub duration_ns: Option<i64>,
    pub frequency: Option<f32>,
}

impl HapticVibration {
    /// Shortest supported pulse at an unspecified frequency.
    pub fn pulse(amplitude: f32) -> Self {
        Self {
            amplitude,
            duration_ns: None,
            frequency: None,
        }
    }
}

// ── Debug channel records ─────────────────────────────────

/// Severity tag attached to a runtime debug message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DebugSeverity {
    Verbose,
    Info,
    Warning,
    Error,
}

impl DebugSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verbose => "verbose",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// A message delivered by the runtime's diagnostics extension.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugMessage {
    pub severity: DebugSeverity,
    pub message_id: String,
    pub function_name: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_projection_is_centered() {
        let fov = Fov::symmetric(std::f32::consts::FRAC_PI_4);
        let m = fov.projection(0.05, 100.0);
        assert!((m.x_axis.x - 1.0).abs() < 1e-5);
        assert!((m.y_axis.y - 1.0).abs() < 1e-5);
        assert!(m.z_axis.x.abs() < 1e-5);
        assert!(m.z_axis.y.abs() < 1e-5);
        assert_eq!(m.z_axis.w, -1.0);
    }

    #[test]
    fn test_projection_maps_near_plane_to_minus_one() {
        let fov = Fov::symmetric(0.8);
        let m = fov.projection(0.1, 50.0);
        let clip = m * glam::Vec4::new(0.0, 0.0, -0.1, 1.0);
        assert!((clip.z / clip.w + 1.0).abs() < 1e-4);
        let clip = m * glam::Vec4::new(0.0, 0.0, -50.0, 1.0);
        assert!((clip.z / clip.w - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_asymmetric_projection_offsets_center() {
        let fov = Fov {
            angle_left: -0.8552113,
            angle_right: 0.7853982,
            angle_up: 0.83775806,
            angle_down: -0.87266463,
        };
        let m = fov.projection(0.05, 100.0);
        // Wider to the left and below, so the center shifts negative.
        assert!(m.z_axis.x < 0.0);
        assert!(m.z_axis.y < 0.0);
    }

    #[test]
    fn test_renderable_states() {
        assert!(SessionState::Synchronized.is_renderable());
        assert!(SessionState::Visible.is_renderable());
        assert!(SessionState::Focused.is_renderable());
        assert!(!SessionState::Ready.is_renderable());
        assert!(!SessionState::Idle.is_renderable());
        assert!(!SessionState::Stopping.is_renderable());
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Exiting.is_terminal());
        assert!(SessionState::LossPending.is_terminal());
        assert!(!SessionState::Stopping.is_terminal());
    }

    #[test]
    fn test_hand_paths() {
        assert_eq!(Hand::Left.user_path(), "/user/hand/left");
        assert_eq!(Hand::Right.index(), 1);
    }

    #[test]
    fn test_version_display() {
        assert_eq!(Version::new(1, 0, 34).to_string(), "1.0.34");
    }
}
