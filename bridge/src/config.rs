//! Bridge configuration.
//!
//! Everything the setup phase negotiates against: application identity,
//! requested layers and extensions, preferred view topology and blend modes,
//! clip planes, haptic decay and the controller binding tables.

use crate::xr::actions::ControllerAction;
use crate::xr::types::{
    ApplicationInfo, BlendMode, FormFactor, Hand, ReferenceSpaceType, Version,
    ViewConfigurationType,
};

/// Exponential buzz decay applied once per frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HapticConfig {
    /// Multiplier applied to the amplitude every frame.
    pub decay_factor: f32,
    /// Amplitudes below this snap to zero.
    pub cutoff: f32,
}

impl Default for HapticConfig {
    fn default() -> Self {
        Self {
            decay_factor: 0.5,
            cutoff: 0.01,
        }
    }
}

/// Suggested bindings for one controller profile.
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionProfileTable {
    pub profile: String,
    pub bindings: Vec<(ControllerAction, String)>,
}

impl InteractionProfileTable {
    /// Build a table whose bindings are the same component on both hands,
    /// except for buttons that differ per hand.
    fn per_hand(profile: &str, components: &[(ControllerAction, &str, &str)]) -> Self {
        let mut bindings = Vec::with_capacity(components.len() * 2);
        for hand in Hand::BOTH {
            for (action, left, right) in components {
                let component = match hand {
                    Hand::Left => left,
                    Hand::Right => right,
                };
                bindings.push((*action, format!("{}/{}", hand.user_path(), component)));
            }
        }
        Self {
            profile: profile.to_string(),
            bindings,
        }
    }

    pub fn oculus_touch() -> Self {
        Self::per_hand(
            "/interaction_profiles/oculus/touch_controller",
            &[
                (ControllerAction::PalmPose, "input/grip/pose", "input/grip/pose"),
                (ControllerAction::Haptic, "output/haptic", "output/haptic"),
                (ControllerAction::Trigger, "input/trigger/value", "input/trigger/value"),
                (ControllerAction::Grip, "input/squeeze/value", "input/squeeze/value"),
                (ControllerAction::PrimaryButton, "input/x/click", "input/a/click"),
                (ControllerAction::SecondaryButton, "input/y/click", "input/b/click"),
                (
                    ControllerAction::ThumbstickClick,
                    "input/thumbstick/click",
                    "input/thumbstick/click",
                ),
                (ControllerAction::ThumbstickX, "input/thumbstick/x", "input/thumbstick/x"),
                (ControllerAction::ThumbstickY, "input/thumbstick/y", "input/thumbstick/y"),
            ],
        )
    }

    pub fn valve_index() -> Self {
        Self::per_hand(
            "/interaction_profiles/valve/index_controller",
            &[
                (ControllerAction::PalmPose, "input/grip/pose", "input/grip/pose"),
                (ControllerAction::Haptic, "output/haptic", "output/haptic"),
                (ControllerAction::Trigger, "input/trigger/value", "input/trigger/value"),
                (ControllerAction::Grip, "input/squeeze/value", "input/squeeze/value"),
                (ControllerAction::PrimaryButton, "input/a/click", "input/a/click"),
                (ControllerAction::SecondaryButton, "input/b/click", "input/b/click"),
                (
                    ControllerAction::ThumbstickClick,
                    "input/thumbstick/click",
                    "input/thumbstick/click",
                ),
                (ControllerAction::ThumbstickX, "input/thumbstick/x", "input/thumbstick/x"),
                (ControllerAction::ThumbstickY, "input/thumbstick/y", "input/thumbstick/y"),
            ],
        )
    }

    pub fn khr_simple() -> Self {
        Self::per_hand(
            "/interaction_profiles/khr/simple_controller",
            &[
                (ControllerAction::PalmPose, "input/grip/pose", "input/grip/pose"),
                (ControllerAction::Haptic, "output/haptic", "output/haptic"),
                (ControllerAction::Trigger, "input/select/click", "input/select/click"),
                (ControllerAction::PrimaryButton, "input/menu/click", "input/menu/click"),
            ],
        )
    }
}

/// Top-level bridge configuration.
#[derive(Debug, Clone)]
pub struct XrConfig {
    pub application_name: String,
    pub application_version: u32,
    pub engine_name: String,
    pub engine_version: u32,
    pub api_version: Version,
    /// API layers to enable when the runtime has them.
    pub api_layers: Vec<String>,
    /// Extensions to enable when present; absence is logged, not fatal.
    pub optional_extensions: Vec<String>,
    pub form_factor: FormFactor,
    /// Ordered by preference.
    pub view_configurations: Vec<ViewConfigurationType>,
    /// Environment-blending modes, ordered by preference. Opaque is the
    /// fallback and need not be listed.
    pub blend_modes: Vec<BlendMode>,
    pub reference_space: ReferenceSpaceType,
    pub near_z: f32,
    pub far_z: f32,
    pub haptics: HapticConfig,
    pub interaction_profiles: Vec<InteractionProfileTable>,
}

impl Default for XrConfig {
    fn default() -> Self {
        Self {
            application_name: "xr-bridge".to_string(),
            application_version: 1,
            engine_name: "xr-bridge".to_string(),
            engine_version: 1,
            api_version: Version::new(1, 0, 0),
            api_layers: Vec::new(),
            optional_extensions: vec!["XR_KHR_composition_layer_depth".to_string()],
            form_factor: FormFactor::HeadMountedDisplay,
            view_configurations: vec![
                ViewConfigurationType::PrimaryStereo,
                ViewConfigurationType::PrimaryMono,
            ],
            blend_modes: vec![BlendMode::AlphaBlend, BlendMode::Additive],
            reference_space: ReferenceSpaceType::Stage,
            near_z: 0.05,
            far_z: 100.0,
            haptics: HapticConfig::default(),
            interaction_profiles: vec![
                InteractionProfileTable::oculus_touch(),
                InteractionProfileTable::valve_index(),
                InteractionProfileTable::khr_simple(),
            ],
        }
    }
}

impl XrConfig {
    pub fn application_info(&self) -> ApplicationInfo {
        ApplicationInfo {
            application_name: self.application_name.clone(),
            application_version: self.application_version,
            engine_name: self.engine_name.clone(),
            engine_version: self.engine_version,
            api_version: self.api_version,
        }
    }

    /// Parse a reference space name (`local`, `stage`, `view`).
    pub fn parse_reference_space(s: &str) -> Option<ReferenceSpaceType> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Some(ReferenceSpaceType::Local),
            "stage" => Some(ReferenceSpaceType::Stage),
            "view" => Some(ReferenceSpaceType::View),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = XrConfig::default();
        assert_eq!(config.reference_space, ReferenceSpaceType::Stage);
        assert_eq!(config.near_z, 0.05);
        assert_eq!(config.far_z, 100.0);
        assert_eq!(config.haptics.decay_factor, 0.5);
        assert_eq!(config.interaction_profiles.len(), 3);
        assert_eq!(
            config.view_configurations[0],
            ViewConfigurationType::PrimaryStereo
        );
    }

    #[test]
    fn test_oculus_table_per_hand_buttons() {
        let table = InteractionProfileTable::oculus_touch();
        assert_eq!(table.bindings.len(), 18);
        assert!(table.bindings.contains(&(
            ControllerAction::PrimaryButton,
            "/user/hand/left/input/x/click".to_string()
        )));
        assert!(table.bindings.contains(&(
            ControllerAction::PrimaryButton,
            "/user/hand/right/input/a/click".to_string()
        )));
    }

    #[test]
    fn test_table_paths_are_well_formed() {
        for table in XrConfig::default().interaction_profiles {
            assert!(crate::xr::paths::validate_path(&table.profile).is_ok());
            for (_, path) in &table.bindings {
                assert!(crate::xr::paths::validate_path(path).is_ok(), "{}", path);
            }
        }
    }

    #[test]
    fn test_parse_reference_space() {
        assert_eq!(
            XrConfig::parse_reference_space("STAGE"),
            Some(ReferenceSpaceType::Stage)
        );
        assert_eq!(XrConfig::parse_reference_space("bogus"), None);
    }
}
