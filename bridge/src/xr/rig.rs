//! A minimal scene-graph collaborator: one camera and two tracked
//! controllers. Hosts without their own scene graph use it directly.

use glam::Vec3;

use super::actions::{Axis, Button, ControllerSnapshot};
use super::render::{CameraState, SceneGraph};
use super::types::{Hand, Pose};

/// One tracked controller entity.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrackedController {
    pub position: Vec3,
    pub orientation: glam::Quat,
    /// Tracking was valid on the last update.
    pub tracked: bool,
    pub input: ControllerSnapshot,
}

impl TrackedController {
    pub fn pose(&self) -> Pose {
        Pose::new(self.position, self.orientation)
    }

    pub fn button(&self, button: Button) -> bool {
        self.input.button(button)
    }

    pub fn axis(&self, axis: Axis) -> f32 {
        self.input.axis(axis)
    }
}

#[derive(Debug, Clone, Default)]
pub struct XrRig {
    pub camera: CameraState,
    pub controllers: [TrackedController; 2],
    /// Controller updates received.
    pub updates: u64,
}

impl XrRig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn controller(&self, hand: Hand) -> &TrackedController {
        &self.controllers[hand.index()]
    }
}

impl SceneGraph for XrRig {
    fn camera(&self) -> CameraState {
        self.camera
    }

    fn set_camera(&mut self, camera: CameraState) {
        self.camera = camera;
    }

    fn set_controller(&mut self, hand: Hand, snapshot: &ControllerSnapshot) {
        let c = &mut self.controllers[hand.index()];
        c.position = snapshot.pose.position;
        c.orientation = snapshot.pose.orientation;
        c.tracked = snapshot.pose_active;
        c.input = *snapshot;
        self.updates += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    #[test]
    fn test_set_controller_copies_pose_and_input() {
        let mut rig = XrRig::new();
        let snapshot = ControllerSnapshot {
            pose: Pose::new(Vec3::new(0.3, 1.2, -0.4), Quat::from_rotation_x(0.2)),
            pose_active: true,
            trigger: 0.9,
            primary: true,
            ..ControllerSnapshot::default()
        };
        rig.set_controller(Hand::Right, &snapshot);
        let right = rig.controller(Hand::Right);
        assert_eq!(right.pose(), snapshot.pose);
        assert!(right.tracked);
        assert_eq!(right.axis(Axis::Trigger), 0.9);
        assert!(right.button(Button::Primary));
        assert!(!rig.controller(Hand::Left).tracked);
        assert_eq!(rig.updates, 1);
    }
}
