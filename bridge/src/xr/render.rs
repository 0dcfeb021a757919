//! Seams to the external renderer and scene graph.
//!
//! The bridge never draws. Per eye it writes the camera into the scene,
//! asks a [`ViewRenderer`] for a color image, then asks it to copy that
//! image into the acquired swapchain image.

use glam::Mat4;

use super::actions::ControllerSnapshot;
use super::types::{Fov, Hand, Pose};

/// Everything the renderer needs for one eye.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeView {
    pub index: usize,
    pub pose: Pose,
    pub fov: Fov,
    /// World-to-eye transform (inverse of the eye pose).
    pub view: Mat4,
    pub projection: Mat4,
    pub width: u32,
    pub height: u32,
}

impl EyeView {
    pub fn new(index: usize, pose: Pose, fov: Fov, width: u32, height: u32, near_z: f32, far_z: f32) -> Self {
        Self {
            index,
            pose,
            fov,
            view: pose.to_matrix().inverse(),
            projection: fov.projection(near_z, far_z),
            width,
            height,
        }
    }
}

/// A color image produced by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderedImage {
    /// Source framebuffer handle.
    pub framebuffer: u32,
    pub width: u32,
    pub height: u32,
}

/// The acquired swapchain image a rendered view is copied into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainTarget {
    pub view_index: usize,
    pub image_index: u32,
    /// Native image name (GL texture).
    pub image: u32,
    pub width: u32,
    pub height: u32,
}

/// External renderer, invoked once per view per frame.
pub trait ViewRenderer {
    fn render_view(&mut self, eye: &EyeView) -> anyhow::Result<RenderedImage>;
    fn blit(&mut self, image: &RenderedImage, target: &SwapchainTarget) -> anyhow::Result<()>;
}

/// Active camera as the scene graph stores it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraState {
    pub pose: Pose,
    pub projection: Mat4,
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            pose: Pose::IDENTITY,
            projection: Mat4::IDENTITY,
        }
    }
}

/// External scene graph: one active camera and two tracked controllers.
pub trait SceneGraph {
    fn camera(&self) -> CameraState;
    fn set_camera(&mut self, camera: CameraState);
    fn set_controller(&mut self, hand: Hand, snapshot: &ControllerSnapshot);
}

/// Renderer that draws nothing. Used by the headless host.
#[derive(Debug, Default)]
pub struct HeadlessRenderer {
    pub rendered: u64,
    pub blits: u64,
}

impl ViewRenderer for HeadlessRenderer {
    fn render_view(&mut self, eye: &EyeView) -> anyhow::Result<RenderedImage> {
        self.rendered += 1;
        Ok(RenderedImage {
            framebuffer: eye.index as u32,
            width: eye.width,
            height: eye.height,
        })
    }

    fn blit(&mut self, _image: &RenderedImage, _target: &SwapchainTarget) -> anyhow::Result<()> {
        self.blits += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    #[test]
    fn test_eye_view_inverts_pose() {
        let pose = Pose::new(Vec3::new(0.0, 1.6, 0.0), Quat::IDENTITY);
        let eye = EyeView::new(0, pose, Fov::symmetric(0.7), 100, 100, 0.05, 100.0);
        let origin = eye.view.transform_point3(Vec3::new(0.0, 1.6, 0.0));
        assert!(origin.length() < 1e-5);
    }

    #[test]
    fn test_headless_renderer_counts() {
        let mut r = HeadlessRenderer::default();
        let eye = EyeView::new(1, Pose::IDENTITY, Fov::symmetric(0.7), 64, 32, 0.05, 100.0);
        let image = r.render_view(&eye).unwrap();
        assert_eq!((image.width, image.height), (64, 32));
        r.blit(
            &image,
            &SwapchainTarget {
                view_index: 1,
                image_index: 0,
                image: 7,
                width: 64,
                height: 32,
            },
        )
        .unwrap();
        assert_eq!((r.rendered, r.blits), (1, 1));
    }
}
