//! View configuration, blend mode and per-view swapchains.
//!
//! Resolution happens once: the view topology and blend mode before the
//! session begins, the swapchains right after the session is created. Image
//! pools are runtime-sized and never change afterwards.

use anyhow::{bail, Context};
use tracing::{debug, info, warn};

use super::runtime::{
    GraphicsBinding, Handle, HandleScope, SessionId, SwapchainCreateInfo, SwapchainId, XrRuntime,
};
use super::types::{BlendMode, ViewConfigurationType, ViewConfigurationView};
use crate::config::XrConfig;

/// Pick the first preferred view configuration the device supports, or
/// fall back to stereo.
pub fn select_view_configuration(
    supported: &[ViewConfigurationType],
    preferred: &[ViewConfigurationType],
) -> ViewConfigurationType {
    match preferred.iter().find(|p| supported.contains(p)) {
        Some(ty) => *ty,
        None => {
            warn!(
                "VR: no preferred view configuration supported (device offers {:?}), defaulting to stereo",
                supported
            );
            ViewConfigurationType::PrimaryStereo
        }
    }
}

/// Pick the first preferred environment-blending mode the device supports,
/// else opaque.
pub fn select_blend_mode(supported: &[BlendMode], preferred: &[BlendMode]) -> BlendMode {
    if let Some(mode) = preferred.iter().find(|p| supported.contains(p)) {
        return *mode;
    }
    if supported.contains(&BlendMode::Opaque) || supported.is_empty() {
        if supported.is_empty() {
            warn!("VR: runtime reported no blend modes, assuming opaque");
        }
        return BlendMode::Opaque;
    }
    warn!(
        "VR: no preferred blend mode supported, using runtime's first ({})",
        supported[0].as_str()
    );
    supported[0]
}

/// Pick the first preferred color format the runtime supports, else the
/// runtime's own first choice.
pub fn select_color_format(supported: &[i64], preferred: &[i64]) -> Option<i64> {
    if let Some(format) = preferred.iter().find(|p| supported.contains(p)) {
        return Some(*format);
    }
    let fallback = supported.first().copied()?;
    if !preferred.is_empty() {
        warn!(
            "VR: no preferred color format supported, using runtime format {:#x}",
            fallback
        );
    }
    Some(fallback)
}

/// View topology and blend mode, resolved before the session begins.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewSetup {
    pub view_configuration: ViewConfigurationType,
    pub views: Vec<ViewConfigurationView>,
    pub blend_mode: BlendMode,
}

impl ViewSetup {
    pub fn resolve<R: XrRuntime + ?Sized>(
        runtime: &mut R,
        config: &XrConfig,
    ) -> anyhow::Result<Self> {
        let supported = runtime
            .enumerate_view_configurations()
            .context("VR: failed to enumerate view configurations")?;
        let view_configuration = select_view_configuration(&supported, &config.view_configurations);

        let views = runtime
            .enumerate_view_configuration_views(view_configuration)
            .with_context(|| {
                format!(
                    "VR: failed to enumerate views for {}",
                    view_configuration.as_str()
                )
            })?;
        if views.is_empty() {
            bail!(
                "VR: runtime reported no views for {}",
                view_configuration.as_str()
            );
        }

        let modes = runtime
            .enumerate_blend_modes(view_configuration)
            .context("VR: failed to enumerate blend modes")?;
        let blend_mode = select_blend_mode(&modes, &config.blend_modes);

        info!(
            "VR: view configuration {} with {} view(s), recommended {}x{} x{}, blend {}",
            view_configuration.as_str(),
            views.len(),
            views[0].recommended_width,
            views[0].recommended_height,
            views[0].recommended_sample_count,
            blend_mode.as_str(),
        );
        Ok(Self {
            view_configuration,
            views,
            blend_mode,
        })
    }
}

/// One color swapchain and its image pool.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewSwapchain {
    pub swapchain: SwapchainId,
    pub width: u32,
    pub height: u32,
    pub sample_count: u32,
    /// Native image names, indexed by the acquired index.
    pub images: Vec<u32>,
}

/// Per-view swapchains for the session.
#[derive(Debug)]
pub struct SwapchainManager {
    setup: ViewSetup,
    format: i64,
    swapchains: Vec<ViewSwapchain>,
}

impl SwapchainManager {
    /// Create one color swapchain per view, sized to the recommendation.
    pub fn create<R: XrRuntime + ?Sized>(
        runtime: &mut R,
        scope: &mut HandleScope,
        session: SessionId,
        setup: ViewSetup,
        binding: &GraphicsBinding,
    ) -> anyhow::Result<Self> {
        let formats = runtime
            .enumerate_swapchain_formats(session)
            .context("VR: failed to enumerate swapchain formats")?;
        let format = match select_color_format(&formats, binding.preferred_color_formats()) {
            Some(f) => f,
            None => bail!("VR: runtime offers no swapchain formats"),
        };
        debug!("VR: swapchain formats {:?}, selected {:#x}", formats, format);

        let mut swapchains = Vec::with_capacity(setup.views.len());
        for (i, view) in setup.views.iter().enumerate() {
            let info = SwapchainCreateInfo {
                format,
                width: view.recommended_width,
                height: view.recommended_height,
                sample_count: view.recommended_sample_count,
                face_count: 1,
                array_size: 1,
                mip_count: 1,
                color_attachment: true,
                sampled: true,
            };
            let swapchain = runtime
                .create_swapchain(session, &info)
                .with_context(|| format!("VR: failed to create swapchain for view {}", i))?;
            scope.track(Handle::Swapchain(swapchain));

            let images = runtime
                .enumerate_swapchain_images(swapchain)
                .with_context(|| format!("VR: failed to enumerate images for view {}", i))?;
            info!(
                "VR: view {} swapchain {}x{} x{} with {} image(s)",
                i,
                info.width,
                info.height,
                info.sample_count,
                images.len()
            );
            swapchains.push(ViewSwapchain {
                swapchain,
                width: info.width,
                height: info.height,
                sample_count: info.sample_count,
                images,
            });
        }

        Ok(Self {
            setup,
            format,
            swapchains,
        })
    }

    pub fn view_configuration(&self) -> ViewConfigurationType {
        self.setup.view_configuration
    }

    pub fn blend_mode(&self) -> BlendMode {
        self.setup.blend_mode
    }

    pub fn format(&self) -> i64 {
        self.format
    }

    pub fn view_count(&self) -> usize {
        self.swapchains.len()
    }

    pub fn swapchains(&self) -> &[ViewSwapchain] {
        &self.swapchains
    }

    pub fn swapchain(&self, view: usize) -> Option<&ViewSwapchain> {
        self.swapchains.get(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xr::runtime::{GL_RGBA8, GL_SRGB8_ALPHA8};
    use crate::xr::sim::{SimCall, SimConfig, SimRuntime};

    #[test]
    fn test_view_configuration_prefers_listed_order() {
        let supported = [
            ViewConfigurationType::PrimaryMono,
            ViewConfigurationType::PrimaryStereo,
        ];
        assert_eq!(
            select_view_configuration(&supported, &[ViewConfigurationType::PrimaryStereo]),
            ViewConfigurationType::PrimaryStereo
        );
        assert_eq!(
            select_view_configuration(&[ViewConfigurationType::PrimaryMono], &[
                ViewConfigurationType::PrimaryStereo,
                ViewConfigurationType::PrimaryMono
            ]),
            ViewConfigurationType::PrimaryMono
        );
    }

    #[test]
    fn test_view_configuration_defaults_to_stereo() {
        assert_eq!(
            select_view_configuration(&[], &[ViewConfigurationType::PrimaryMono]),
            ViewConfigurationType::PrimaryStereo
        );
    }

    #[test]
    fn test_blend_mode_selection() {
        let preferred = [BlendMode::AlphaBlend, BlendMode::Additive];
        assert_eq!(
            select_blend_mode(&[BlendMode::Opaque], &preferred),
            BlendMode::Opaque
        );
        assert_eq!(
            select_blend_mode(&[BlendMode::Opaque, BlendMode::Additive], &preferred),
            BlendMode::Additive
        );
        assert_eq!(
            select_blend_mode(&[BlendMode::Additive, BlendMode::AlphaBlend], &preferred),
            BlendMode::AlphaBlend
        );
        assert_eq!(select_blend_mode(&[], &preferred), BlendMode::Opaque);
    }

    #[test]
    fn test_color_format_selection() {
        let preferred = [GL_SRGB8_ALPHA8, GL_RGBA8];
        assert_eq!(
            select_color_format(&[GL_RGBA8, GL_SRGB8_ALPHA8], &preferred),
            Some(GL_SRGB8_ALPHA8)
        );
        assert_eq!(select_color_format(&[0x1234], &preferred), Some(0x1234));
        assert_eq!(select_color_format(&[], &preferred), None);
    }

    #[test]
    fn test_create_one_swapchain_per_view() {
        let mut sim = SimRuntime::new(SimConfig {
            swapchain_length: 4,
            ..SimConfig::default()
        });
        let session = sim.bootstrap_running_session().unwrap();
        let setup = ViewSetup::resolve(&mut sim, &XrConfig::default()).unwrap();
        assert_eq!(setup.view_configuration, ViewConfigurationType::PrimaryStereo);
        assert_eq!(setup.blend_mode, BlendMode::Opaque);

        let mut scope = HandleScope::new();
        let binding = GraphicsBinding::OpenGlXlib {
            x_display: 1,
            visual_id: 2,
            glx_fb_config: 3,
            glx_drawable: 4,
            glx_context: 5,
        };
        let manager =
            SwapchainManager::create(&mut sim, &mut scope, session, setup, &binding).unwrap();
        assert_eq!(manager.view_count(), 2);
        assert_eq!(manager.format(), GL_SRGB8_ALPHA8);
        assert_eq!(scope.len(), 2);
        for sc in manager.swapchains() {
            assert_eq!((sc.width, sc.height, sc.sample_count), (1440, 1600, 1));
            assert_eq!(sc.images.len(), 4);
        }
        let created: Vec<SwapchainCreateInfo> = sim
            .calls()
            .iter()
            .filter_map(|c| match c {
                SimCall::CreateSwapchain(info) => Some(*info),
                _ => None,
            })
            .collect();
        assert_eq!(created.len(), 2);
        assert!(created
            .iter()
            .all(|i| i.color_attachment && i.sampled && i.array_size == 1 && i.mip_count == 1));
    }

    #[test]
    fn test_mono_device() {
        let mut sim = SimRuntime::new(SimConfig {
            view_configurations: vec![ViewConfigurationType::PrimaryMono],
            ..SimConfig::default()
        });
        sim.create_instance(&XrConfig::default().application_info(), &[], &[])
            .unwrap();
        let setup = ViewSetup::resolve(&mut sim, &XrConfig::default()).unwrap();
        assert_eq!(setup.view_configuration, ViewConfigurationType::PrimaryMono);
        assert_eq!(setup.views.len(), 1);
    }
}
