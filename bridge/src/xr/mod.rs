//! XR subsystem: runtime seam, session lifecycle, input and frame submission.
//!
//! Provides:
//! - `XrBridge`: one object owning negotiation, session, actions and swapchains
//! - `FrameLoop`: the per-frame wait/begin/render/end protocol
//! - `SimRuntime`: an in-process runtime used by the headless host and tests
//! - `OpenXrRuntime`: the real runtime backend (gated behind `vr` feature)

pub mod actions;
pub mod bridge;
pub mod error;
pub mod frame_loop;
pub mod frame_timing;
pub mod negotiate;
pub mod paths;
pub mod render;
pub mod rig;
pub mod runtime;
pub mod session;
pub mod sim;
pub mod swapchain;
pub mod types;

#[cfg(feature = "vr")]
pub mod openxr_runtime;

pub use actions::{Axis, Button, ControllerSnapshot};
pub use bridge::{RuntimeSummary, XrBridge};
pub use error::{RuntimeError, XrResult};
pub use frame_loop::FrameOutcome;
pub use render::{HeadlessRenderer, SceneGraph, ViewRenderer};
pub use rig::XrRig;
pub use runtime::{GraphicsBinding, XrRuntime};
pub use session::ExitReason;
pub use sim::{SimConfig, SimRuntime};
pub use types::{Hand, Pose, ReferenceSpaceType, SessionState};

#[cfg(feature = "vr")]
pub use openxr_runtime::OpenXrRuntime;
