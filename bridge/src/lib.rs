//! xr-bridge: head-mounted display session bridge.
//!
//! Connects an application's renderer and scene graph to an OpenXR-style
//! runtime: negotiates the instance, runs the session state machine, maps
//! controller input, and submits one stereo projection layer per frame.

pub mod config;
pub mod host;
pub mod xr;
