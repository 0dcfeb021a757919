//! Headless host: drives the bridge without a window or real renderer.
//!
//! Runs initialize, then frames until a signal, a frame limit, or the
//! session winding down, with graceful signal handling and periodic
//! status logging.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::xr::{
    ExitReason, FrameOutcome, GraphicsBinding, SceneGraph, ViewRenderer, XrBridge, XrRuntime,
};

/// Global flag set by SIGTERM/SIGINT handlers.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Host loop configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Stop after this many frames (wait/begin/end cycles).
    pub frames: Option<u64>,
    /// Sleep between polls while the session is not running.
    pub idle_sleep_ms: u64,
    pub status_interval: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            frames: None,
            idle_sleep_ms: 100,
            status_interval: Duration::from_secs(60),
        }
    }
}

/// What the host loop did before it returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostReport {
    pub frames: u64,
    pub rendered: u64,
    pub exit: Option<ExitReason>,
}

/// Install signal handlers for graceful shutdown (SIGTERM, SIGINT).
fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as libc::sighandler_t);
        libc::signal(libc::SIGINT, signal_handler as libc::sighandler_t);
    }
}

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Run the bridge until it is told to stop.
///
/// A signal first asks the runtime to end the session so the state machine
/// winds down through its normal events; if no session is running the loop
/// stops immediately. The bridge is always shut down before returning.
pub fn run<R, V, S>(
    bridge: &mut XrBridge<R>,
    binding: &GraphicsBinding,
    renderer: &mut V,
    scene: &mut S,
    config: &HostConfig,
) -> anyhow::Result<HostReport>
where
    R: XrRuntime,
    V: ViewRenderer + ?Sized,
    S: SceneGraph + ?Sized,
{
    if !bridge.is_initialized() {
        bridge.initialize(binding)?;
    }

    install_signal_handlers();

    let idle = Duration::from_millis(config.idle_sleep_ms);
    let start_time = Instant::now();
    let mut last_status_log = Instant::now();
    let mut report = HostReport::default();
    let mut exit_requested = false;

    info!(
        "VR: host loop started (frame limit: {}, idle sleep: {}ms)",
        config.frames.map_or_else(|| "none".to_string(), |n| n.to_string()),
        config.idle_sleep_ms
    );

    let result = loop {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) && !exit_requested {
            info!("VR: shutdown signal received");
            if !bridge.is_running() {
                break Ok(());
            }
            exit_requested = true;
            if let Err(e) = bridge.request_exit() {
                break Err(e);
            }
        }

        if let Some(limit) = config.frames {
            if report.frames >= limit {
                info!("VR: frame limit reached after {} frame(s)", limit);
                break Ok(());
            }
        }

        if last_status_log.elapsed() >= config.status_interval {
            info!(
                "VR: status: session {}, {} frame(s) in {}s, {}",
                bridge.session_state().as_str(),
                report.frames,
                start_time.elapsed().as_secs(),
                bridge.timing_stats()
            );
            last_status_log = Instant::now();
        }

        match bridge.run_frame(renderer, scene) {
            Ok(FrameOutcome::NotRunning) => {
                if exit_requested {
                    break Ok(());
                }
                thread::sleep(idle);
            }
            Ok(FrameOutcome::Skipped) => report.frames += 1,
            Ok(FrameOutcome::Rendered { .. }) => {
                report.frames += 1;
                report.rendered += 1;
            }
            Ok(FrameOutcome::Exit(reason)) => {
                info!("VR: session finished ({})", reason.as_str());
                report.exit = Some(reason);
                break Ok(());
            }
            Err(e) => {
                warn!("VR: frame failed: {:#}", e);
                break Err(e);
            }
        }
    };

    info!("VR: frame timing: {}", bridge.timing_stats());
    bridge.shutdown();
    result.map(|()| report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::XrConfig;
    use crate::xr::sim::SimCall;
    use crate::xr::types::FormFactor;
    use crate::xr::{HeadlessRenderer, SimConfig, SimRuntime, XrRig};

    fn bridge(sim_config: SimConfig) -> XrBridge<SimRuntime> {
        XrBridge::new(SimRuntime::new(sim_config), XrConfig::default())
    }

    #[test]
    fn test_frame_limit_stops_and_shuts_down() {
        let mut b = bridge(SimConfig::default());
        let mut renderer = HeadlessRenderer::default();
        let mut rig = XrRig::new();
        let config = HostConfig {
            frames: Some(5),
            ..HostConfig::default()
        };
        let report = run(&mut b, &GraphicsBinding::Headless, &mut renderer, &mut rig, &config).unwrap();
        assert_eq!(report.frames, 5);
        assert_eq!(report.rendered, 5);
        assert_eq!(report.exit, None);
        assert_eq!(b.runtime().frames_ended(), 5);
        assert_eq!(renderer.rendered, 10);
        assert!(!b.is_initialized());
    }

    #[test]
    fn test_exit_request_ends_loop() {
        let mut b = bridge(SimConfig::default());
        let mut renderer = HeadlessRenderer::default();
        let mut rig = XrRig::new();
        b.initialize(&GraphicsBinding::Headless).unwrap();
        b.run_frame(&mut renderer, &mut rig).unwrap();
        b.request_exit().unwrap();

        let config = HostConfig {
            frames: Some(100),
            ..HostConfig::default()
        };
        let report = run(&mut b, &GraphicsBinding::Headless, &mut renderer, &mut rig, &config).unwrap();
        assert_eq!(report.exit, Some(ExitReason::Exiting));
        assert!(report.frames < 100);
        assert_eq!(b.runtime().count_calls(|c| *c == SimCall::EndSession), 1);
    }

    #[test]
    fn test_initialize_failure_propagates() {
        let mut b = bridge(SimConfig {
            form_factors: vec![FormFactor::HandheldDisplay],
            ..SimConfig::default()
        });
        let err = run(
            &mut b,
            &GraphicsBinding::Headless,
            &mut HeadlessRenderer::default(),
            &mut XrRig::new(),
            &HostConfig::default(),
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("no head-mounted-display device connected"));
        assert_eq!(b.runtime().count_calls(|c| *c == SimCall::WaitFrame), 0);
    }
}
