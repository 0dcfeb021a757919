//! Session controller: the runtime-driven session state machine.
//!
//! ```text
//! UNKNOWN -> IDLE -> READY -> SYNCHRONIZED -> VISIBLE -> FOCUSED
//!                     ^                                     |
//!                     |          STOPPING <-----------------+
//!                     +--- IDLE <---+
//!                                   EXITING / LOSS_PENDING (terminal)
//! ```
//!
//! Transitions arrive only as events. The controller reacts to READY by
//! beginning the session and to STOPPING by ending it; the terminal states
//! are surfaced as an [`ExitReason`] for the host.

use anyhow::Context;
use tracing::{debug, info, warn};

use super::runtime::{
    GraphicsBinding, Handle, HandleScope, SessionId, SpaceId, XrEvent, XrRuntime,
};
use super::types::{Pose, ReferenceSpaceType, SessionState, ViewConfigurationType};

/// Why the session will not render again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The session reached EXITING (normally after an exit request).
    Exiting,
    /// The session reached LOSS_PENDING.
    SessionLossPending,
    /// The runtime announced that the whole instance is going away.
    InstanceLossPending,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exiting => "exiting",
            Self::SessionLossPending => "session-loss-pending",
            Self::InstanceLossPending => "instance-loss-pending",
        }
    }
}

/// What one event drain observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSummary {
    pub events: usize,
    /// The bound interaction profile should be re-queried.
    pub profile_refresh: bool,
}

pub struct SessionController {
    session: SessionId,
    state: SessionState,
    running: bool,
    view_configuration: ViewConfigurationType,
    reference_space: SpaceId,
    reference_space_type: ReferenceSpaceType,
    exit: Option<ExitReason>,
}

impl SessionController {
    /// Create the session bound to `binding` and its reference space.
    pub fn create<R: XrRuntime + ?Sized>(
        runtime: &mut R,
        scope: &mut HandleScope,
        binding: &GraphicsBinding,
        view_configuration: ViewConfigurationType,
        reference_space_type: ReferenceSpaceType,
    ) -> anyhow::Result<Self> {
        let session = runtime
            .create_session(binding)
            .with_context(|| format!("VR: failed to create {} session", binding.as_str()))?;
        scope.track(Handle::Session(session));
        info!("VR: session created ({})", binding.as_str());

        let reference_space = runtime
            .create_reference_space(session, reference_space_type, Pose::IDENTITY)
            .with_context(|| {
                format!(
                    "VR: failed to create {} reference space",
                    reference_space_type.as_str()
                )
            })?;
        scope.track(Handle::Space(reference_space));
        info!("VR: reference space: {}", reference_space_type.as_str());

        Ok(Self {
            session,
            state: SessionState::Unknown,
            running: false,
            view_configuration,
            reference_space,
            reference_space_type,
            exit: None,
        })
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Begun and not yet ended: frame calls are legal.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Submitted frames are visible in the current state.
    pub fn is_renderable(&self) -> bool {
        self.running && self.state.is_renderable()
    }

    pub fn reference_space(&self) -> SpaceId {
        self.reference_space
    }

    pub fn reference_space_type(&self) -> ReferenceSpaceType {
        self.reference_space_type
    }

    pub fn view_configuration(&self) -> ViewConfigurationType {
        self.view_configuration
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit
    }

    /// Poll until the queue is empty, dispatching each event.
    pub fn drain_events<R: XrRuntime + ?Sized>(
        &mut self,
        runtime: &mut R,
    ) -> anyhow::Result<EventSummary> {
        let mut summary = EventSummary::default();
        while let Some(event) = runtime.poll_event().context("VR: failed to poll events")? {
            summary.events += 1;
            if self.handle_event(runtime, event)? {
                summary.profile_refresh = true;
            }
        }
        Ok(summary)
    }

    /// Dispatch one event. Returns whether the interaction profile should
    /// be re-queried.
    pub fn handle_event<R: XrRuntime + ?Sized>(
        &mut self,
        runtime: &mut R,
        event: XrEvent,
    ) -> anyhow::Result<bool> {
        match event {
            XrEvent::EventsLost { lost_event_count } => {
                warn!("VR: {} events lost", lost_event_count);
                Ok(false)
            }
            XrEvent::InstanceLossPending { loss_time } => {
                warn!("VR: instance loss pending at {}", loss_time.as_nanos());
                self.exit.get_or_insert(ExitReason::InstanceLossPending);
                Ok(false)
            }
            XrEvent::InteractionProfileChanged { session } => {
                if session != self.session {
                    debug!("VR: interaction profile change for another session ignored");
                    return Ok(false);
                }
                info!("VR: interaction profile changed");
                Ok(true)
            }
            XrEvent::ReferenceSpaceChangePending {
                session,
                reference_space_type,
                change_time,
            } => {
                if session != self.session {
                    debug!("VR: reference space change for another session ignored");
                    return Ok(false);
                }
                info!(
                    "VR: {} reference space change pending at {}",
                    reference_space_type.as_str(),
                    change_time.as_nanos()
                );
                Ok(false)
            }
            XrEvent::SessionStateChanged { session, state, .. } => {
                if session != self.session {
                    debug!("VR: state change for another session ignored");
                    return Ok(false);
                }
                self.handle_state_change(runtime, state)?;
                Ok(true)
            }
            XrEvent::Other => Ok(false),
        }
    }

    /// Apply a state transition and perform the required reaction.
    pub fn handle_state_change<R: XrRuntime + ?Sized>(
        &mut self,
        runtime: &mut R,
        new_state: SessionState,
    ) -> anyhow::Result<()> {
        let old = self.state;
        self.state = new_state;
        info!("VR: session state: {} -> {}", old.as_str(), new_state.as_str());

        match new_state {
            SessionState::Ready => {
                runtime
                    .begin_session(self.session, self.view_configuration)
                    .context("VR: failed to begin session")?;
                self.running = true;
                info!(
                    "VR: session begun ({})",
                    self.view_configuration.as_str()
                );
            }
            SessionState::Stopping => {
                runtime
                    .end_session(self.session)
                    .context("VR: failed to end session")?;
                self.running = false;
                info!("VR: session ended");
            }
            SessionState::Exiting => {
                self.running = false;
                self.exit.get_or_insert(ExitReason::Exiting);
            }
            SessionState::LossPending => {
                warn!("VR: session loss pending");
                self.running = false;
                self.exit.get_or_insert(ExitReason::SessionLossPending);
            }
            _ => {}
        }
        Ok(())
    }

    /// Ask the runtime to wind the session down. Only meaningful while
    /// running; the state machine then proceeds through STOPPING.
    pub fn request_exit<R: XrRuntime + ?Sized>(&mut self, runtime: &mut R) -> anyhow::Result<()> {
        if !self.running {
            debug!("VR: exit requested while session not running");
            return Ok(());
        }
        runtime
            .request_exit_session(self.session)
            .context("VR: failed to request session exit")?;
        info!("VR: session exit requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::XrConfig;
    use crate::xr::runtime::SessionId;
    use crate::xr::sim::{SimCall, SimConfig, SimRuntime};
    use crate::xr::types::{FormFactor, XrTime};

    fn controller(sim_config: SimConfig) -> (SimRuntime, HandleScope, SessionController) {
        let mut sim = SimRuntime::new(sim_config);
        sim.create_instance(
            &XrConfig::default().application_info(),
            &["XR_MND_headless".to_string()],
            &[],
        )
        .unwrap();
        sim.system(FormFactor::HeadMountedDisplay).unwrap();
        let mut scope = HandleScope::new();
        let c = SessionController::create(
            &mut sim,
            &mut scope,
            &GraphicsBinding::Headless,
            ViewConfigurationType::PrimaryStereo,
            ReferenceSpaceType::Stage,
        )
        .unwrap();
        (sim, scope, c)
    }

    #[test]
    fn test_create_tracks_session_and_space() {
        let (sim, scope, c) = controller(SimConfig::default());
        assert!(scope.contains(Handle::Session(c.session())));
        assert!(scope.contains(Handle::Space(c.reference_space())));
        assert_eq!(
            sim.count_calls(|call| *call == SimCall::CreateReferenceSpace(ReferenceSpaceType::Stage)),
            1
        );
        assert!(!c.is_running());
    }

    #[test]
    fn test_ready_begins_session() {
        let (mut sim, _, mut c) = controller(SimConfig {
            auto_lifecycle: false,
            ..SimConfig::default()
        });
        sim.push_state(SessionState::Idle);
        sim.push_state(SessionState::Ready);
        let summary = c.drain_events(&mut sim).unwrap();
        assert_eq!(summary.events, 2);
        assert_eq!(c.state(), SessionState::Ready);
        assert!(c.is_running());
        assert!(!c.is_renderable());
        assert_eq!(sim.count_calls(|call| *call == SimCall::BeginSession), 1);

        sim.push_state(SessionState::Synchronized);
        c.drain_events(&mut sim).unwrap();
        assert!(c.is_renderable());
    }

    #[test]
    fn test_lifecycle_runs_to_focused_in_one_drain() {
        let (mut sim, _, mut c) = controller(SimConfig::default());
        let summary = c.drain_events(&mut sim).unwrap();
        assert_eq!(summary.events, 5);
        assert!(summary.profile_refresh);
        assert_eq!(c.state(), SessionState::Focused);
        assert!(c.is_renderable());
    }

    #[test]
    fn test_stopping_ends_session() {
        let (mut sim, _, mut c) = controller(SimConfig::default());
        c.drain_events(&mut sim).unwrap();
        sim.push_state(SessionState::Stopping);
        c.drain_events(&mut sim).unwrap();
        assert!(!c.is_running());
        assert_eq!(sim.count_calls(|call| *call == SimCall::EndSession), 1);
        assert!(c.exit_reason().is_none());
    }

    #[test]
    fn test_exit_request_reaches_exiting() {
        let (mut sim, _, mut c) = controller(SimConfig::default());
        c.drain_events(&mut sim).unwrap();
        c.request_exit(&mut sim).unwrap();
        c.drain_events(&mut sim).unwrap();
        assert_eq!(sim.count_calls(|call| *call == SimCall::EndSession), 1);
        assert_eq!(c.state(), SessionState::Exiting);
        assert_eq!(c.exit_reason(), Some(ExitReason::Exiting));
    }

    #[test]
    fn test_loss_pending_is_terminal() {
        let (mut sim, _, mut c) = controller(SimConfig::default());
        c.drain_events(&mut sim).unwrap();
        sim.push_state(SessionState::LossPending);
        c.drain_events(&mut sim).unwrap();
        assert_eq!(c.exit_reason(), Some(ExitReason::SessionLossPending));
        assert!(!c.is_running());
    }

    #[test]
    fn test_instance_loss_pending_signals_exit() {
        let (mut sim, _, mut c) = controller(SimConfig::default());
        sim.push_event(XrEvent::InstanceLossPending {
            loss_time: XrTime(5),
        });
        c.drain_events(&mut sim).unwrap();
        assert_eq!(c.exit_reason(), Some(ExitReason::InstanceLossPending));
    }

    #[test]
    fn test_foreign_session_events_ignored() {
        let (mut sim, _, mut c) = controller(SimConfig {
            auto_lifecycle: false,
            ..SimConfig::default()
        });
        sim.push_event(XrEvent::SessionStateChanged {
            session: SessionId(9999),
            state: SessionState::Ready,
            time: XrTime(0),
        });
        sim.push_event(XrEvent::InteractionProfileChanged {
            session: SessionId(9999),
        });
        let summary = c.drain_events(&mut sim).unwrap();
        assert_eq!(summary.events, 2);
        assert!(!summary.profile_refresh);
        assert_eq!(c.state(), SessionState::Unknown);
    }

    #[test]
    fn test_transient_events_do_not_fail() {
        let (mut sim, _, mut c) = controller(SimConfig {
            auto_lifecycle: false,
            ..SimConfig::default()
        });
        let session = c.session();
        sim.push_event(XrEvent::EventsLost {
            lost_event_count: 3,
        });
        sim.push_event(XrEvent::ReferenceSpaceChangePending {
            session,
            reference_space_type: ReferenceSpaceType::Stage,
            change_time: XrTime(10),
        });
        sim.push_event(XrEvent::Other);
        sim.push_event(XrEvent::InteractionProfileChanged { session });
        let summary = c.drain_events(&mut sim).unwrap();
        assert_eq!(summary.events, 4);
        assert!(summary.profile_refresh);
        assert!(c.exit_reason().is_none());
    }

    #[test]
    fn test_request_exit_when_not_running_is_noop() {
        let (mut sim, _, mut c) = controller(SimConfig::default());
        c.request_exit(&mut sim).unwrap();
        assert_eq!(sim.count_calls(|call| *call == SimCall::RequestExitSession), 0);
    }
}
