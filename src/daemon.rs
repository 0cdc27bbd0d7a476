//! The control-context event loop.
//!
//! One task owns the [`SensorManager`] value and multiplexes everything that
//! may mutate it: sample records dequeued from the cross-thread pipe,
//! lost-session notifications from the socket handler, and power/display
//! transitions from the platform notifier. Exactly one of these runs at a
//! time; producers never touch the registries.

use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::manager::SensorManager;
use crate::pipe::SampleReceiver;
use crate::session::SessionId;

/// Out-of-band events routed into the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Display turned on or off.
    Display(bool),
    /// Power-save mode engaged or released.
    PowerSave(bool),
    /// Dump the registry to the log (operator signal).
    PrintStatus,
}

/// Runs the control loop until `shutdown` fires (or every input closes),
/// then hands the manager back for teardown.
pub async fn run(
    mut manager: SensorManager,
    mut samples: SampleReceiver,
    mut lost_sessions: mpsc::UnboundedReceiver<SessionId>,
    mut events: mpsc::UnboundedReceiver<ControlEvent>,
    mut shutdown: oneshot::Receiver<()>,
) -> SensorManager {
    info!("control loop running");
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(record) = samples.recv() => manager.writeout(record),
            Some(session) = lost_sessions.recv() => manager.lost_client(session),
            Some(event) = events.recv() => match event {
                ControlEvent::Display(state) => manager.display_state_changed(state),
                ControlEvent::PowerSave(state) => manager.psm_state_changed(state),
                ControlEvent::PrintStatus => {
                    for line in manager.print_status() {
                        info!("{line}");
                    }
                }
            },
            else => break,
        }
    }
    info!("control loop stopped");
    manager
}
