//! Cloneable front door to the rotation controller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use carousel_core::{PlanId, StatusView, Trigger};
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{RotationError, RotationResult};

/// Requests consumed by the controller loop.
#[derive(Debug)]
pub(crate) enum Command {
    Rotate {
        trigger: Trigger,
        reply: oneshot::Sender<RotationResult<PlanId>>,
    },
    ClearQuarantine {
        name: String,
        reply: oneshot::Sender<RotationResult<()>>,
    },
}

/// Sends triggers and commands to the controller and reads its status.
#[derive(Clone)]
pub struct RotationHandle {
    commands: mpsc::Sender<Command>,
    busy: Arc<AtomicBool>,
    status: watch::Receiver<StatusView>,
}

impl RotationHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        busy: Arc<AtomicBool>,
        status: watch::Receiver<StatusView>,
    ) -> Self {
        Self {
            commands,
            busy,
            status,
        }
    }

    /// Whether a rotation plan is in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Ask for a rotation cycle.
    ///
    /// Resolves once the controller has accepted the trigger (not when the
    /// cycle finishes), with the id of the plan it opened. Rejected with
    /// `RotationInProgress` while a plan is in flight; never queued.
    pub async fn rotate(&self, trigger: Trigger) -> RotationResult<PlanId> {
        // Claim the cycle here so a second caller is turned away at once.
        // The controller clears the flag when the plan finishes.
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RotationError::RotationInProgress);
        }
        let (reply, rx) = oneshot::channel();
        if let Err(e) = self.commands.try_send(Command::Rotate { trigger, reply }) {
            self.busy.store(false, Ordering::Release);
            return Err(match e {
                mpsc::error::TrySendError::Full(_) => RotationError::RotationInProgress,
                mpsc::error::TrySendError::Closed(_) => RotationError::ControllerStopped,
            });
        }
        rx.await.map_err(|_| RotationError::ControllerStopped)?
    }

    /// Return a Quarantined instance to Standby.
    pub async fn clear_quarantine(&self, name: &str) -> RotationResult<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ClearQuarantine {
                name: name.to_string(),
                reply,
            })
            .await
            .map_err(|_| RotationError::ControllerStopped)?;
        rx.await.map_err(|_| RotationError::ControllerStopped)?
    }

    /// Latest published status.
    pub fn status(&self) -> StatusView {
        self.status.borrow().clone()
    }

    /// Watch status updates.
    pub fn subscribe(&self) -> watch::Receiver<StatusView> {
        self.status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::empty_view;

    fn handle() -> (RotationHandle, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(4);
        let (_, status) = watch::channel(empty_view());
        (RotationHandle::new(tx, Arc::new(AtomicBool::new(false)), status), rx)
    }

    #[tokio::test]
    async fn second_trigger_is_rejected_before_the_first_is_picked_up() {
        let (handle, mut commands) = handle();
        let first = tokio::spawn({
            let handle = handle.clone();
            async move { handle.rotate(Trigger::Scheduled).await }
        });

        let Some(Command::Rotate { trigger, reply }) = commands.recv().await else {
            panic!("expected a rotate command");
        };
        assert_eq!(trigger, Trigger::Scheduled);
        assert!(handle.is_busy());
        assert_eq!(
            handle.rotate(Trigger::Manual).await,
            Err(RotationError::RotationInProgress)
        );
        assert!(commands.try_recv().is_err());

        reply.send(Ok(7)).unwrap();
        assert_eq!(first.await.unwrap(), Ok(7));
    }

    #[tokio::test]
    async fn stopped_controller_releases_the_claim() {
        let (handle, commands) = handle();
        drop(commands);

        assert_eq!(
            handle.rotate(Trigger::Manual).await,
            Err(RotationError::ControllerStopped)
        );
        assert!(!handle.is_busy());
    }
}
