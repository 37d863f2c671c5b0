//! Session task: one input channel, one timer.
//!
//! [`spawn`] builds a [`SessionController`] from a [`Config`] and runs it on a
//! single tokio task. The loop waits for either the next [`Input`] or the
//! earliest timer deadline the controller reports, then hands control to the
//! controller until it returns. Nothing else ever touches session state.

use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::client::ChatApiClient;
use crate::config::{Config, CreationMode};
use crate::error::ChatError;
use crate::session::{ConversationCreator, Input, Intent, SessionController, SessionEvent};
use crate::transport::SocketIoConnector;

/// Handle to a running session task.
pub struct SessionHandle {
    inputs: mpsc::UnboundedSender<Input>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Queue a message for sending. Returns `false` if the session has ended.
    pub fn send(&self, text: impl Into<String>) -> bool {
        self.intent(Intent::Send(text.into()))
    }

    pub fn force_reconnect(&self) -> bool {
        self.intent(Intent::ForceReconnect)
    }

    /// Ask the session to release its connection and stop, then wait for it.
    pub async fn shutdown(self) {
        self.intent(Intent::Shutdown);
        if let Err(e) = self.task.await {
            debug!("session task ended abnormally: {e}");
        }
    }

    fn intent(&self, intent: Intent) -> bool {
        self.inputs.send(Input::Intent(intent)).is_ok()
    }
}

/// Start a session for `user_id`. Events for the presentation layer arrive
/// on the returned receiver.
pub fn spawn(
    config: &Config,
    user_id: &str,
) -> Result<(SessionHandle, mpsc::UnboundedReceiver<SessionEvent>), ChatError> {
    let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let creator = match config.backend.creation {
        CreationMode::Event => ConversationCreator::Event,
        CreationMode::Rest => ConversationCreator::Rest(ChatApiClient::new(
            &config.backend.url,
            config.transport_options().connect_timeout,
        )?),
    };
    let connector = SocketIoConnector::new(config.transport_options());
    let controller = SessionController::new(
        config.session_settings(user_id),
        Box::new(connector),
        creator,
        inputs_tx.clone(),
        events_tx,
    );

    let task = tokio::spawn(run(controller, inputs_rx));
    Ok((
        SessionHandle {
            inputs: inputs_tx,
            task,
        },
        events_rx,
    ))
}

/// Drive `controller` until it shuts down.
pub async fn run(mut controller: SessionController, mut inputs: mpsc::UnboundedReceiver<Input>) {
    controller.start();
    loop {
        let deadline = controller.next_deadline();
        tokio::select! {
            input = inputs.recv() => {
                let Some(input) = input else { break };
                if controller.handle_input(input, Instant::now()).is_break() {
                    break;
                }
            }
            () = sleep_until(deadline) => controller.poll_timers(Instant::now()),
        }
    }
    debug!("session loop finished");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}
