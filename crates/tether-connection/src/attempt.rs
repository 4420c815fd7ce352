//! Single transport attempt
//!
//! Opens one transport against one host and waits for the server's
//! `CONNECTED`. The attempt runs as its own task so the engine stays
//! responsive; aborting the task drops the future and closes any transport it
//! had opened.

use std::sync::Arc;
use std::time::Duration;
use tether_core::{Action, ErrorInfo, ProtocolMessage};
use tether_transport::{Transport, TransportConnection, TransportEvent, TransportFactory, TransportParams};
use tracing::{debug, trace};

/// Result of one attempt
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Server accepted the session on this transport
    Ready {
        /// Open transport with its remaining event stream
        connection: TransportConnection,
        /// The `CONNECTED` message
        connected: ProtocolMessage,
    },
    /// Attempt failed
    Failed(ErrorInfo),
}

impl AttemptOutcome {
    /// Error of a failed attempt
    pub fn error(&self) -> Option<&ErrorInfo> {
        match self {
            AttemptOutcome::Failed(error) => Some(error),
            AttemptOutcome::Ready { .. } => None,
        }
    }
}

/// Closes the wrapped transport unless disarmed
struct CloseOnDrop(Option<Arc<dyn Transport>>);

impl CloseOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if let Some(transport) = self.0.take() {
            transport.close();
        }
    }
}

/// Connect through `factory` and wait up to `timeout` for `CONNECTED`
pub async fn run_attempt(
    factory: Arc<dyn TransportFactory>,
    params: TransportParams,
    timeout: Duration,
) -> AttemptOutcome {
    let host = params.host.clone();
    let kind = factory.kind();
    debug!(kind = %kind, host = %host, mode = params.mode.as_str(), "transport attempt starting");

    match tokio::time::timeout(timeout, handshake(factory, params)).await {
        Ok(Ok((connection, connected))) => AttemptOutcome::Ready {
            connection,
            connected,
        },
        Ok(Err(error)) => {
            debug!(kind = %kind, host = %host, error = %error, "transport attempt failed");
            AttemptOutcome::Failed(error)
        }
        Err(_) => {
            debug!(kind = %kind, host = %host, timeout_ms = timeout.as_millis() as u64, "transport attempt timed out");
            AttemptOutcome::Failed(ErrorInfo::timeout(format!(
                "no response from {host} within {}ms",
                timeout.as_millis()
            )))
        }
    }
}

async fn handshake(
    factory: Arc<dyn TransportFactory>,
    params: TransportParams,
) -> Result<(TransportConnection, ProtocolMessage), ErrorInfo> {
    let TransportConnection {
        transport,
        mut events,
    } = factory
        .connect(params)
        .await
        .map_err(|err| err.to_error_info())?;
    let guard = CloseOnDrop(Some(Arc::clone(&transport)));

    loop {
        let event = events.recv().await;
        let message = match event {
            Some(TransportEvent::Message(message)) => message,
            Some(TransportEvent::Closed(reason)) => return Err(reason.to_error_info()),
            None => {
                return Err(ErrorInfo::disconnected(
                    "transport ended before the server accepted the connection",
                ))
            }
        };
        match message.action {
            Action::Connected => {
                guard.disarm();
                return Ok((TransportConnection { transport, events }, message));
            }
            Action::Error => {
                return Err(message
                    .error
                    .unwrap_or_else(|| ErrorInfo::protocol("ERROR without error details")))
            }
            Action::Disconnected | Action::Closed => {
                return Err(message
                    .error
                    .unwrap_or_else(|| ErrorInfo::disconnected("server refused the connection")))
            }
            action => trace!(%action, "ignoring message before CONNECTED"),
        }
    }
}
