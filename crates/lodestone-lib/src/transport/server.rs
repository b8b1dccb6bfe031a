use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use super::{ClientMessage, ServerMessage};
use crate::service::{EventSink, ServiceDispatcher, ServiceEvent};
use crate::sync::{Commit, CommitSink};

/// Outbound half of one connection, shared by every session it holds.
struct Outbound(mpsc::UnboundedSender<ServerMessage>);

impl CommitSink for Outbound {
    fn push(&self, session_id: &str, commit: &Commit) -> bool {
        self.0
            .send(ServerMessage::Commit {
                session_id: session_id.to_string(),
                seq: commit.seq,
                mutation: commit.mutation.clone(),
            })
            .is_ok()
    }
}

impl EventSink for Outbound {
    fn send_event(&self, event: &ServiceEvent) -> bool {
        self.0.send(ServerMessage::Event(event.clone())).is_ok()
    }
}

/// Serves one frontend until its inbound channel closes.
///
/// Calls run concurrently; session messages are handled in arrival order.
pub async fn serve_connection(
    dispatcher: Arc<ServiceDispatcher>,
    mut inbound: mpsc::UnboundedReceiver<ClientMessage>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
) {
    let client_id = Uuid::new_v4().to_string();
    let sink = Arc::new(Outbound(outbound.clone()));
    dispatcher.events().attach(&client_id, sink.clone());
    log::info!("[transport] Client {} connected", client_id);

    while let Some(message) = inbound.recv().await {
        match message {
            ClientMessage::Call {
                request_id,
                service_name,
                method_name,
                args,
            } => {
                let dispatcher = dispatcher.clone();
                let client = client_id.clone();
                let sink = sink.clone();
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    let response = dispatcher
                        .call(&client, sink, &service_name, &method_name, args)
                        .await;
                    if outbound
                        .send(ServerMessage::response(request_id, response))
                        .is_err()
                    {
                        // The frontend left while the call ran; drop what it just received.
                        dispatcher.states().release_client(&client);
                    }
                });
            }
            ClientMessage::Sync {
                request_id,
                session_id,
            } => {
                let response = dispatcher.sync(&session_id);
                let _ = outbound.send(ServerMessage::response(request_id, response));
            }
            ClientMessage::Activate { session_id } => dispatcher.activate(&session_id),
            ClientMessage::Commit {
                session_id,
                mutation,
            } => dispatcher.commit(&session_id, &mutation),
            ClientMessage::Dispose { session_id } => dispatcher.dispose(&session_id),
        }
    }

    dispatcher.disconnect(&client_id);
}
