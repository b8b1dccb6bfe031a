use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::{ClientMessage, ServerMessage};
use crate::client::{ClientError, ClientStateProxy, ClientStates};
use crate::service::{CallResponse, ServiceEvent};
use crate::sync::DescriptorTable;

/// Sends requests and matches responses to them by id.
#[derive(Clone)]
pub(crate) struct Requester {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<CallResponse>>>>,
    next_id: Arc<AtomicU64>,
}

impl Requester {
    pub(crate) fn new(outbound: mpsc::UnboundedSender<ClientMessage>) -> Self {
        Self {
            outbound,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub(crate) fn send(&self, message: ClientMessage) -> Result<(), ClientError> {
        self.outbound
            .send(message)
            .map_err(|_| ClientError::Disconnected)
    }

    pub(crate) async fn request(
        &self,
        build: impl FnOnce(u64) -> ClientMessage,
    ) -> Result<CallResponse, ClientError> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id, tx);
        if let Err(e) = self.send(build(request_id)) {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&request_id);
            return Err(e);
        }
        rx.await.map_err(|_| ClientError::Disconnected)
    }

    fn resolve(&self, request_id: u64, response: CallResponse) {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&request_id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(response);
            }
            None => log::debug!("[transport] Response to unknown request {}", request_id),
        }
    }

    fn fail_all(&self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Frontend end of a connection.
pub struct TransportClient {
    requester: Requester,
    states: ClientStates,
    events: broadcast::Sender<ServiceEvent>,
}

impl TransportClient {
    pub fn new(
        outbound: mpsc::UnboundedSender<ClientMessage>,
        mut inbound: mpsc::UnboundedReceiver<ServerMessage>,
        descriptors: DescriptorTable,
    ) -> Self {
        let requester = Requester::new(outbound);
        let states = ClientStates::new(descriptors, requester.clone());
        let (events, _) = broadcast::channel(256);

        let reader = (requester.clone(), states.clone(), events.clone());
        tokio::spawn(async move {
            let (requester, states, events) = reader;
            while let Some(message) = inbound.recv().await {
                match message {
                    ServerMessage::Response {
                        request_id,
                        result,
                        error,
                    } => requester.resolve(request_id, CallResponse { result, error }),
                    ServerMessage::Commit {
                        session_id,
                        seq,
                        mutation,
                    } => states.apply_push(&session_id, seq, &mutation),
                    ServerMessage::Event(event) => {
                        let _ = events.send(event);
                    }
                }
            }
            log::debug!("[transport] Backend closed the connection");
            requester.fail_all();
        });

        Self {
            requester,
            states,
            events,
        }
    }

    pub async fn call(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, ClientError> {
        let response = self
            .requester
            .request(|request_id| ClientMessage::Call {
                request_id,
                service_name: service.to_string(),
                method_name: method.to_string(),
                args,
            })
            .await?;
        Ok(response.into_result()?)
    }

    /// Calls a state-returning method and mirrors the result.
    pub async fn call_state(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<ClientStateProxy, ClientError> {
        let envelope = self.call(service, method, args).await?;
        self.states.receive(envelope)
    }

    pub fn states(&self) -> &ClientStates {
        &self.states
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }
}
