use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Args, CallOutcome, EventHub, ServiceRegistry};
use crate::error::{DispatchError, SerializedError, ServiceError};
use crate::sync::{CommitSink, MutationRecord, StateRegistry};

/// Answer to a `call` or `sync` request. Exactly one field is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedError>,
}

impl CallResponse {
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn err(error: SerializedError) -> Self {
        Self {
            result: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<Value, SerializedError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Routes frontend requests to services and state sessions.
///
/// No error or panic raised by a service escapes: every failure becomes a
/// [`SerializedError`] in the response.
pub struct ServiceDispatcher {
    services: ServiceRegistry,
    states: StateRegistry,
    events: EventHub,
}

impl ServiceDispatcher {
    pub fn new(services: ServiceRegistry, states: StateRegistry, events: EventHub) -> Self {
        Self {
            services,
            states,
            events,
        }
    }

    pub fn states(&self) -> &StateRegistry {
        &self.states
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub async fn call(
        &self,
        client: &str,
        sink: Arc<dyn CommitSink>,
        service_name: &str,
        method_name: &str,
        args: Vec<Value>,
    ) -> CallResponse {
        log::debug!("[dispatch] {}.{} from {}", service_name, method_name, client);
        match self
            .try_call(client, sink, service_name, method_name, args)
            .await
        {
            Ok(result) => CallResponse::ok(result),
            Err(e) => {
                log::warn!(
                    "[dispatch] Error during service call {}.{}:",
                    service_name,
                    method_name
                );
                log::warn!("[dispatch] {:?}", e);
                CallResponse::err(e.serialize().with_context(service_name, method_name))
            }
        }
    }

    async fn try_call(
        &self,
        client: &str,
        sink: Arc<dyn CommitSink>,
        service_name: &str,
        method_name: &str,
        args: Vec<Value>,
    ) -> Result<Value, ServiceError> {
        let service = self.services.resolve(service_name).await?;
        if !service.methods().contains(&method_name) {
            return Err(DispatchError::ServiceMethodNotFound {
                service: service_name.to_string(),
                method: method_name.to_string(),
            }
            .into());
        }

        let outcome = AssertUnwindSafe(service.call(method_name, Args::new(method_name, args)))
            .catch_unwind()
            .await
            .map_err(|panic| DispatchError::ServicePanicked {
                message: panic_message(panic.as_ref()),
            })??;

        match outcome {
            CallOutcome::Value(value) => Ok(value),
            CallOutcome::State(container) => Ok(self.states.track(client, container, sink)?.envelope()),
        }
    }

    /// Current `{state, length}` of a session.
    pub fn sync(&self, session_id: &str) -> CallResponse {
        let snapshot = self
            .states
            .sync(session_id)
            .map_err(ServiceError::from)
            .and_then(|snapshot| Ok(serde_json::to_value(snapshot)?));
        match snapshot {
            Ok(value) => CallResponse::ok(value),
            Err(e) => {
                log::warn!("[dispatch] Cannot sync session {}: {}", session_id, e);
                CallResponse::err(e.serialize())
            }
        }
    }

    pub fn activate(&self, session_id: &str) {
        if let Err(e) = self.states.activate(session_id) {
            log::warn!("[dispatch] Cannot activate: {}", e);
        }
    }

    /// Applies a mutation forwarded from a frontend mirror.
    pub fn commit(&self, session_id: &str, mutation: &MutationRecord) {
        if let Err(e) = self.states.commit(session_id, mutation) {
            log::warn!("[dispatch] Commit {} on {} failed: {}", mutation.kind, session_id, e);
        }
    }

    pub fn dispose(&self, session_id: &str) {
        if !self.states.release(session_id) {
            log::debug!("[dispatch] Session {} was already released", session_id);
        }
    }

    /// Forgets everything a frontend held.
    pub fn disconnect(&self, client: &str) {
        let released = self.states.release_client(client);
        self.events.detach(client);
        log::info!("[dispatch] Client {} disconnected, released {} sessions", client, released);
    }

    pub async fn shutdown(&self) {
        self.services.dispose_all().await;
        self.states.dispose_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{Service, ServiceKey};
    use crate::states::{SettingMutation, SettingState};
    use crate::sync::{Commit, MutableState};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Inbox {
        commits: Mutex<Vec<(String, Commit)>>,
    }

    impl CommitSink for Inbox {
        fn push(&self, session_id: &str, commit: &Commit) -> bool {
            self.commits
                .lock()
                .unwrap()
                .push((session_id.to_string(), commit.clone()));
            true
        }
    }

    struct Echo {
        settings: MutableState<SettingState>,
    }

    #[async_trait]
    impl Service for Echo {
        fn key(&self) -> ServiceKey {
            "EchoService"
        }

        fn methods(&self) -> &'static [&'static str] {
            &["settings", "echo", "explode", "fail"]
        }

        async fn call(&self, method: &str, args: Args) -> Result<CallOutcome, ServiceError> {
            match method {
                "settings" => Ok(CallOutcome::state(&self.settings)),
                "echo" => CallOutcome::value(args.get::<Value>(0)?),
                "explode" => panic!("handler exploded"),
                _ => Err(anyhow::anyhow!("deliberate failure").into()),
            }
        }
    }

    fn dispatcher() -> (ServiceDispatcher, MutableState<SettingState>) {
        let states = StateRegistry::default();
        let settings = states.register("settings", SettingState::default()).unwrap();
        let mut services = ServiceRegistry::new();
        services.register(Arc::new(Echo {
            settings: settings.clone(),
        }));
        (
            ServiceDispatcher::new(services, states, EventHub::default()),
            settings,
        )
    }

    #[tokio::test]
    async fn unknown_service_is_a_structured_error() {
        let (dispatcher, _) = dispatcher();
        let response = dispatcher
            .call("c", Arc::new(Inbox::default()), "NoSuchService", "x", vec![])
            .await;
        let error = response.into_result().unwrap_err();
        assert_eq!(error.kind, "ServiceNotFound");
        assert_eq!(error.service_name.as_deref(), Some("NoSuchService"));
        assert_eq!(error.service_method.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn undeclared_method_is_rejected() {
        let (dispatcher, _) = dispatcher();
        let response = dispatcher
            .call("c", Arc::new(Inbox::default()), "EchoService", "secret", vec![])
            .await;
        assert_eq!(response.into_result().unwrap_err().kind, "ServiceMethodNotFound");
    }

    #[tokio::test]
    async fn values_pass_through_and_failures_are_serialized() {
        let (dispatcher, _) = dispatcher();
        let sink: Arc<dyn CommitSink> = Arc::new(Inbox::default());

        let echoed = dispatcher
            .call("c", sink.clone(), "EchoService", "echo", vec![json!({ "a": 1 })])
            .await;
        assert_eq!(echoed.into_result().unwrap(), json!({ "a": 1 }));

        let failed = dispatcher.call("c", sink.clone(), "EchoService", "fail", vec![]).await;
        assert_eq!(failed.into_result().unwrap_err().message, "deliberate failure");

        let exploded = dispatcher.call("c", sink, "EchoService", "explode", vec![]).await;
        let error = exploded.into_result().unwrap_err();
        assert_eq!(error.kind, "ServicePanicked");
        assert!(error.message.contains("handler exploded"));
    }

    #[tokio::test]
    async fn state_results_are_tracked_and_pushed_after_activation() {
        let (dispatcher, settings) = dispatcher();
        let inbox = Arc::new(Inbox::default());

        let envelope = dispatcher
            .call("c", inbox.clone(), "EchoService", "settings", vec![])
            .await
            .into_result()
            .unwrap();
        assert_eq!(envelope["__state__"], "SettingState");
        assert_eq!(envelope["length"], 0);
        let session = envelope["id"].as_str().unwrap().to_string();

        settings.mutate(SettingMutation::LocaleSet("de".into())).unwrap();
        assert!(inbox.commits.lock().unwrap().is_empty());

        dispatcher.activate(&session);
        dispatcher.commit(&session, &MutationRecord::new("maxSocketsSet", json!(4)));
        let commits = inbox.commits.lock().unwrap().clone();
        assert_eq!(commits.len(), 2);
        assert!(commits.iter().all(|(s, _)| s == &session));
        assert_eq!(commits[1].1.mutation.kind, "maxSocketsSet");

        let synced = dispatcher.sync(&session).into_result().unwrap();
        assert_eq!(synced["length"], 2);
        assert_eq!(synced["state"]["maxSockets"], 4);

        dispatcher.dispose(&session);
        assert_eq!(dispatcher.sync(&session).into_result().unwrap_err().kind, "SessionNotFound");
    }
}
