//! The boundary between the backend and its frontends.
//!
//! Frontends send [`ClientMessage`]s and receive [`ServerMessage`]s. The
//! messages travel either over an in-process tokio channel pair
//! ([`connect_in_process`]) or as JSON lines over any byte stream
//! ([`serve_lines`], [`connect_lines`]).

mod client;
mod lines;
mod server;

pub use client::TransportClient;
pub(crate) use client::Requester;
pub use lines::{connect_lines, serve_lines};
pub use server::serve_connection;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::SerializedError;
use crate::service::{CallResponse, ServiceDispatcher, ServiceEvent};
use crate::sync::{DescriptorTable, MutationRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Call {
        request_id: u64,
        service_name: String,
        method_name: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    #[serde(rename_all = "camelCase")]
    Sync { request_id: u64, session_id: String },
    #[serde(rename_all = "camelCase")]
    Activate { session_id: String },
    #[serde(rename_all = "camelCase")]
    Commit {
        session_id: String,
        mutation: MutationRecord,
    },
    #[serde(rename_all = "camelCase")]
    Dispose { session_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Response {
        request_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<SerializedError>,
    },
    #[serde(rename_all = "camelCase")]
    Commit {
        session_id: String,
        seq: u64,
        mutation: MutationRecord,
    },
    Event(ServiceEvent),
}

impl ServerMessage {
    pub fn response(request_id: u64, response: CallResponse) -> Self {
        ServerMessage::Response {
            request_id,
            result: response.result,
            error: response.error,
        }
    }
}

/// Connects a frontend living in the same process.
pub fn connect_in_process(
    dispatcher: Arc<ServiceDispatcher>,
    descriptors: DescriptorTable,
) -> TransportClient {
    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let (server_tx, server_rx) = mpsc::unbounded_channel();
    tokio::spawn(serve_connection(dispatcher, client_rx, server_tx));
    TransportClient::new(client_tx, server_rx, descriptors)
}
