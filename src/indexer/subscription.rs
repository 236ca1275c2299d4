//!
//! WebSocket push subscription to the Chronik indexer.
//!
//! Uses the `graphql-transport-ws` protocol. Every wallet script hash gets its own
//! subscription whose operation id is the script hash itself, so unsubscribing is a
//! `complete` message for that id.

use super::service::{PushSubscription, SubscriptionConnector};
use super::types::*;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::BTreeSet;
use tokio::net::TcpStream;
use tokio_tungstenite::{
	MaybeTlsStream, WebSocketStream, connect_async,
	tungstenite::{Message, client::IntoClientRequest},
};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens `ChronikWsSubscription`s against one WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct ChronikWsConnector {
	ws_url: String,
}

impl ChronikWsConnector {
	pub fn new(ws_url: String) -> Self {
		Self { ws_url }
	}
}

#[async_trait::async_trait]
impl SubscriptionConnector for ChronikWsConnector {
	async fn connect(&self) -> Result<Box<dyn PushSubscription>, IndexerError> {
		let subscription = ChronikWsSubscription::connect(&self.ws_url).await?;
		Ok(Box::new(subscription))
	}
}

/// A connected push subscription.
pub struct ChronikWsSubscription {
	ws_sender: SplitSink<WsStream, Message>,
	ws_receiver: SplitStream<WsStream>,
	/// Script hashes subscribed on this connection.
	active: BTreeSet<String>,
}

impl ChronikWsSubscription {
	/// Connect and complete the `connection_init` / `connection_ack` handshake.
	pub async fn connect(ws_url: &str) -> Result<Self, IndexerError> {
		debug!("Attempting WebSocket connection to: {}", ws_url);

		// Create WebSocket request with required subprotocol
		let mut request = ws_url.into_client_request()?;
		request.headers_mut().insert(
			"Sec-WebSocket-Protocol",
			"graphql-transport-ws".parse().map_err(|_| {
				IndexerError::GraphQLError("Invalid WebSocket subprotocol header value".to_string())
			})?,
		);

		let (ws_stream, response) = connect_async(request).await?;
		debug!(
			"WebSocket connection established, response status: {}",
			response.status()
		);
		let (mut ws_sender, mut ws_receiver) = ws_stream.split();

		let init_message = json!({
			"type": "connection_init"
		});
		ws_sender
			.send(Message::Text(init_message.to_string()))
			.await?;

		match ws_receiver.next().await {
			Some(msg) => match msg? {
				Message::Text(text) => {
					let parsed: serde_json::Value = serde_json::from_str(&text)?;
					if parsed.get("type").and_then(|t| t.as_str()) != Some("connection_ack") {
						return Err(IndexerError::SessionError(
							"Connection not acknowledged".to_string(),
						));
					}
				}
				_ => {
					return Err(IndexerError::SessionError(
						"Unexpected message type during handshake".to_string(),
					));
				}
			},
			None => {
				return Err(IndexerError::SessionError(
					"Connection closed during handshake".to_string(),
				));
			}
		}

		info!("Push subscription connected to {}", ws_url);
		Ok(Self {
			ws_sender,
			ws_receiver,
			active: BTreeSet::new(),
		})
	}
}

/// A decoded `graphql-transport-ws` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Frame {
	Next(PushEvent),
	/// The server ended operation `id` with an error.
	Error { id: Option<String>, message: String },
	/// The server ended operation `id`.
	Complete(Option<String>),
	Other(String),
}

fn parse_frame(text: &str) -> Result<Frame, IndexerError> {
	let parsed: serde_json::Value = serde_json::from_str(text)?;
	let Some(msg_type) = parsed.get("type").and_then(|t| t.as_str()) else {
		return Err(IndexerError::GraphQLError(
			"Message missing type field".to_string(),
		));
	};
	let id = parsed
		.get("id")
		.and_then(|id| id.as_str())
		.map(str::to_string);

	match msg_type {
		"next" => {
			let event = parsed
				.get("payload")
				.and_then(|p| p.get("data"))
				.and_then(|d| d.get("scriptEvents"))
				.cloned()
				.ok_or(IndexerError::NoData)?;
			Ok(Frame::Next(serde_json::from_value(event)?))
		}
		"error" => {
			let message = parsed
				.get("payload")
				.and_then(|p| p.as_array())
				.and_then(|errors| errors.first())
				.and_then(|e| e.get("message"))
				.and_then(|m| m.as_str())
				.unwrap_or("Unknown subscription error")
				.to_string();
			Ok(Frame::Error { id, message })
		}
		"complete" => Ok(Frame::Complete(id)),
		other => Ok(Frame::Other(other.to_string())),
	}
}

/// Update the set of live operations for `frame` and extract its event.
///
/// `error` and `complete` both end the operation on the server, so its id leaves `active`.
/// Ending an operation that is still wanted is reported as an error.
/// Our own `unsubscribe` removes the id first, so its `complete` echo is silent.
fn apply_frame(
	active: &mut BTreeSet<String>,
	frame: Frame,
) -> Result<Option<PushEvent>, IndexerError> {
	match frame {
		Frame::Next(event) => Ok(Some(event)),
		Frame::Error { id, message } => {
			if let Some(id) = id {
				warn!("Server ended subscription {} with an error", id);
				active.remove(&id);
			}
			Err(IndexerError::GraphQLError(message))
		}
		Frame::Complete(Some(id)) => {
			if !active.remove(&id) {
				return Ok(None);
			}
			warn!("Server completed subscription {}", id);
			Err(IndexerError::GraphQLError(format!(
				"Server completed subscription {}",
				id
			)))
		}
		Frame::Complete(None) => Ok(None),
		Frame::Other(msg_type) => {
			debug!("Ignoring message type: {}", msg_type);
			Ok(None)
		}
	}
}

/// `subscribe` message for the events of one script. The operation id is the script hash.
fn subscribe_message(script_hash: &str) -> serde_json::Value {
	let subscription_query = format!(
		r#"
            subscription ScriptEvents {{
                scriptEvents(scriptType: "p2pkh", payload: "{}") {{
                    type
                    txid
                }}
            }}
            "#,
		script_hash
	);

	json!({
		"id": script_hash,
		"type": "subscribe",
		"payload": {
			"query": subscription_query
		}
	})
}

fn complete_message(script_hash: &str) -> serde_json::Value {
	json!({
		"id": script_hash,
		"type": "complete"
	})
}

#[async_trait::async_trait]
impl PushSubscription for ChronikWsSubscription {
	async fn subscribe(&mut self, script_hash: &str) -> Result<(), IndexerError> {
		self.ws_sender
			.send(Message::Text(subscribe_message(script_hash).to_string()))
			.await?;
		self.active.insert(script_hash.to_string());
		debug!("Subscribed to script {}", script_hash);
		Ok(())
	}

	async fn unsubscribe(&mut self, script_hash: &str) -> Result<(), IndexerError> {
		self.ws_sender
			.send(Message::Text(complete_message(script_hash).to_string()))
			.await?;
		self.active.remove(script_hash);
		debug!("Unsubscribed from script {}", script_hash);
		Ok(())
	}

	fn list_active_subscriptions(&self) -> Vec<String> {
		self.active.iter().cloned().collect()
	}

	async fn next_event(&mut self) -> Option<Result<PushEvent, IndexerError>> {
		loop {
			let msg = match self.ws_receiver.next().await? {
				Ok(msg) => msg,
				Err(e) => return Some(Err(IndexerError::WebSocketError(e))),
			};

			match msg {
				Message::Text(text) => match parse_frame(&text)
					.and_then(|frame| apply_frame(&mut self.active, frame))
				{
					Ok(Some(event)) => return Some(Ok(event)),
					Ok(None) => continue,
					Err(e) => return Some(Err(e)),
				},
				Message::Ping(payload) => {
					if let Err(e) = self.ws_sender.send(Message::Pong(payload)).await {
						warn!("Failed to answer ping: {}", e);
					}
				}
				Message::Close(frame) => {
					info!("Push subscription closed by server: {:?}", frame);
					return None;
				}
				_ => debug!("Ignoring non-text WebSocket frame"),
			}
		}
	}
}
