//! The per-connection websocket session.
//!
//! Every client connection runs in its own task. The session registers the client, keeps its
//! heartbeat timer alive, forwards the outbound queue of the client to the socket and turns
//! incoming frames into state machine requests. A slow or dead socket only ever stalls its own
//! session.

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt,
    StreamExt,
};
use thiserror::Error;
use tracing::{debug, error_span, info, warn};
use tracing_futures::Instrument;
use warp::ws::{Message, WebSocket};

use crate::{
    common::{ClientId, SessionId},
    connections::{DisconnectReason, Registration},
    services::messages::{ClientMessage, MessageHandler, ServerMessage, ServiceError},
    state_machine::requests::{DisconnectRequest, RegisterRequest, Registered, Response},
};

/// Errors which can occur while writing to the socket.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to serialize the message: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to write to the socket: {0}")]
    Transport(#[from] warp::Error),
}

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Serves a client until the client or the coordinator ends the connection.
pub async fn serve(socket: WebSocket, mut handler: MessageHandler) {
    let (mut sink, mut stream) = socket.split();

    let (client_id, registration) = match register(&mut sink, &mut stream, &mut handler).await {
        Some(registered) => registered,
        None => {
            debug!("connection closed before registration");
            return;
        }
    };

    let span = error_span!("session", client_id = %client_id, session = %registration.session);
    run(sink, stream, handler, client_id, registration)
        .instrument(span)
        .await
}

/// Waits for the registration of the client. Any other message is rejected.
async fn register(
    sink: &mut WsSink,
    stream: &mut WsStream,
    handler: &mut MessageHandler,
) -> Option<(ClientId, Registration)> {
    while let Some(frame) = next_frame(stream).await {
        let (client_id, capabilities) = match handler.parse(frame).await {
            Ok(ClientMessage::Register {
                client_id,
                capabilities,
            }) => (client_id, capabilities),
            Ok(ClientMessage::Disconnect) => return None,
            Ok(_) => {
                reply(sink, &ServerMessage::rejected(&ServiceError::NotRegistered)).await?;
                continue;
            }
            Err(err) => {
                reply(sink, &ServerMessage::rejected(&err)).await?;
                continue;
            }
        };

        let req = RegisterRequest {
            client_id: client_id.clone(),
            capabilities,
        };
        let Registered {
            config,
            registration,
        } = match handler.request(req.into()).await {
            Ok(Response::Registered(registered)) => *registered,
            Ok(resp) => {
                warn!("unexpected response to a registration: {:?}", resp);
                let err = ServiceError::InternalError("unexpected response".to_string());
                reply(sink, &ServerMessage::rejected(&err)).await?;
                continue;
            }
            Err(err) => {
                info!("registration of client {} refused: {}", client_id, err);
                reply(sink, &ServerMessage::rejected(&err)).await?;
                continue;
            }
        };

        let confirmation = ServerMessage::Registered {
            session: registration.session,
            config,
        };
        if reply(sink, &confirmation).await.is_none() {
            end_session(
                handler,
                client_id,
                registration.session,
                DisconnectReason::ChannelClosed,
            )
            .await;
            return None;
        }
        return Some((client_id, registration));
    }
    None
}

async fn run(
    mut sink: WsSink,
    mut stream: WsStream,
    mut handler: MessageHandler,
    client_id: ClientId,
    registration: Registration,
) {
    let Registration {
        session,
        mut outbound,
        heartbeat,
    } = registration;
    let heartbeat = tokio::spawn(heartbeat);
    info!("session started");

    // whether the coordinator still considers the client connected when the loop ends
    let mut connected = true;
    loop {
        tokio::select! {
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    if reply(&mut sink, &msg).await.is_none() {
                        break;
                    }
                }
                None => {
                    // the coordinator dropped the connection
                    connected = false;
                    break;
                }
            },
            frame = next_frame(&mut stream) => match frame {
                Some(frame) => {
                    let (response, closes) = handle_frame(&mut handler, &client_id, session, frame).await;
                    if let Some(response) = response {
                        if reply(&mut sink, &response).await.is_none() {
                            break;
                        }
                    }
                    if closes {
                        connected = false;
                        break;
                    }
                }
                None => break,
            },
        }
    }

    if connected {
        end_session(&mut handler, client_id, session, DisconnectReason::ChannelClosed).await;
    }
    heartbeat.abort();
    let _ = sink.close().await;
    info!("session ended");
}

/// Handles a frame of a registered client. Returns the reply, if any, and whether the client
/// asked to disconnect.
async fn handle_frame(
    handler: &mut MessageHandler,
    client_id: &ClientId,
    session: SessionId,
    frame: Vec<u8>,
) -> (Option<ServerMessage>, bool) {
    let message = match handler.parse(frame).await {
        Ok(message) => message,
        Err(err) => return (Some(ServerMessage::rejected(&err)), false),
    };
    debug!("received {:?}", message);
    let is_heartbeat = matches!(message, ClientMessage::Heartbeat);
    let closes = matches!(message, ClientMessage::Disconnect);

    let response = match handler.request(message.into_request(client_id, session)).await {
        Ok(Response::Admitted(admission)) => Some(ServerMessage::Admitted(admission)),
        Ok(Response::State(global_state)) => Some(ServerMessage::CurrentState { global_state }),
        // heartbeats are only answered when they fail
        Ok(Response::Ack) if is_heartbeat => None,
        Ok(_) => Some(ServerMessage::Ack),
        Err(err) => Some(ServerMessage::rejected(&err)),
    };
    (response, closes)
}

/// Tells the coordinator that the session is over. Has no effect if the client registered again
/// in the meantime.
async fn end_session(
    handler: &mut MessageHandler,
    client_id: ClientId,
    session: SessionId,
    reason: DisconnectReason,
) {
    let req = DisconnectRequest {
        client_id,
        session,
        reason,
    };
    if let Err(err) = handler.request(req.into()).await {
        debug!("failed to end session {}: {}", session, err);
    }
}

/// Waits for the next data frame. Returns `None` once the socket is closed or broken.
async fn next_frame(stream: &mut WsStream) -> Option<Vec<u8>> {
    while let Some(item) = stream.next().await {
        match item {
            Ok(msg) if msg.is_close() => return None,
            Ok(msg) if msg.is_text() || msg.is_binary() => return Some(msg.into_bytes()),
            Ok(_) => continue,
            Err(err) => {
                debug!("failed to read from the socket: {}", err);
                return None;
            }
        }
    }
    None
}

/// Writes a message to the socket. Returns `None` if the socket is gone.
async fn reply(sink: &mut WsSink, msg: &ServerMessage) -> Option<()> {
    match write(sink, msg).await {
        Ok(()) => Some(()),
        Err(err) => {
            debug!("{}", err);
            None
        }
    }
}

async fn write(sink: &mut WsSink, msg: &ServerMessage) -> Result<(), SessionError> {
    let text = serde_json::to_string(msg)?;
    sink.send(Message::text(text)).await?;
    Ok(())
}
