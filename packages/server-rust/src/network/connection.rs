//! Per-socket request/response loop.
//!
//! One task per connection: read a frame, dispatch it, write the response,
//! and only then read again — the flushed send is the barrier that gives
//! strict request/response ordering per connection. Framing or CRC
//! failures get a best-effort error frame and close the socket; command
//! errors are answered in-band and the connection survives. Panics from
//! handlers are caught here and reported as `INTERNAL_ERROR`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{FutureExt, SinkExt, StreamExt};
use nosq_core::wire::{Frame, MessageType};
use nosq_core::{
    now_millis, AuthRequest, DbError, HandshakeData, HandshakeRequest, ResponseBody,
};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use super::codec::FrameCodec;
use super::registry::ConnectionHandle;
use super::server::ServerState;
use super::shutdown::ShutdownController;

fn json_frame(message_type: MessageType, body: &ResponseBody) -> Frame {
    let payload = serde_json::to_vec(body).unwrap_or_default();
    Frame::new(message_type, Bytes::from(payload))
}

/// An `Error` frame carrying the `{code, message}` envelope.
pub fn error_frame(err: &DbError) -> Frame {
    json_frame(MessageType::Error, &ResponseBody::error(err))
}

fn response_frame(body: &ResponseBody) -> Frame {
    json_frame(MessageType::Response, body)
}

/// Applies the documented socket tuning; failures are logged, not fatal.
pub fn tune_socket(stream: &TcpStream, state: &ServerState) {
    if let Err(err) = stream.set_nodelay(true) {
        tracing::debug!(%err, "set_nodelay failed");
    }
    let sock = socket2::SockRef::from(stream);
    let keepalive =
        socket2::TcpKeepalive::new().with_time(state.config.keep_alive_interval());
    if let Err(err) = sock.set_tcp_keepalive(&keepalive) {
        tracing::debug!(%err, "keepalive setup failed");
    }
    if let Err(err) = sock.set_recv_buffer_size(state.config.effective_receive_buffer()) {
        tracing::debug!(%err, "receive buffer setup failed");
    }
    if let Err(err) = sock.set_send_buffer_size(state.config.effective_send_buffer()) {
        tracing::debug!(%err, "send buffer setup failed");
    }
}

/// Drives one connection until EOF, error, idle timeout, or shutdown.
pub async fn serve(
    state: Arc<ServerState>,
    stream: TcpStream,
    handle: Arc<ConnectionHandle>,
    controller: Arc<ShutdownController>,
) {
    tune_socket(&stream, &state);
    let deadline = state.config.connection_timeout();
    let mut framed = Framed::new(stream, FrameCodec);
    let mut shutdown = controller.subscribe();
    let mut authenticated = !state.config.require_authentication;

    tracing::debug!(conn_id = %handle.id, peer = %handle.peer_addr, "connection opened");

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => {
                tracing::debug!(conn_id = %handle.id, "closing connection for shutdown");
                break;
            }
            read = tokio::time::timeout(deadline, framed.next()) => match read {
                Err(_) => {
                    tracing::debug!(conn_id = %handle.id, "idle deadline reached");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(err))) => {
                    // Framing/CRC failure: best-effort error frame, then close.
                    tracing::debug!(conn_id = %handle.id, %err, "protocol error");
                    let _ = tokio::time::timeout(
                        deadline,
                        framed.send(error_frame(&err)),
                    )
                    .await;
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            },
        };

        handle.record_request();
        let _guard = controller.guard();
        let response = dispatch(&state, &mut authenticated, &frame).await;

        // The flushed send is the per-connection ordering barrier.
        match tokio::time::timeout(deadline, framed.send(response)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::debug!(conn_id = %handle.id, %err, "write failed");
                break;
            }
            Err(_) => {
                tracing::debug!(conn_id = %handle.id, "write deadline reached");
                break;
            }
        }
    }

    tracing::debug!(conn_id = %handle.id, "connection closed");
}

async fn dispatch(
    state: &Arc<ServerState>,
    authenticated: &mut bool,
    frame: &Frame,
) -> Frame {
    match frame.message_type {
        MessageType::Handshake => handshake(frame),
        MessageType::Ping => Frame::new(MessageType::Pong, Bytes::new()),
        MessageType::Authentication => authenticate(state, authenticated, frame).await,
        MessageType::Command => {
            if !*authenticated {
                return error_frame(&DbError::AuthFailed);
            }
            guarded(super::handlers::handle_command(state, &frame.payload)).await
        }
        MessageType::BulkOperation => {
            if !*authenticated {
                return error_frame(&DbError::AuthFailed);
            }
            guarded(super::handlers::handle_bulk(state, &frame.payload)).await
        }
        other => error_frame(&DbError::UnsupportedMessage(other.as_u8())),
    }
}

fn handshake(frame: &Frame) -> Frame {
    let request: HandshakeRequest =
        serde_json::from_slice(&frame.payload).unwrap_or_default();
    let data = HandshakeData {
        server_version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: nosq_core::PROTOCOL_VERSION,
        timestamp: now_millis(),
        client_version: request.version,
    };
    let body = match serde_json::to_value(&data) {
        Ok(value) => ResponseBody::ok(value),
        Err(err) => ResponseBody::error(&DbError::Internal(err.to_string())),
    };
    response_frame(&body)
}

async fn authenticate(
    state: &Arc<ServerState>,
    authenticated: &mut bool,
    frame: &Frame,
) -> Frame {
    let request: AuthRequest = match serde_json::from_slice(&frame.payload) {
        Ok(request) => request,
        Err(_) => return error_frame(&DbError::AuthFailed),
    };
    match state.auth.authenticate(&request).await {
        Ok(data) => {
            *authenticated = true;
            match serde_json::to_value(&data) {
                Ok(value) => response_frame(&ResponseBody::ok(value)),
                Err(err) => error_frame(&DbError::Internal(err.to_string())),
            }
        }
        Err(err) => error_frame(&err),
    }
}

/// Runs a handler under the panic boundary: a panicking handler is
/// reported as `INTERNAL_ERROR` and the server keeps running.
async fn guarded(fut: impl std::future::Future<Output = ResponseBody>) -> Frame {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(body) => response_frame(&body),
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(panic = %detail, "handler panicked");
            response_frame(&ResponseBody::error(&DbError::Internal(detail)))
        }
    }
}
