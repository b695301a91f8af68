//! WebSocket transport: the upgrade handler and the adapter that turns an
//! axum [`WebSocket`] into a [`Connection`].

use std::{borrow::Cow, future};

use axum::{
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tracing::warn;

use crate::{
    client::serve_connection,
    connection::{Connection, Frame},
    server::AppState,
};

/// `GET /ws`: upgrades the request and hands the socket to the hub.
pub async fn ws_handler(
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<AppState>,
) -> Response {
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            warn!(error = %rejection, "websocket upgrade rejected");
            return rejection.into_response();
        }
    };

    let AppState { hub, config } = state;
    upgrade
        .max_message_size(config.max_message_size)
        .on_failed_upgrade(|error: axum::Error| warn!(%error, "websocket upgrade failed"))
        .on_upgrade(move |socket| async move {
            if let Err(error) = serve_connection(&hub, into_connection(socket), config) {
                warn!(%error, "dropping connection");
            }
        })
}

/// Splits the socket and maps axum messages to [`Frame`]s in both directions.
pub fn into_connection(
    socket: WebSocket,
) -> Connection<
    impl Stream<Item = Result<Frame, axum::Error>> + Unpin + Send + 'static,
    impl Sink<Frame, Error = axum::Error> + Unpin + Send + 'static,
> {
    let (sink, stream) = socket.split();
    let stream = stream.map(|message| message.map(frame_from_message));
    let sink = sink.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(message_from_frame(frame))));
    Connection::new(stream, sink)
}

fn frame_from_message(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Message(Bytes::from(text)),
        Message::Binary(data) => Frame::Message(Bytes::from(data)),
        Message::Ping(data) => Frame::Ping(Bytes::from(data)),
        Message::Pong(data) => Frame::Pong(Bytes::from(data)),
        Message::Close(frame) => Frame::Close(frame.map(|frame| frame.code)),
    }
}

fn message_from_frame(frame: Frame) -> Message {
    match frame {
        // Text frames for anything that is valid UTF-8, which is every payload
        // a browser can send us.
        Frame::Message(payload) => match String::from_utf8(payload.to_vec()) {
            Ok(text) => Message::Text(text),
            Err(err) => Message::Binary(err.into_bytes()),
        },
        Frame::Ping(data) => Message::Ping(data.to_vec()),
        Frame::Pong(data) => Message::Pong(data.to_vec()),
        Frame::Close(code) => Message::Close(code.map(|code| CloseFrame {
            code,
            reason: Cow::Borrowed(""),
        })),
    }
}
