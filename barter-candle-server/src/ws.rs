use async_trait::async_trait;
use barter_candle::{
    connection::sender::Transport, engine::CandleEngine, error::TransportError,
    message::ServerMessage,
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    WebSocketStream, accept_async,
    tungstenite::{self, Message},
};
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// [`Transport`] writing text frames to the write half of a WebSocket.
pub struct WsTransport {
    sink: WsSink,
}

impl WsTransport {
    pub fn new(sink: WsSink) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, payload: Arc<str>) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(payload.as_ref().into()))
            .await
            .map_err(transport_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink.close().await.map_err(transport_error)
    }
}

fn transport_error(error: tungstenite::Error) -> TransportError {
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Closed
        }
        other => TransportError::Write(other.to_string()),
    }
}

/// Accept WebSocket clients on `addr` until the listener fails.
pub async fn serve(addr: SocketAddr, engine: CandleEngine) -> std::io::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "WebSocket server listening");

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        debug!(%peer_addr, "new TCP connection");
        tokio::spawn(handle_client(stream, peer_addr, engine.clone()));
    }
}

/// Map one WebSocket to one engine connection for its whole lifetime.
async fn handle_client(stream: TcpStream, peer_addr: SocketAddr, engine: CandleEngine) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(error) => {
            error!(%peer_addr, %error, "WebSocket handshake failed");
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let connection = match engine.connect() {
        Ok(connection) => connection,
        Err(error) => {
            warn!(%peer_addr, %error, "rejecting WebSocket client");
            let payload = ServerMessage::from(&error).to_payload();
            let _ = ws_sender.send(Message::Text(payload.as_ref().into())).await;
            let _ = ws_sender.close().await;
            return;
        }
    };

    let id = connection.id();
    info!(%peer_addr, connection = %id, "WebSocket client connected");

    let mut send_task = engine.spawn_sender(&connection, WsTransport::new(ws_sender));

    let mut recv_task = tokio::spawn({
        let engine = engine.clone();
        async move {
            while let Some(message) = ws_receiver.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        // Errors are reported back to the client by the engine
                        let _ = engine.handle_client_message(id, text.as_str());
                    }
                    Ok(Message::Pong(_)) => {
                        let _ = engine.acknowledge_heartbeat(id);
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        warn!(connection = %id, %error, "WebSocket read failed");
                        break;
                    }
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            debug!(connection = %id, "send task completed");
            recv_task.abort();
        }
        _ = &mut recv_task => {
            debug!(connection = %id, "receive task completed");
            if let Err(error) = engine.disconnect(id) {
                debug!(connection = %id, %error, "connection already closed");
            }
            let drain_deadline = engine.config().heartbeat_timeout;
            if tokio::time::timeout(drain_deadline, &mut send_task).await.is_err() {
                send_task.abort();
                // Usually already closed by the heartbeat sweep
                let _ = engine.broker().force_disconnect(id, "drain timed out");
            }
        }
    }

    info!(%peer_addr, connection = %id, "WebSocket client disconnected");
}
