use crate::{
    connection::{Connection, broker::ConnectionBroker},
    error::TransportError,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Write half of a client connection (eg/ a WebSocket sink).
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, payload: Arc<str>) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Drain `connection`'s outbound queue into `transport` until the queue closes or drains.
///
/// A transport failure force closes only this connection.
pub async fn run_sender<T>(broker: Arc<ConnectionBroker>, connection: Arc<Connection>, mut transport: T)
where
    T: Transport,
{
    let id = connection.id();

    while let Some(message) = connection.queue().recv().await {
        if let Err(error) = transport.send(message.payload).await {
            warn!(connection = %id, %error, "transport write failed");
            let _ = broker.force_disconnect(id, &error.to_string());
            return;
        }
        connection.record_sent();
    }

    if let Err(error) = broker.finish_drain(id) {
        warn!(connection = %id, %error, "failed to finish drain");
    }
    if let Err(error) = transport.close().await {
        debug!(connection = %id, %error, "transport close failed");
    }
    debug!(connection = %id, sent = connection.stats().messages_sent, "sender stopped");
}

/// Spawn [`run_sender`] onto the Tokio runtime.
pub fn spawn_sender<T>(
    broker: Arc<ConnectionBroker>,
    connection: Arc<Connection>,
    transport: T,
) -> JoinHandle<()>
where
    T: Transport + 'static,
{
    tokio::spawn(run_sender(broker, connection, transport))
}
