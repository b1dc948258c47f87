use rust_rabbit_rpc::rabbitmq::{MemorySink, MemoryTransport, MessagingClient};
use std::sync::Arc;
use std::time::Duration;

pub struct Harness {
    pub client: Arc<MessagingClient>,
    pub transport: MemoryTransport,
    pub sink: Arc<MemorySink>,
}

pub fn memory_client() -> Harness {
    let transport = MemoryTransport::new();
    let sink = Arc::new(MemorySink::new());
    let client = Arc::new(MessagingClient::new(Arc::new(transport.clone()), sink.clone()));
    Harness {
        client,
        transport,
        sink,
    }
}

/// Polls `condition` for up to a second.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
