use std::fs;
use std::path::Path;

use rust_rabbit_rpc::rabbitmq::{ErrorHandling, MessagingClient, PublishOptions, QueueOptions};
use rust_rabbit_rpc::RustRabbitConfig;
use serde_json::{json, Value};

fn load_test_config() -> RustRabbitConfig {
    let config_path = Path::new("tests/fixtures/rabbitmq/configs/test_config.json");
    let config_str = fs::read_to_string(config_path).expect("Failed to read test config file");
    serde_json::from_str(&config_str).expect("Failed to parse test config JSON")
}

#[test]
fn test_fixture_config_is_valid() {
    let config = load_test_config();
    config.broker.validate().unwrap();
    assert_eq!(config.broker.opts.max_reconnect_attempts, 3);
    assert_eq!(config.rpc.request_timeout(), Some(std::time::Duration::from_secs(5)));
}

#[tokio::test]
#[ignore] // Ignore by default as it requires a running RabbitMQ instance
async fn test_round_trip_against_broker() {
    let config = load_test_config();
    let client = MessagingClient::connect(&config.broker);

    let queue = "rust-rabbit-rpc.connection-test";
    client
        .create_queue(
            queue,
            QueueOptions {
                durable: false,
                auto_delete: false,
            },
        )
        .await
        .unwrap();

    client
        .send(queue, &json!({ "ping": true }), PublishOptions::default(), ErrorHandling::Propagate)
        .await
        .unwrap();

    let message = client.get_message::<Value>(queue).await.unwrap();
    assert_eq!(message.content.decoded(), Some(&json!({ "ping": true })));

    client.close().await.unwrap();
}
