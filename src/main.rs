use anyhow::{anyhow, Context, Result};
use rust_rabbit_rpc::config::{create_default_config_file, load_config};
use rust_rabbit_rpc::rabbitmq::{MemoryTransport, MessagingClient, RpcEngine, RpcServer, TracingSink};
use rust_rabbit_rpc::RpcConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct InventoryRequest {
    product_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct InventoryResponse {
    product_id: String,
    quantity: i32,
    available: bool,
}

const USAGE: &str = "usage: RustRabbitRPC [demo | server | client <product-id>... | init-config [path]]";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str).unwrap_or("demo") {
        "demo" => run_demo().await,
        "server" => run_server().await,
        "client" => run_client(&args[1..]).await,
        "init-config" => {
            let path = args.get(1).map(String::as_str).unwrap_or("RustRabbitRPC.json");
            create_default_config_file(Path::new(path))
        }
        other => Err(anyhow!("unknown command '{}'\n{}", other, USAGE)),
    }
}

fn inventory() -> Arc<HashMap<String, i32>> {
    Arc::new(HashMap::from([
        ("product-1".to_string(), 10),
        ("product-2".to_string(), 5),
        ("product-3".to_string(), 0),
    ]))
}

async fn start_server(client: Arc<MessagingClient>, rpc: &RpcConfig) -> Result<String> {
    let stock = inventory();
    let server = RpcServer::new(client, &rpc.request_queue);
    let tag = server
        .serve(move |request: InventoryRequest| {
            let stock = stock.clone();
            async move {
                // Simulate processing delay
                tokio::time::sleep(Duration::from_millis(100)).await;

                let quantity = stock.get(&request.product_id).copied().unwrap_or(0);
                Ok::<_, anyhow::Error>(InventoryResponse {
                    product_id: request.product_id,
                    quantity,
                    available: quantity > 0,
                })
            }
        })
        .await
        .context("Failed to start RPC server")?;
    Ok(tag)
}

async fn query(engine: &RpcEngine, product_ids: &[String]) {
    let requests = product_ids.iter().map(|product_id| async move {
        let request = InventoryRequest {
            product_id: product_id.clone(),
        };
        (product_id, engine.request::<_, InventoryResponse>(&request).await)
    });

    for (product_id, result) in futures::future::join_all(requests).await {
        match result {
            Ok(response) => info!(
                product = %response.product_id,
                quantity = response.quantity,
                available = response.available,
                "Inventory reply"
            ),
            Err(e) => error!(product = %product_id, error = %e, "Inventory request failed"),
        }
    }
}

/// Server and client in one process over the in-memory broker.
async fn run_demo() -> Result<()> {
    let client = Arc::new(MessagingClient::new(
        Arc::new(MemoryTransport::new()),
        Arc::new(TracingSink),
    ));
    let rpc = RpcConfig {
        request_timeout_ms: Some(5_000),
        ..RpcConfig::default()
    };

    start_server(client.clone(), &rpc).await?;

    let engine = RpcEngine::new(client.clone(), rpc);
    engine.init().await?;

    let products: Vec<String> = ["product-1", "product-2", "product-3", "product-4"]
        .iter()
        .map(|p| p.to_string())
        .collect();
    query(&engine, &products).await;

    client.close().await?;
    Ok(())
}

async fn run_server() -> Result<()> {
    let config = load_config()?;
    let client = Arc::new(MessagingClient::connect(&config.broker));

    start_server(client.clone(), &config.rpc).await?;
    info!("Waiting for requests, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    info!("Shutting down");
    client.close().await?;
    Ok(())
}

async fn run_client(product_ids: &[String]) -> Result<()> {
    if product_ids.is_empty() {
        return Err(anyhow!("client needs at least one product id\n{}", USAGE));
    }

    let config = load_config()?;
    let client = Arc::new(MessagingClient::connect(&config.broker));
    let engine = RpcEngine::new(client.clone(), config.rpc.clone());
    engine.init().await?;

    query(&engine, product_ids).await;

    client.close().await?;
    Ok(())
}
