// Bus daemon: exposes the in-process service bus over TCP.
//
// The backup daemon (or `sysmgr call`) connects, sends framed JSON-RPC
// requests addressed with luna:// URIs, and gets one response per request.

use anyhow::Result;
use std::future::Future;
use tokio::net::TcpListener;

use sysmgr_bus::{BusServer, ServiceBus};

/// Serve the bus on `bind:port` until `shutdown` resolves.
pub async fn run_daemon(
    bind: &str,
    port: u16,
    bus: ServiceBus,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let listener = TcpListener::bind(format!("{}:{}", bind, port)).await?;
    tracing::info!("Bus daemon listening on {}:{}", bind, port);

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                tracing::info!("Bus connection from {}", addr);
                let bus = bus.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, bus).await {
                        tracing::error!("Bus connection error: {}", e);
                    }
                });
            }
            _ = &mut shutdown => {
                tracing::info!("Bus daemon shutting down");
                return Ok(());
            }
        }
    }
}

/// Serve a single connection on a pre-bound listener (for tests).
pub async fn start_on_listener(listener: &TcpListener, bus: ServiceBus) -> Result<()> {
    let (stream, addr) = listener.accept().await?;
    tracing::info!("Bus connection from {}", addr);
    handle_connection(stream, bus).await
}

async fn handle_connection(stream: tokio::net::TcpStream, bus: ServiceBus) -> Result<()> {
    let (reader, writer) = tokio::io::split(stream);
    BusServer::new(bus).serve(reader, writer).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use sysmgr_bus::{Method, RpcClient, METHOD_NOT_FOUND};
    use tokio::runtime::Handle;

    #[tokio::test]
    async fn serves_registered_service() {
        let bus = ServiceBus::new();
        let svc = bus.register_service("com.example.ping").unwrap();
        svc.register_category(
            "/",
            vec![Method::new("ping", |message| {
                let _ = message.reply(serde_json::json!({"pong": true}));
            })],
        )
        .unwrap();
        svc.attach(&Handle::current()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let bus_clone = bus.clone();
        tokio::spawn(async move {
            let _ = start_on_listener(&listener, bus_clone).await;
        });

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (r, w) = tokio::io::split(stream);
        let client = RpcClient::spawn(r, w);

        let resp = client
            .call("luna://com.example.ping/ping", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(resp.result.unwrap(), serde_json::json!({"pong": true}));

        let resp = client
            .call("luna://com.example.gone/ping", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let daemon = tokio::spawn(run_daemon("127.0.0.1", 0, ServiceBus::new(), async {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();
        daemon.await.unwrap().unwrap();
    }
}
