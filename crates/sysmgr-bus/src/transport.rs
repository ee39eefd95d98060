// Transport layer: length-delimited JSON-RPC over any async stream.
//
// Each message is framed as: [4-byte big-endian length][JSON payload]
// This lets an out-of-process backup daemon reach the bus over TCP or a
// Unix socket.

use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::protocol::{Request, Response, INVALID_REQUEST, PARSE_ERROR};
use crate::registry::ServiceBus;

const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize `msg` as JSON and write it as one frame.
pub async fn write_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg: &impl serde::Serialize,
) -> Result<()> {
    write_frame(writer, &serde_json::to_vec(msg)?).await
}

/// Read one frame. Errors here leave the stream out of sync, so callers
/// drop the connection; a frame that holds bad JSON is still a frame.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        anyhow::bail!("message too large: {} bytes", len);
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

// ---------------------------------------------------------------------------
// RPC Client: sends requests, receives responses
// ---------------------------------------------------------------------------

/// In-flight calls by request id. `None` once the reader has stopped.
type PendingMap = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<Response>>>>>;

/// Multiplexed RPC client over a framed stream.
pub struct RpcClient {
    tx: mpsc::Sender<Vec<u8>>,
    pending: PendingMap,
}

impl RpcClient {
    /// Spawn a client over a split read/write stream.
    pub fn spawn<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncReadExt + Unpin + Send + 'static,
        W: AsyncWriteExt + Unpin + Send + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(Some(HashMap::new())));
        let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(64);

        tokio::spawn(async move {
            let mut writer = writer;
            while let Some(payload) = write_rx.recv().await {
                if write_frame(&mut writer, &payload).await.is_err() {
                    break;
                }
            }
        });

        let in_flight = pending.clone();
        tokio::spawn(async move {
            let mut reader = reader;
            while let Ok(frame) = read_frame(&mut reader).await {
                let resp: Response = match serde_json::from_slice(&frame) {
                    Ok(resp) => resp,
                    Err(e) => {
                        tracing::debug!("client: skipping undecodable frame: {}", e);
                        continue;
                    }
                };
                let Some(id) = resp.id else {
                    tracing::warn!("client: server rejected a request: {:?}", resp.error);
                    continue;
                };
                if let Some(tx) = in_flight.lock().await.as_mut().and_then(|m| m.remove(&id)) {
                    let _ = tx.send(resp);
                }
            }
            // Dropping the senders fails every outstanding call.
            in_flight.lock().await.take();
        });

        Self {
            tx: write_tx,
            pending,
        }
    }

    /// Send a request and wait for the response.
    pub async fn call(
        &self,
        method: impl Into<String>,
        params: serde_json::Value,
    ) -> Result<Response> {
        let req = Request::new(method, params);
        let id = req.id;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("transport closed"))?
            .insert(id, tx);

        let payload = serde_json::to_vec(&req)?;
        self.tx
            .send(payload)
            .await
            .map_err(|_| anyhow::anyhow!("transport closed"))?;

        rx.await
            .map_err(|_| anyhow::anyhow!("response channel dropped"))
    }
}

// ---------------------------------------------------------------------------
// Bus server: answers framed requests by routing them through the bus
// ---------------------------------------------------------------------------

/// Serves one stream on behalf of a `ServiceBus`. Every frame that carries a
/// call gets exactly one response, including calls that cannot be decoded.
/// Only a broken frame boundary ends the connection.
pub struct BusServer {
    bus: ServiceBus,
}

impl BusServer {
    pub fn new(bus: ServiceBus) -> Self {
        Self { bus }
    }

    /// Serve a single connection until the peer closes it.
    pub async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncReadExt + Unpin + Send,
        W: AsyncWriteExt + Unpin + Send,
    {
        while let Ok(frame) = read_frame(&mut reader).await {
            if let Some(resp) = self.answer(&frame).await {
                write_message(&mut writer, &resp).await?;
            }
        }
        Ok(())
    }

    /// Decode one frame and route it. `None` means the frame expects no reply:
    /// a notification or a stray response.
    async fn answer(&self, frame: &[u8]) -> Option<Response> {
        let value: Value = match serde_json::from_slice(frame) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("bus server: unparseable frame: {}", e);
                let message = format!("parse error: {}", e);
                return Some(Response::rejected(None, PARSE_ERROR, message));
            }
        };
        let Some(object) = value.as_object() else {
            return Some(Response::rejected(None, INVALID_REQUEST, "request must be an object"));
        };
        let id = object.get("id").and_then(Value::as_u64);

        if !object.contains_key("method") {
            if object.contains_key("result") || object.contains_key("error") {
                tracing::debug!("bus server: ignoring stray response");
                return None;
            }
            return Some(Response::rejected(id, INVALID_REQUEST, "missing method"));
        }
        if !object.contains_key("id") {
            // No bus method is fire-and-forget
            tracing::debug!("bus server: ignoring notification {}", object["method"]);
            return None;
        }

        let req: Request = match serde_json::from_value(value) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!("bus server: invalid request: {}", e);
                let message = format!("invalid request: {}", e);
                return Some(Response::rejected(id, INVALID_REQUEST, message));
            }
        };
        match self.bus.dispatch(req.id, &req.method, req.params).await {
            Ok(resp) => Some(resp),
            Err(e) => {
                tracing::warn!("bus server: {} failed: {}", req.method, e);
                Some(Response::err(req.id, e.rpc_code(), e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::METHOD_NOT_FOUND;
    use crate::registry::Method;
    use tokio::io::duplex;

    #[tokio::test]
    async fn framed_roundtrip() {
        let (mut client, mut server) = duplex(1024);

        let req = Request::new("luna://svc/test", serde_json::json!({"key": "value"}));
        write_message(&mut client, &req).await.unwrap();

        let frame = read_frame(&mut server).await.unwrap();
        let r: Request = serde_json::from_slice(&frame).unwrap();
        assert_eq!(r.id, req.id);
        assert_eq!(r.method, "luna://svc/test");
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut client, mut server) = duplex(64);
        client
            .write_all(&((MAX_FRAME as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        let err = read_frame(&mut server).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    fn spawn_server(bus: ServiceBus) -> (RpcClient, tokio::task::JoinHandle<()>) {
        let (client_stream, server_stream) = duplex(4096);
        let (cr, cw) = tokio::io::split(client_stream);
        let (sr, sw) = tokio::io::split(server_stream);

        let server = BusServer::new(bus);
        let handle = tokio::spawn(async move {
            let _ = server.serve(sr, sw).await;
        });
        (RpcClient::spawn(cr, cw), handle)
    }

    #[tokio::test]
    async fn client_server_call() {
        let bus = ServiceBus::new();
        let svc = bus.register_service("com.example.echo").unwrap();
        svc.register_category(
            "/",
            vec![Method::new("echo", |message| {
                let payload = message.payload().clone();
                let _ = message.reply(payload);
            })],
        )
        .unwrap();
        svc.attach(&tokio::runtime::Handle::current()).unwrap();

        let (client, server_handle) = spawn_server(bus);
        let resp = client
            .call("luna://com.example.echo/echo", serde_json::json!({"hello": "world"}))
            .await
            .unwrap();

        assert!(resp.error.is_none());
        assert_eq!(resp.result.unwrap(), serde_json::json!({"hello": "world"}));

        server_handle.abort();
    }

    #[tokio::test]
    async fn routing_failures_become_error_responses() {
        let (client, server_handle) = spawn_server(ServiceBus::new());

        let resp = client
            .call("luna://nonexistent/method", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);

        let resp = client.call("not-a-uri", serde_json::json!({})).await.unwrap();
        assert_eq!(resp.error.unwrap().code, INVALID_REQUEST);

        server_handle.abort();
    }

    async fn exchange(stream: &mut tokio::io::DuplexStream, frame: &[u8]) -> Response {
        write_frame(stream, frame).await.unwrap();
        serde_json::from_slice(&read_frame(stream).await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn undecodable_requests_are_answered_and_connection_survives() {
        let (mut client, server_stream) = duplex(4096);
        let (sr, sw) = tokio::io::split(server_stream);
        let server = BusServer::new(ServiceBus::new());
        let server_handle = tokio::spawn(async move {
            let _ = server.serve(sr, sw).await;
        });

        let resp = exchange(&mut client, b"{not json").await;
        assert!(resp.id.is_none());
        assert_eq!(resp.error.unwrap().code, PARSE_ERROR);

        let resp = exchange(
            &mut client,
            br#"{"jsonrpc":"2.0","id":"abc","method":"luna://svc/m","params":{}}"#,
        )
        .await;
        assert!(resp.id.is_none());
        assert_eq!(resp.error.unwrap().code, INVALID_REQUEST);

        let resp = exchange(&mut client, br#"{"jsonrpc":"2.0","id":4,"method":7}"#).await;
        assert_eq!(resp.id, Some(4));
        assert_eq!(resp.error.unwrap().code, INVALID_REQUEST);

        let resp = exchange(&mut client, b"[1, 2]").await;
        assert_eq!(resp.error.unwrap().code, INVALID_REQUEST);

        // Notifications and stray responses get no reply, so the next frame
        // read belongs to the request that follows them.
        write_frame(&mut client, br#"{"jsonrpc":"2.0","method":"luna://svc/m"}"#)
            .await
            .unwrap();
        write_message(&mut client, &Response::ok(99, serde_json::json!({})))
            .await
            .unwrap();
        let req = Request::new("luna://nonexistent/method", serde_json::json!({}));
        let resp = exchange(&mut client, &serde_json::to_vec(&req).unwrap()).await;
        assert_eq!(resp.id, Some(req.id));
        assert_eq!(resp.error.unwrap().code, METHOD_NOT_FOUND);

        server_handle.abort();
    }

    #[tokio::test]
    async fn call_fails_when_server_goes_away() {
        let (client_stream, server_stream) = duplex(4096);
        let (cr, cw) = tokio::io::split(client_stream);
        let client = RpcClient::spawn(cr, cw);
        drop(server_stream);

        assert!(client.call("luna://svc/m", serde_json::json!({})).await.is_err());
    }
}
