//! Line-oriented JSON-RPC transport.
//!
//! Every frame is one JSON object terminated by `\n`. Requests carry an `id`
//! that responses echo, so one connection multiplexes concurrent calls. The
//! log stream is a request answered by many responses with `more: true`,
//! closed by a final response with `more: false`.

use super::{LogStream, PluginRpc};
use crate::endpoint::Action;
use crate::error::{PluginError, PluginResult};
use crate::message::{
    RefreshTokenRequest, RegisterRequest, Registration, Request, Response, TokenRequest,
    TokenResponse,
};
use crate::tls::ClientTls;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};
use tracing::{debug, warn};

const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;
/// Log frames buffered on the client before the reader waits for the consumer.
const LOG_STREAM_CAPACITY: usize = 256;

pub const METHOD_REGISTER: &str = "Plugin.Register";
pub const METHOD_CALL: &str = "Plugin.Call";
pub const METHOD_LOGGING_STREAM: &str = "Plugin.LoggingStream";
pub const METHOD_REQUEST_TOKEN: &str = "Plugin.RequestToken";
pub const METHOD_REFRESH_TOKEN: &str = "Plugin.RefreshToken";

#[derive(Debug, Serialize, Deserialize)]
struct WireRequest {
    id: u64,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireError {
    code: i32,
    message: String,
}

impl WireError {
    fn closed() -> Self {
        Self {
            code: Code::Unavailable as i32,
            message: "connection closed".to_string(),
        }
    }

    fn into_error(self, method: &str) -> PluginError {
        PluginError::from_status(method, Status::new(Code::from_i32(self.code), self.message))
    }
}

impl From<PluginError> for WireError {
    fn from(err: PluginError) -> Self {
        let status = Status::from(err);
        Self {
            code: status.code() as i32,
            message: status.message().to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireResponse {
    id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<WireError>,
    #[serde(default)]
    more: bool,
}

impl WireResponse {
    fn from_result(id: u64, result: PluginResult<Value>, more: bool) -> Self {
        match result {
            Ok(value) => Self {
                id,
                result: Some(value),
                error: None,
                more,
            },
            Err(err) => Self {
                id,
                result: None,
                error: Some(err.into()),
                more: false,
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CallParams {
    method: String,
    action: Action,
    request: Request,
}

fn decode_params<T: DeserializeOwned>(params: Value) -> PluginResult<T> {
    serde_json::from_value(params)
        .map_err(|e| PluginError::InvalidRequest(format!("invalid params: {e}")))
}

// ============================================================================
// Server
// ============================================================================

/// Serves `handler` on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn PluginRpc>,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationToken,
) -> PluginResult<()> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept RPC connection");
                    continue;
                }
            },
        };

        debug!(peer = %peer, tls = tls.is_some(), "Accepted RPC connection");
        let handler = handler.clone();
        let tls = tls.clone();
        let shutdown = shutdown.child_token();

        tokio::spawn(async move {
            let result = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => serve_connection(stream, handler, shutdown).await,
                    Err(e) => Err(PluginError::Tls(format!("handshake with {peer} failed: {e}"))),
                },
                None => serve_connection(stream, handler, shutdown).await,
            };
            if let Err(e) = result {
                debug!(peer = %peer, error = %e, "RPC connection ended with error");
            }
        });
    }
    Ok(())
}

async fn serve_connection<S>(
    stream: S,
    handler: Arc<dyn PluginRpc>,
    shutdown: CancellationToken,
) -> PluginResult<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    let mut lines = FramedRead::new(read, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut sink = FramedWrite::new(write, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let (tx, mut rx) = mpsc::channel::<WireResponse>(64);

    let writer = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let line = serde_json::to_string(&response)?;
            sink.send(line)
                .await
                .map_err(|e| PluginError::transport("write", e))?;
        }
        Ok::<_, PluginError>(())
    });

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next() => line,
        };
        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                warn!(error = %e, "Dropping RPC connection after read error");
                break;
            }
            None => break,
        };

        let request: WireRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Ignoring undecodable RPC frame");
                continue;
            }
        };

        let handler = handler.clone();
        let tx = tx.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { dispatch(handler, request, tx, shutdown).await });
    }

    // Stops streaming responders still attached to this connection.
    shutdown.cancel();
    drop(tx);
    writer
        .await
        .map_err(|e| PluginError::transport("write", e))?
}

async fn dispatch(
    handler: Arc<dyn PluginRpc>,
    request: WireRequest,
    tx: mpsc::Sender<WireResponse>,
    shutdown: CancellationToken,
) {
    let WireRequest { id, method, params } = request;

    if method == METHOD_LOGGING_STREAM {
        stream_logs(handler, id, tx, shutdown).await;
        return;
    }

    let result = tokio::select! {
        _ = shutdown.cancelled() => return,
        result = invoke(handler.as_ref(), &method, params) => result,
    };
    let _ = tx.send(WireResponse::from_result(id, result, false)).await;
}

async fn invoke(handler: &dyn PluginRpc, method: &str, params: Value) -> PluginResult<Value> {
    match method {
        METHOD_REGISTER => {
            let request: RegisterRequest = decode_params(params)?;
            Ok(serde_json::to_value(handler.register(request).await?)?)
        }
        METHOD_CALL => {
            let params: CallParams = decode_params(params)?;
            let response = handler
                .call(&params.method, params.action, params.request)
                .await?;
            Ok(serde_json::to_value(response)?)
        }
        METHOD_REQUEST_TOKEN => {
            let request: TokenRequest = decode_params(params)?;
            Ok(serde_json::to_value(handler.request_token(request).await?)?)
        }
        METHOD_REFRESH_TOKEN => {
            let request: RefreshTokenRequest = decode_params(params)?;
            Ok(serde_json::to_value(handler.refresh_token(request).await?)?)
        }
        other => Err(PluginError::Unimplemented(format!("unknown method {other}"))),
    }
}

async fn stream_logs(
    handler: Arc<dyn PluginRpc>,
    id: u64,
    tx: mpsc::Sender<WireResponse>,
    shutdown: CancellationToken,
) {
    let mut stream = match handler.logging_stream().await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = tx.send(WireResponse::from_result(id, Err(e), false)).await;
            return;
        }
    };

    loop {
        let item = tokio::select! {
            _ = shutdown.cancelled() => return,
            item = stream.next() => item,
        };
        let response = match item {
            Some(Ok(message)) => {
                let value = serde_json::to_value(message).map_err(PluginError::from);
                WireResponse::from_result(id, value, true)
            }
            Some(Err(e)) => WireResponse::from_result(id, Err(e), false),
            None => WireResponse {
                id,
                result: None,
                error: None,
                more: false,
            },
        };
        let done = !response.more;
        if tx.send(response).await.is_err() || done {
            return;
        }
    }
}

// ============================================================================
// Client
// ============================================================================

type Reply = Result<Value, WireError>;

enum Pending {
    Unary(oneshot::Sender<Reply>),
    Stream(mpsc::Sender<Reply>),
}

/// Removes an unanswered request from the pending table when the caller
/// stops waiting for it.
struct PendingGuard<'a> {
    state: &'a Mutex<ClientState>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.state.lock().pending.remove(&self.id);
    }
}

#[derive(Default)]
struct ClientState {
    pending: HashMap<u64, Pending>,
    closed: bool,
}

/// Client half of the line-RPC transport.
pub struct LegacyClient {
    outbound: mpsc::Sender<WireRequest>,
    state: Arc<Mutex<ClientState>>,
    next_id: AtomicU64,
    tasks: [JoinHandle<()>; 2],
}

impl LegacyClient {
    /// Connects to a child, upgrading to TLS when trust settings are given.
    pub async fn connect(address: SocketAddr, tls: Option<&ClientTls>) -> PluginResult<Self> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| PluginError::transport("connect", format!("{address}: {e}")))?;
        stream.set_nodelay(true)?;

        match tls {
            Some(tls) => {
                let (connector, server_name) = tls.connector()?;
                let stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| PluginError::Tls(format!("handshake with {address} failed: {e}")))?;
                Ok(Self::start(stream))
            }
            None => Ok(Self::start(stream)),
        }
    }

    fn start<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        let mut lines = FramedRead::new(read, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let mut sink = FramedWrite::new(write, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let (outbound, mut outbound_rx) = mpsc::channel::<WireRequest>(64);
        let state = Arc::new(Mutex::new(ClientState::default()));

        let writer = tokio::spawn(async move {
            while let Some(request) = outbound_rx.recv().await {
                let line = match serde_json::to_string(&request) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode RPC request");
                        continue;
                    }
                };
                if let Err(e) = sink.send(line).await {
                    debug!(error = %e, "RPC writer stopped");
                    break;
                }
            }
        });

        let reader_state = state.clone();
        let reader = tokio::spawn(async move {
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        debug!(error = %e, "RPC reader stopped");
                        break;
                    }
                };
                let response = match serde_json::from_str::<WireResponse>(&line) {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(error = %e, "Ignoring undecodable RPC response");
                        continue;
                    }
                };
                let id = response.id;
                if let Some((tx, reply)) = deliver(&reader_state, response) {
                    // Waits for the log consumer; a dropped stream stops its frames.
                    if tx.send(reply).await.is_err() {
                        reader_state.lock().pending.remove(&id);
                    }
                }
            }

            let mut state = reader_state.lock();
            state.closed = true;
            for (_, pending) in state.pending.drain() {
                match pending {
                    Pending::Unary(tx) => {
                        let _ = tx.send(Err(WireError::closed()));
                    }
                    Pending::Stream(tx) => {
                        let _ = tx.try_send(Err(WireError::closed()));
                    }
                }
            }
        });

        Self {
            outbound,
            state,
            next_id: AtomicU64::new(1),
            tasks: [reader, writer],
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send(&self, id: u64, method: &str, params: Value, pending: Pending) -> PluginResult<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PluginError::transport(method, "connection closed"));
            }
            state.pending.insert(id, pending);
        }

        let request = WireRequest {
            id,
            method: method.to_string(),
            params,
        };
        if self.outbound.send(request).await.is_err() {
            self.state.lock().pending.remove(&id);
            return Err(PluginError::transport(method, "connection closed"));
        }
        Ok(())
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: impl Serialize,
        label: &str,
    ) -> PluginResult<T> {
        let (tx, rx) = oneshot::channel();
        let params = serde_json::to_value(params)?;
        let id = self.next_id();
        let _guard = PendingGuard {
            state: &self.state,
            id,
        };
        self.send(id, method, params, Pending::Unary(tx)).await?;

        let value = rx
            .await
            .map_err(|_| PluginError::transport(label, "connection closed"))?
            .map_err(|e| e.into_error(label))?;
        serde_json::from_value(value)
            .map_err(|e| PluginError::transport(label, format!("undecodable response: {e}")))
    }
}

/// Completes a unary request in place. A stream frame is handed back with its
/// sender so the reader can wait for capacity outside the lock.
fn deliver(state: &Mutex<ClientState>, response: WireResponse) -> Option<(mpsc::Sender<Reply>, Reply)> {
    let mut state = state.lock();
    let reply = match response.error {
        Some(err) => Err(err),
        None => Ok(response.result.unwrap_or(Value::Null)),
    };

    match state.pending.remove(&response.id) {
        Some(Pending::Unary(tx)) => {
            let _ = tx.send(reply);
            None
        }
        Some(Pending::Stream(tx)) => {
            let finished = !response.more;
            if !finished {
                state.pending.insert(response.id, Pending::Stream(tx.clone()));
            }
            // The terminating frame carries no record.
            if finished && matches!(reply, Ok(Value::Null)) {
                None
            } else {
                Some((tx, reply))
            }
        }
        None => {
            debug!(id = response.id, "Dropping response for unknown request");
            None
        }
    }
}

impl Drop for LegacyClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl PluginRpc for LegacyClient {
    async fn register(&self, request: RegisterRequest) -> PluginResult<Registration> {
        self.request(METHOD_REGISTER, request, METHOD_REGISTER).await
    }

    async fn call(&self, method: &str, action: Action, request: Request) -> PluginResult<Response> {
        let params = CallParams {
            method: method.to_string(),
            action,
            request,
        };
        self.request(METHOD_CALL, params, method).await
    }

    async fn logging_stream(&self) -> PluginResult<LogStream> {
        let (tx, rx) = mpsc::channel(LOG_STREAM_CAPACITY);
        let id = self.next_id();
        self.send(id, METHOD_LOGGING_STREAM, Value::Null, Pending::Stream(tx))
            .await?;

        let stream = ReceiverStream::new(rx).map(|reply| {
            let value = reply.map_err(|e| e.into_error(METHOD_LOGGING_STREAM))?;
            serde_json::from_value(value).map_err(PluginError::from)
        });
        Ok(stream.boxed())
    }

    async fn request_token(&self, request: TokenRequest) -> PluginResult<TokenResponse> {
        self.request(METHOD_REQUEST_TOKEN, request, METHOD_REQUEST_TOKEN)
            .await
    }

    async fn refresh_token(&self, request: RefreshTokenRequest) -> PluginResult<TokenResponse> {
        self.request(METHOD_REFRESH_TOKEN, request, METHOD_REFRESH_TOKEN)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::test_support::self_signed;
    use crate::transport::test_support::{exercise, EchoService};
    use std::time::Duration;

    async fn start_server(tls: Option<TlsAcceptor>) -> (SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(listener, Arc::new(EchoService), tls, shutdown.clone()));
        (addr, shutdown)
    }

    #[tokio::test]
    async fn test_plaintext_contract() {
        let (addr, _shutdown) = start_server(None).await;
        let client = LegacyClient::connect(addr, None).await.unwrap();
        exercise(&client).await;
    }

    #[tokio::test]
    async fn test_tls_contract() {
        crate::tls::install_default_provider();
        let material = self_signed();
        let (addr, _shutdown) = start_server(Some(material.acceptor().unwrap())).await;
        let client = LegacyClient::connect(addr, Some(&material.client("localhost")))
            .await
            .unwrap();
        exercise(&client).await;
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_multiplexed() {
        let (addr, _shutdown) = start_server(None).await;
        let client = Arc::new(LegacyClient::connect(addr, None).await.unwrap());

        let slow = {
            let client = client.clone();
            tokio::spawn(async move {
                tokio::time::timeout(
                    Duration::from_millis(200),
                    client.call("/slow", Action::Read, Request::new()),
                )
                .await
            })
        };
        let fast = client
            .call("/echo", Action::Read, Request::new().with_body("quick"))
            .await
            .unwrap();
        assert_eq!(fast.value, b"quick");
        assert!(slow.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_pending_calls_fail_when_server_stops() {
        let (addr, shutdown) = start_server(None).await;
        let client = LegacyClient::connect(addr, None).await.unwrap();

        let call = client.call("/slow", Action::Read, Request::new());
        let stop = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.cancel();
        };
        let (result, _) = tokio::join!(call, stop);
        assert!(matches!(result, Err(PluginError::Transport { .. })));

        let after = client.call("/echo", Action::Read, Request::new()).await;
        assert!(after.is_err());
    }

    #[tokio::test]
    async fn test_abandoned_calls_leave_no_pending_entries() {
        let (addr, _shutdown) = start_server(None).await;
        let client = LegacyClient::connect(addr, None).await.unwrap();

        for _ in 0..5 {
            let abandoned = tokio::time::timeout(
                Duration::from_millis(20),
                client.call("/slow", Action::Read, Request::new()),
            )
            .await;
            assert!(abandoned.is_err());
        }
        assert!(client.state.lock().pending.is_empty());

        let echoed = client
            .call("/echo", Action::Read, Request::new().with_body("still up"))
            .await
            .unwrap();
        assert_eq!(echoed.value, b"still up");
    }

    #[tokio::test]
    async fn test_log_stream_applies_backpressure() {
        let state = Mutex::new(ClientState::default());
        let (tx, mut rx) = mpsc::channel(1);
        state.lock().pending.insert(7, Pending::Stream(tx));

        let frame = |more| WireResponse {
            id: 7,
            result: Some(serde_json::json!({ "n": 1 })),
            error: None,
            more,
        };
        let (first_tx, first) = deliver(&state, frame(true)).unwrap();
        first_tx.try_send(first).unwrap();
        let (second_tx, second) = deliver(&state, frame(true)).unwrap();
        assert!(matches!(
            second_tx.try_send(second),
            Err(mpsc::error::TrySendError::Full(_))
        ));

        assert!(rx.recv().await.unwrap().is_ok());
        assert!(deliver(&state, WireResponse { id: 7, result: None, error: None, more: false }).is_none());
        assert!(state.lock().pending.is_empty());
    }

    #[test]
    fn test_wire_error_preserves_kind() {
        let wire: WireError = PluginError::NotFound("read:/x".to_string()).into();
        assert!(matches!(wire.into_error("/x"), PluginError::NotFound(_)));
    }
}
