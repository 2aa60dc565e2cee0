use crate::read_envelope;
use crate::write_frame;
use crate::AcceptFailedSnafu;
use crate::BindFailedSnafu;
use crate::Error;
use crate::RPCEnvelope;
use crate::RPCStatus;
use crate::Result;
use crate::StatusCode;
use crate::PROTOCOL_VERSION;
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

type ServiceName = String;
type MethodName = String;

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>, RPCStatus>> + Send>>;

pub type Handler = Box<dyn Fn(Vec<u8>) -> HandlerFuture + Send + Sync>;

/// Boxes an async closure into a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, RPCStatus>> + Send + 'static,
{
    Box::new(move |payload| -> HandlerFuture { Box::pin(f(payload)) })
}

type HandlerMap = HashMap<(ServiceName, MethodName), Handler>;

/// Handler registry plus the entry points that put it on a socket.
///
/// A server with nothing registered still accepts connections; every call it
/// receives is answered with [`StatusCode::Unimplemented`].
#[derive(Default)]
pub struct RPCServer {
    handlers: HashMap<(ServiceName, MethodName), Handler>,
}

impl RPCServer {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register_service(&mut self, service: ServiceName, method: MethodName, handler: Handler) {
        self.handlers.insert((service, method), handler);
    }

    /// Opens the listening socket without accepting anything yet.
    pub async fn bind(self, address: &str) -> Result<BoundServer> {
        let listener = TcpListener::bind(resolve_bind_address(address).as_ref())
            .await
            .context(BindFailedSnafu { address })?;
        let local_addr = listener
            .local_addr()
            .context(BindFailedSnafu { address })?;
        Ok(BoundServer {
            listener,
            local_addr,
            handlers: Arc::new(self.handlers),
        })
    }

    pub async fn serve(self, address: &str) -> Result<Infallible> {
        self.bind(address).await?.serve().await
    }
}

/// A listening socket that has not entered the accept loop.
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    handlers: Arc<HandlerMap>,
}

impl BoundServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until the listener fails. Only returns on error.
    pub async fn serve(self) -> Result<Infallible> {
        loop {
            let (stream, peer) = self.listener.accept().await.context(AcceptFailedSnafu)?;
            tracing::debug!("Accepted connection from {}", peer);
            if let Err(e) = stream.set_nodelay(true) {
                tracing::warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
            }
            let handlers = self.handlers.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, handlers).await {
                    tracing::error!("Error handling connection from {}: {}", peer, e);
                }
            });
        }
    }
}

/// Maps a host-less `":port"` to all IPv4 interfaces; anything else is left
/// for the socket layer to judge.
pub fn resolve_bind_address(address: &str) -> Cow<'_, str> {
    match address.strip_prefix(':') {
        Some(port) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            Cow::Owned(format!("0.0.0.0:{}", port))
        }
        _ => Cow::Borrowed(address),
    }
}

pub(crate) async fn handle_connection(stream: TcpStream, handlers: Arc<HandlerMap>) -> Result<()> {
    let (mut read_half, write_half) = stream.into_split();
    let write_half = Arc::new(Mutex::new(write_half));
    loop {
        let request = match read_envelope(&mut read_half).await {
            Ok(request) => request,
            Err(e) if e.is_disconnect() => {
                tracing::debug!("Peer closed connection");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!("Dropping connection after bad frame: {}", e);
                return Err(e);
            }
        };
        let handlers = handlers.clone();
        let write_half = write_half.clone();
        tokio::spawn(async move {
            let reply = dispatch(&handlers, request).await;
            respond(&write_half, reply).await;
        });
    }
}

/// Writes `reply`, substituting an `Internal` status when it is too large to
/// frame so the caller is never left without an answer.
async fn respond(write_half: &Mutex<OwnedWriteHalf>, reply: RPCEnvelope) {
    let mut writer = write_half.lock().await;
    let outcome = match write_frame(&mut *writer, &reply).await {
        Err(Error::FrameTooLarge { len }) => {
            tracing::warn!(
                "Response too large: seq={}, len={}",
                reply.sequence_number,
                len
            );
            let status = RPCStatus::new(StatusCode::Internal, "response exceeds frame limit");
            write_frame(&mut *writer, &reply.reply(status, Vec::new())).await
        }
        outcome => outcome,
    };
    if let Err(e) = outcome {
        tracing::warn!(
            "Failed to write response: seq={}, error={}",
            reply.sequence_number,
            e
        );
    }
}

async fn dispatch(handlers: &HandlerMap, mut request: RPCEnvelope) -> RPCEnvelope {
    if request.version != PROTOCOL_VERSION {
        let status = RPCStatus::new(
            StatusCode::InvalidArgument,
            format!("unsupported protocol version {}", request.version),
        );
        return request.reply(status, Vec::new());
    }

    let key = (request.service_name.clone(), request.method_name.clone());
    let Some(handler) = handlers.get(&key) else {
        tracing::debug!(
            "No handler registered: service={}, method={}",
            request.service_name,
            request.method_name
        );
        let status = RPCStatus::unimplemented(&request.service_name, &request.method_name);
        return request.reply(status, Vec::new());
    };

    let payload = std::mem::take(&mut request.payload);
    match handler(payload).await {
        Ok(response) => request.reply(RPCStatus::ok(), response),
        Err(status) => request.reply(status, Vec::new()),
    }
}
