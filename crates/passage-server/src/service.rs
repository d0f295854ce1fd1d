//! Service composition: binds the listeners, wires the registries, and runs
//! the connection-dispatch loop.
//!
//! Every inbound connection on the control port speaks exactly one framed
//! message first; that message decides whether it becomes a control channel,
//! a work connection, or a visitor connection.

use crate::config::{ConfigError, ServerConfig};
use crate::control::Control;
use crate::port_manager::PortManager;
use crate::registry::{ControlRegistry, ProxyRegistry};
use crate::visitor::VisitorRegistry;
use passage_mux::{sniff, MuxConfig, MuxSession, PortMux, SubListener};
use passage_proto::msg::{LoginResp, Message, NewVisitorConnResp};
use passage_proto::{codec, verify_privilege_key, version, Login, NewVisitorConn, NewWorkConn};
use passage_vhost::{
    handle_http_connection, handle_https_connection, BoxedStream, HttpProxyConfig, RouteTable,
    DEFAULT_SNI_TIMEOUT,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, trace, warn};

/// Deadline for the first framed message on any new connection, and for the
/// port muxer's sniff.
pub const CONN_READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared server state threaded through constructors instead of living in a
/// process-wide global. Controls keep a handle to it strictly for registry,
/// router, and port-allocator lookups.
pub struct ServerContext {
    pub cfg: ServerConfig,
    pub ctl_registry: ControlRegistry,
    pub proxy_registry: ProxyRegistry,
    pub visitor_registry: VisitorRegistry,
    pub http_routes: Arc<RouteTable>,
    pub https_routes: Arc<RouteTable>,
    pub tcp_ports: PortManager,
    pub udp_ports: PortManager,
}

impl ServerContext {
    pub fn new(cfg: ServerConfig) -> Result<Self, ConfigError> {
        let ranges = cfg.allow_port_ranges()?;
        Ok(Self {
            cfg,
            ctl_registry: ControlRegistry::new(),
            proxy_registry: ProxyRegistry::new(),
            visitor_registry: VisitorRegistry::new(),
            http_routes: Arc::new(RouteTable::new()),
            https_routes: Arc::new(RouteTable::new()),
            tcp_ports: PortManager::new("tcp", ranges.clone()),
            udp_ports: PortManager::new("udp", ranges),
        })
    }
}

/// A source of accepted connections: either a plain TCP listener or a
/// sub-listener of the port muxer.
enum Incoming {
    Direct(TcpListener),
    Muxed(SubListener),
}

impl Incoming {
    async fn accept(&mut self) -> Option<(BoxedStream, SocketAddr)> {
        match self {
            Incoming::Direct(listener) => match listener.accept().await {
                Ok((stream, peer)) => Some((Box::new(stream), peer)),
                Err(e) => {
                    warn!("listener accept failed: {}", e);
                    None
                }
            },
            Incoming::Muxed(sub) => sub
                .accept()
                .await
                .map(|(conn, peer)| (Box::new(conn) as BoxedStream, peer)),
        }
    }
}

pub struct Service {
    ctx: Arc<ServerContext>,
    control_incoming: Incoming,
    http_incoming: Option<Incoming>,
    https_incoming: Option<Incoming>,
    port_mux: Option<(PortMux, TcpListener)>,
    control_addr: SocketAddr,
}

impl Service {
    /// Bind all listeners and wire the components. Does not accept yet.
    pub async fn bind(cfg: ServerConfig) -> Result<Self, ServiceError> {
        let ctx = Arc::new(ServerContext::new(cfg)?);
        let cfg = &ctx.cfg;

        let main_listener = bind_tcp(&cfg.bind_address()).await?;
        let control_addr = main_listener.local_addr()?;
        info!("control listener on {}", control_addr);

        let same_iface = cfg.bind_addr == cfg.proxy_bind_addr;
        let http_mux_on =
            cfg.vhost_http_port > 0 && same_iface && cfg.vhost_http_port == cfg.bind_port;
        let https_mux_on =
            cfg.vhost_https_port > 0 && same_iface && cfg.vhost_https_port == cfg.bind_port;

        let mut port_mux = None;
        let mut http_sub = None;
        let mut https_sub = None;
        let control_incoming = if http_mux_on || https_mux_on {
            let mut mux = PortMux::new().with_sniff_timeout(CONN_READ_TIMEOUT);
            if https_mux_on {
                https_sub = Some(mux.listen("https", sniff::is_tls_client_hello));
            }
            if http_mux_on {
                http_sub = Some(mux.listen("http", sniff::is_http_request));
            }
            let default = mux.default_listener();
            info!("port multiplexer engaged on {}", control_addr);
            port_mux = Some((mux, main_listener));
            Incoming::Muxed(default)
        } else {
            Incoming::Direct(main_listener)
        };

        let http_incoming = match (cfg.vhost_http_port, http_sub) {
            (0, _) => None,
            (_, Some(sub)) => Some(Incoming::Muxed(sub)),
            (_, None) => {
                let listener = bind_tcp(&cfg.vhost_http_address()).await?;
                info!("http vhost listener on {}", listener.local_addr()?);
                Some(Incoming::Direct(listener))
            }
        };
        let https_incoming = match (cfg.vhost_https_port, https_sub) {
            (0, _) => None,
            (_, Some(sub)) => Some(Incoming::Muxed(sub)),
            (_, None) => {
                let listener = bind_tcp(&cfg.vhost_https_address()).await?;
                info!("https vhost listener on {}", listener.local_addr()?);
                Some(Incoming::Direct(listener))
            }
        };

        Ok(Self {
            ctx,
            control_incoming,
            http_incoming,
            https_incoming,
            port_mux,
            control_addr,
        })
    }

    /// Actual control listener address, useful when bound to port 0.
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn context(&self) -> Arc<ServerContext> {
        self.ctx.clone()
    }

    /// Run the accept and dispatch loops. Resolves only when the control
    /// listener dies.
    pub async fn run(mut self) {
        if let Some((mux, listener)) = self.port_mux.take() {
            tokio::spawn(mux.serve(listener));
        }

        if let Some(mut http) = self.http_incoming.take() {
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                let proxy_cfg = HttpProxyConfig {
                    request_timeout: Duration::from_secs(ctx.cfg.vhost_http_timeout),
                    ..Default::default()
                };
                while let Some((conn, peer)) = http.accept().await {
                    let ctx = ctx.clone();
                    let proxy_cfg = proxy_cfg.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_http_connection(&ctx.http_routes, conn, &proxy_cfg).await
                        {
                            debug!("http connection from {} closed: {}", peer, e);
                        }
                    });
                }
            });
        }

        if let Some(mut https) = self.https_incoming.take() {
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                while let Some((conn, peer)) = https.accept().await {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_https_connection(&ctx.https_routes, conn, DEFAULT_SNI_TIMEOUT)
                                .await
                        {
                            debug!("https connection from {} closed: {}", peer, e);
                        }
                    });
                }
            });
        }

        while let Some((conn, peer)) = self.control_incoming.accept().await {
            let ctx = self.ctx.clone();
            tokio::spawn(handle_connection(ctx, conn, peer));
        }
        info!("control listener stopped");
    }
}

async fn bind_tcp(addr: &str) -> Result<TcpListener, ServiceError> {
    TcpListener::bind(addr).await.map_err(|e| ServiceError::Bind {
        addr: addr.to_string(),
        source: e,
    })
}

/// Entry point for one accepted control-port connection. With stream
/// multiplexing on, the connection is a session whose every stream is
/// dispatched independently.
async fn handle_connection(ctx: Arc<ServerContext>, conn: BoxedStream, peer: SocketAddr) {
    if ctx.cfg.tcp_mux {
        let mut session = MuxSession::server(conn, MuxConfig::default());
        while let Some(stream) = session.accept().await {
            let ctx = ctx.clone();
            tokio::spawn(dispatch(ctx, Box::new(stream), peer));
        }
        trace!("mux session from {} ended", peer);
    } else {
        dispatch(ctx, conn, peer).await;
    }
}

/// Read the first framed message within the deadline and route the
/// connection by its type.
async fn dispatch(ctx: Arc<ServerContext>, mut conn: BoxedStream, peer: SocketAddr) {
    let first = match tokio::time::timeout(CONN_READ_TIMEOUT, codec::read_message(&mut conn)).await
    {
        Ok(Ok(msg)) => msg,
        Ok(Err(e)) => {
            trace!("failed to read first message from {}: {}", peer, e);
            return;
        }
        Err(_) => {
            trace!("connection from {} sent nothing within deadline", peer);
            return;
        }
    };

    match first {
        Message::Login(login) => handle_login(ctx, conn, login, peer).await,
        Message::NewWorkConn(msg) => register_work_conn(&ctx, conn, msg),
        Message::NewVisitorConn(msg) => register_visitor_conn(ctx, conn, msg).await,
        other => {
            warn!(
                "unexpected first message {} from {}, closing",
                other.name(),
                peer
            );
        }
    }
}

async fn handle_login(
    ctx: Arc<ServerContext>,
    mut conn: BoxedStream,
    login: Login,
    peer: SocketAddr,
) {
    info!(
        "client login from {}: version {} hostname {} os {} arch {}",
        peer, login.version, login.hostname, login.os, login.arch
    );

    if let Err(reason) = validate_login(&ctx.cfg, &login) {
        warn!("login from {} rejected: {}", peer, reason);
        let resp = LoginResp {
            version: version::full().to_string(),
            run_id: String::new(),
            error: reason,
        };
        let _ = codec::write_message(&mut conn, &Message::LoginResp(resp)).await;
        return;
    }

    let run_id = if login.run_id.is_empty() {
        random_run_id()
    } else {
        login.run_id.clone()
    };

    let ctl = Control::new(ctx.clone(), run_id.clone(), &login);
    if let Some(old) = ctx.ctl_registry.add(&run_id, ctl.clone()) {
        // The replaced control must finish releasing ports and proxies
        // before the new one starts serving.
        old.shutdown().await;
    }

    // The success reply is sent by the control's writer, with the same
    // framing and ordering as every later message.
    ctl.start(
        conn,
        Message::LoginResp(LoginResp {
            version: version::full().to_string(),
            run_id: run_id.clone(),
            error: String::new(),
        }),
    );
    info!("client {} logged in with run id {}", peer, run_id);
}

fn validate_login(cfg: &ServerConfig, login: &Login) -> Result<(), String> {
    version::check_compat(&login.version)?;
    verify_privilege_key(
        &cfg.token,
        login.timestamp,
        &login.privilege_key,
        cfg.auth_timeout,
        unix_now(),
    )
    .map_err(|e| e.to_string())?;
    Ok(())
}

fn register_work_conn(ctx: &Arc<ServerContext>, conn: BoxedStream, msg: NewWorkConn) {
    match ctx.ctl_registry.get_by_id(&msg.run_id) {
        Some(ctl) => ctl.register_work_conn(conn),
        None => warn!("no client control found for run id {}", msg.run_id),
    }
}

async fn register_visitor_conn(ctx: Arc<ServerContext>, mut conn: BoxedStream, msg: NewVisitorConn) {
    let result = ctx.visitor_registry.validate(&ctx, &msg);
    let resp = NewVisitorConnResp {
        proxy_name: msg.proxy_name.clone(),
        error: result
            .as_ref()
            .err()
            .map(ToString::to_string)
            .unwrap_or_default(),
    };
    if let Err(e) = codec::write_message(&mut conn, &Message::NewVisitorConnResp(resp)).await {
        debug!("failed to answer visitor for {}: {}", msg.proxy_name, e);
        return;
    }
    if result.is_ok() {
        ctx.visitor_registry.pair(ctx.clone(), &msg.proxy_name, conn);
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Opaque client identity for clients that logged in without one.
fn random_run_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}
