//! Proxy registration: turning a validated `NewProxy` request into held
//! resources (ports, vhost routes, visitor entries) and back.
//!
//! The data plane itself stays with the vhost routers and the visitor
//! pairing path; what lives here is resource acquisition with rollback,
//! so a failed registration never leaks a port or a route.

use crate::control::Control;
use crate::port_manager::PortError;
use crate::registry::{ProxyEntry, RegistryError};
use crate::service::ServerContext;
use async_trait::async_trait;
use passage_proto::msg::NewProxy;
use passage_vhost::{BoxedStream, RouteTable, RouteTarget, VhostError, VhostRoute};
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Name(#[from] RegistryError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Vhost(#[from] VhostError),

    #[error("proxy type {0} is not supported")]
    UnsupportedType(String),

    #[error("http(s) proxy requires custom domains or a subdomain")]
    MissingDomains,

    #[error("subdomain requires subdomain_host to be configured")]
    SubdomainNotEnabled,

    #[error("vhost {0} port is not enabled on this server")]
    VhostNotEnabled(&'static str),

    #[error("port quota of {0} ports per client exceeded")]
    PortQuotaExceeded(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortFlavor {
    Tcp,
    Udp,
}

/// Everything a registered proxy holds; released on CloseProxy and on the
/// owning control's shutdown path.
#[derive(Default)]
pub struct ProxyResources {
    pub proxy_type: String,
    pub remote_addr: String,
    pub ports: Vec<(PortFlavor, u16)>,
    pub http_routes: Vec<(String, String)>,
    pub https_routes: Vec<(String, String)>,
    pub visitor: bool,
}

/// Pulls a work connection from the owning control when a router needs a
/// backend stream.
struct WorkConnTarget {
    ctl: Arc<Control>,
}

#[async_trait]
impl RouteTarget for WorkConnTarget {
    async fn open(&self) -> io::Result<BoxedStream> {
        self.ctl
            .get_work_conn()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::TimedOut, e.to_string()))
    }
}

/// Validate and register one proxy, acquiring all its resources. The global
/// name is reserved first and rolled back if anything later fails.
pub async fn register_proxy(
    ctx: &Arc<ServerContext>,
    ctl: &Arc<Control>,
    msg: &NewProxy,
) -> Result<ProxyResources, ProxyError> {
    ctx.proxy_registry.add(ProxyEntry {
        name: msg.proxy_name.clone(),
        proxy_type: msg.proxy_type.clone(),
        run_id: ctl.run_id().to_string(),
    })?;

    match build_resources(ctx, ctl, msg) {
        Ok(resources) => Ok(resources),
        Err(e) => {
            ctx.proxy_registry.del(&msg.proxy_name);
            Err(e)
        }
    }
}

/// Release everything `register_proxy` acquired.
pub fn unregister_proxy(ctx: &ServerContext, name: &str, resources: &ProxyResources) {
    ctx.proxy_registry.del(name);
    for (flavor, port) in &resources.ports {
        match flavor {
            PortFlavor::Tcp => ctx.tcp_ports.release(*port),
            PortFlavor::Udp => ctx.udp_ports.release(*port),
        }
    }
    for (host, location) in &resources.http_routes {
        ctx.http_routes.unregister(host, location);
    }
    for (host, location) in &resources.https_routes {
        ctx.https_routes.unregister(host, location);
    }
    if resources.visitor {
        ctx.visitor_registry.unregister(name);
    }
    debug!("proxy {} unregistered", name);
}

fn build_resources(
    ctx: &Arc<ServerContext>,
    ctl: &Arc<Control>,
    msg: &NewProxy,
) -> Result<ProxyResources, ProxyError> {
    match msg.proxy_type.as_str() {
        "tcp" => allocate_port(ctx, ctl, msg, PortFlavor::Tcp),
        "udp" => allocate_port(ctx, ctl, msg, PortFlavor::Udp),
        "http" => register_vhost(ctx, ctl, msg, false),
        "https" => register_vhost(ctx, ctl, msg, true),
        "stcp" | "xtcp" => {
            ctx.visitor_registry
                .register(&msg.proxy_name, &msg.sk, ctl.run_id());
            Ok(ProxyResources {
                proxy_type: msg.proxy_type.clone(),
                visitor: true,
                ..Default::default()
            })
        }
        other => Err(ProxyError::UnsupportedType(other.to_string())),
    }
}

fn allocate_port(
    ctx: &Arc<ServerContext>,
    ctl: &Arc<Control>,
    msg: &NewProxy,
    flavor: PortFlavor,
) -> Result<ProxyResources, ProxyError> {
    let quota = ctx.cfg.max_ports_per_client;
    if quota > 0 && ctl.allocated_port_count() + 1 > quota {
        return Err(ProxyError::PortQuotaExceeded(quota));
    }

    let manager = match flavor {
        PortFlavor::Tcp => &ctx.tcp_ports,
        PortFlavor::Udp => &ctx.udp_ports,
    };
    let port = if msg.remote_port > 0 {
        manager.acquire(msg.remote_port)?
    } else {
        manager.acquire_any()?
    };

    Ok(ProxyResources {
        proxy_type: msg.proxy_type.clone(),
        remote_addr: format!("{}:{}", ctx.cfg.proxy_bind_addr, port),
        ports: vec![(flavor, port)],
        ..Default::default()
    })
}

fn register_vhost(
    ctx: &Arc<ServerContext>,
    ctl: &Arc<Control>,
    msg: &NewProxy,
    https: bool,
) -> Result<ProxyResources, ProxyError> {
    let (table, vhost_port): (&Arc<RouteTable>, u16) = if https {
        if ctx.cfg.vhost_https_port == 0 {
            return Err(ProxyError::VhostNotEnabled("https"));
        }
        (&ctx.https_routes, ctx.cfg.vhost_https_port)
    } else {
        if ctx.cfg.vhost_http_port == 0 {
            return Err(ProxyError::VhostNotEnabled("http"));
        }
        (&ctx.http_routes, ctx.cfg.vhost_http_port)
    };

    let mut domains: Vec<String> = msg
        .custom_domains
        .iter()
        .filter(|d| !d.is_empty())
        .map(|d| d.to_ascii_lowercase())
        .collect();
    if !msg.subdomain.is_empty() {
        if ctx.cfg.subdomain_host.is_empty() {
            return Err(ProxyError::SubdomainNotEnabled);
        }
        domains.push(format!("{}.{}", msg.subdomain, ctx.cfg.subdomain_host).to_ascii_lowercase());
    }
    if domains.is_empty() {
        return Err(ProxyError::MissingDomains);
    }

    // SNI routing has no notion of paths.
    let locations: Vec<String> = if https || msg.locations.is_empty() {
        vec![String::new()]
    } else {
        msg.locations.clone()
    };
    let rewrite_host =
        (!msg.host_header_rewrite.is_empty()).then(|| msg.host_header_rewrite.clone());

    let target: Arc<dyn RouteTarget> = Arc::new(WorkConnTarget { ctl: ctl.clone() });
    let mut registered: Vec<(String, String)> = Vec::new();
    for domain in &domains {
        for location in &locations {
            let route = VhostRoute {
                host: domain.clone(),
                location: location.clone(),
                name: msg.proxy_name.clone(),
                rewrite_host: rewrite_host.clone(),
            };
            if let Err(e) = table.register(route, target.clone()) {
                for (host, location) in &registered {
                    table.unregister(host, location);
                }
                return Err(e.into());
            }
            registered.push((domain.clone(), location.clone()));
        }
    }

    let scheme = if https { "https" } else { "http" };
    let remote_addr = domains
        .iter()
        .map(|d| format!("{}://{}:{}", scheme, d, vhost_port))
        .collect::<Vec<_>>()
        .join(",");

    let (http_routes, https_routes) = if https {
        (Vec::new(), registered)
    } else {
        (registered, Vec::new())
    };

    Ok(ProxyResources {
        proxy_type: msg.proxy_type.clone(),
        remote_addr,
        ports: Vec::new(),
        http_routes,
        https_routes,
        visitor: false,
    })
}
