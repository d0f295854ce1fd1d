//! Per-client session state machine.
//!
//! Each authenticated client gets one [`Control`] running three tasks: a
//! reader draining the control channel, a writer with sole ownership of the
//! outbound direction (so replies stay totally ordered), and a manager
//! making the decisions. A supervisor task runs the shutdown path exactly
//! once, whichever side dies first.

use crate::proxy::{self, ProxyResources};
use crate::service::ServerContext;
use passage_proto::msg::{Message, NewProxyResp, Pong};
use passage_proto::{codec, Login};
use passage_vhost::BoxedStream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::ReadHalf;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// A single-use connection carrying one external user's traffic.
pub type WorkConn = BoxedStream;

/// Outbound queue depth; the writer drains this FIFO.
const SEND_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("timed out waiting for a work connection")]
    WorkConnTimeout,

    #[error("control for run id {0} is closed")]
    Closed(String),
}

pub struct Control {
    run_id: String,
    ctx: Arc<ServerContext>,

    pool_count: usize,
    heartbeat_timeout: Duration,
    work_conn_timeout: Duration,

    sender: mpsc::Sender<Message>,
    send_rx: Mutex<Option<mpsc::Receiver<Message>>>,

    work_tx: mpsc::Sender<WorkConn>,
    work_rx: AsyncMutex<mpsc::Receiver<WorkConn>>,
    pending_pulls: AtomicUsize,

    proxies: Mutex<HashMap<String, ProxyResources>>,
    last_ping: Mutex<Instant>,

    closing_tx: watch::Sender<bool>,
    closed_tx: watch::Sender<bool>,
}

impl Control {
    pub fn new(ctx: Arc<ServerContext>, run_id: String, login: &Login) -> Arc<Self> {
        let pool_count = login.pool_count.min(ctx.cfg.max_pool_count).max(1);
        let heartbeat_timeout = Duration::from_secs(ctx.cfg.heartbeat_timeout);
        let work_conn_timeout = Duration::from_secs(ctx.cfg.user_conn_timeout);

        let (sender, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (work_tx, work_rx) = mpsc::channel(pool_count);
        let (closing_tx, _) = watch::channel(false);
        let (closed_tx, _) = watch::channel(false);

        let ctl = Arc::new(Self {
            run_id,
            ctx,
            pool_count,
            heartbeat_timeout,
            work_conn_timeout,
            sender,
            send_rx: Mutex::new(Some(send_rx)),
            work_tx,
            work_rx: AsyncMutex::new(work_rx),
            pending_pulls: AtomicUsize::new(0),
            proxies: Mutex::new(HashMap::new()),
            last_ping: Mutex::new(Instant::now()),
            closing_tx,
            closed_tx,
        });

        // The supervisor exists from birth so shutdown always completes,
        // even for a control that was replaced before it started.
        tokio::spawn(supervise(ctl.clone()));
        ctl
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Spawn the session tasks. `login_resp` is queued ahead of everything
    /// else so the success reply uses the same framing and ordering as any
    /// later message.
    pub fn start(self: &Arc<Self>, conn: WorkConn, login_resp: Message) {
        if *self.closing_tx.borrow() {
            debug!("control for run id {} closed before start", self.run_id);
            return;
        }
        let _ = self.sender.try_send(login_resp);

        let (read_half, write_half) = tokio::io::split(conn);
        let (msg_tx, msg_rx) = mpsc::channel(SEND_QUEUE_DEPTH);

        tokio::spawn(reader_loop(self.clone(), read_half, msg_tx));
        tokio::spawn(writer_loop(self.clone(), write_half));
        tokio::spawn(manager_loop(self.clone(), msg_rx));
    }

    /// Queue a message for the writer. Best effort once the session is
    /// going down.
    pub async fn send(&self, msg: Message) {
        if self.sender.send(msg).await.is_err() {
            debug!("dropping message for closed control {}", self.run_id);
        }
    }

    /// Hand a fresh client-dialed connection to the pool.
    pub fn register_work_conn(&self, conn: WorkConn) {
        let _ = self
            .pending_pulls
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));

        match self.work_tx.try_send(conn) {
            Ok(()) => trace!("work connection pooled for run id {}", self.run_id),
            Err(_) => debug!(
                "work pool for run id {} full or closed, dropping connection",
                self.run_id
            ),
        }
    }

    /// Take one work connection, pulling a fresh one from the client when
    /// the pool runs dry. Each returned connection must be used exactly
    /// once.
    pub async fn get_work_conn(&self) -> Result<WorkConn, ControlError> {
        let mut work_rx = self.work_rx.lock().await;

        match work_rx.try_recv() {
            Ok(conn) => {
                // Replace what we just took.
                self.request_work_conn();
                return Ok(conn);
            }
            Err(mpsc::error::TryRecvError::Empty) => {}
            Err(mpsc::error::TryRecvError::Disconnected) => {
                return Err(ControlError::Closed(self.run_id.clone()));
            }
        }

        self.request_work_conn();
        match tokio::time::timeout(self.work_conn_timeout, work_rx.recv()).await {
            Ok(Some(conn)) => {
                self.request_work_conn();
                Ok(conn)
            }
            Ok(None) => Err(ControlError::Closed(self.run_id.clone())),
            Err(_) => {
                // The pull expired; allow the next arrival to issue a new one.
                let _ = self
                    .pending_pulls
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
                Err(ControlError::WorkConnTimeout)
            }
        }
    }

    /// Ask the client for one more work connection, unless enough pulls are
    /// already outstanding.
    fn request_work_conn(&self) {
        let pending = self.pending_pulls.load(Ordering::Acquire);
        if pending >= self.pool_count {
            return;
        }
        self.pending_pulls.fetch_add(1, Ordering::AcqRel);

        if self
            .sender
            .try_send(Message::ReqWorkConn(Default::default()))
            .is_err()
        {
            let _ = self
                .pending_pulls
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        }
    }

    /// Record a proxy this client now owns.
    pub fn track_proxy(&self, name: String, resources: ProxyResources) {
        self.proxies.lock().unwrap().insert(name, resources);
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies.lock().unwrap().len()
    }

    /// Ports currently held across this client's proxies, for quota checks.
    pub fn allocated_port_count(&self) -> usize {
        self.proxies
            .lock()
            .unwrap()
            .values()
            .map(|r| r.ports.len())
            .sum()
    }

    /// Begin teardown and wait until every resource is released and the
    /// registry entry is gone.
    pub async fn shutdown(&self) {
        self.closing_tx.send_replace(true);
        self.wait_closed().await;
    }

    pub async fn wait_closed(&self) {
        let mut closed = self.closed_tx.subscribe();
        if *closed.borrow() {
            return;
        }
        let _ = closed.changed().await;
    }

    fn signal_close(&self) {
        self.closing_tx.send_replace(true);
    }

    fn closing(&self) -> watch::Receiver<bool> {
        self.closing_tx.subscribe()
    }

    async fn handle_message(self: &Arc<Self>, msg: Message) {
        match msg {
            Message::NewProxy(m) => {
                let resp = match proxy::register_proxy(&self.ctx, self, &m).await {
                    Ok(resources) => {
                        info!(
                            "run id {} registered {} proxy {}",
                            self.run_id, m.proxy_type, m.proxy_name
                        );
                        let remote_addr = resources.remote_addr.clone();
                        self.track_proxy(m.proxy_name.clone(), resources);
                        NewProxyResp {
                            proxy_name: m.proxy_name,
                            remote_addr,
                            error: String::new(),
                        }
                    }
                    Err(e) => {
                        warn!(
                            "run id {} failed to register proxy {}: {}",
                            self.run_id, m.proxy_name, e
                        );
                        NewProxyResp {
                            proxy_name: m.proxy_name,
                            remote_addr: String::new(),
                            error: e.to_string(),
                        }
                    }
                };
                self.send(Message::NewProxyResp(resp)).await;
            }
            Message::CloseProxy(m) => {
                let removed = self.proxies.lock().unwrap().remove(&m.proxy_name);
                if let Some(resources) = removed {
                    proxy::unregister_proxy(&self.ctx, &m.proxy_name, &resources);
                    info!("run id {} closed proxy {}", self.run_id, m.proxy_name);
                }
            }
            Message::Ping(_) => {
                *self.last_ping.lock().unwrap() = Instant::now();
                self.send(Message::Pong(Pong {})).await;
            }
            other => {
                warn!(
                    "unexpected {} message on control channel for run id {}",
                    other.name(),
                    self.run_id
                );
            }
        }
    }

    /// Release everything this control owns. Runs exactly once, from the
    /// supervisor.
    async fn cleanup(&self) {
        {
            let mut work_rx = self.work_rx.lock().await;
            work_rx.close();
            while work_rx.try_recv().is_ok() {
                // Queued work connections are dropped, which closes them.
            }
        }

        let resources: Vec<(String, ProxyResources)> =
            self.proxies.lock().unwrap().drain().collect();
        for (name, res) in &resources {
            proxy::unregister_proxy(&self.ctx, name, res);
        }
        if !resources.is_empty() {
            debug!(
                "released {} proxies for run id {}",
                resources.len(),
                self.run_id
            );
        }
    }
}

async fn reader_loop(
    ctl: Arc<Control>,
    mut reader: ReadHalf<WorkConn>,
    msg_tx: mpsc::Sender<Message>,
) {
    let mut closing = ctl.closing();
    if *closing.borrow() {
        return;
    }
    loop {
        tokio::select! {
            res = codec::read_message(&mut reader) => match res {
                Ok(msg) => {
                    if msg_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("control read for run id {} ended: {}", ctl.run_id(), e);
                    break;
                }
            },
            _ = closing.changed() => break,
        }
    }
    ctl.signal_close();
}

async fn writer_loop(ctl: Arc<Control>, mut writer: tokio::io::WriteHalf<WorkConn>) {
    let mut send_rx = ctl
        .send_rx
        .lock()
        .unwrap()
        .take()
        .expect("writer started twice");
    let mut closing = ctl.closing();
    if *closing.borrow() {
        return;
    }

    loop {
        tokio::select! {
            msg = send_rx.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = codec::write_message(&mut writer, &msg).await {
                        debug!("control write for run id {} failed: {}", ctl.run_id(), e);
                        break;
                    }
                }
                None => break,
            },
            _ = closing.changed() => break,
        }
    }
    ctl.signal_close();
}

async fn manager_loop(ctl: Arc<Control>, mut msg_rx: mpsc::Receiver<Message>) {
    let mut closing = ctl.closing();
    if *closing.borrow() {
        return;
    }
    let check_every = (ctl.heartbeat_timeout / 10).max(Duration::from_millis(100));
    let mut heartbeat_check = tokio::time::interval(check_every);
    heartbeat_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = msg_rx.recv() => match msg {
                Some(msg) => ctl.handle_message(msg).await,
                None => break,
            },
            _ = heartbeat_check.tick() => {
                let silent_for = ctl.last_ping.lock().unwrap().elapsed();
                if silent_for > ctl.heartbeat_timeout {
                    warn!(
                        "heartbeat for run id {} expired after {:?}",
                        ctl.run_id(), silent_for
                    );
                    break;
                }
            }
            _ = closing.changed() => break,
        }
    }
    ctl.signal_close();
}

/// Waits for the close signal, then runs the release path exactly once and
/// marks the control fully closed.
async fn supervise(ctl: Arc<Control>) {
    let mut closing = ctl.closing();
    if !*closing.borrow() {
        let _ = closing.changed().await;
    }

    ctl.cleanup().await;
    // Drop the registry entry only if it is still ours; a takeover may have
    // already replaced it.
    ctl.ctx.ctl_registry.del(&ctl.run_id, &ctl);
    ctl.closed_tx.send_replace(true);
    info!("control for run id {} shut down", ctl.run_id());
}
