//! End-to-end tests driving the service over loopback TCP with a scripted
//! client speaking the real wire format.

use passage_proto::msg::*;
use passage_proto::{privilege_key, read_message, version, write_message};
use passage_server::{ServerConfig, ServerContext, Service};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const TOKEN: &str = "s";

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

async fn start_server(
    mutate: impl FnOnce(&mut ServerConfig),
) -> (SocketAddr, Arc<ServerContext>) {
    let mut cfg = ServerConfig {
        bind_addr: "127.0.0.1".to_string(),
        bind_port: 0,
        proxy_bind_addr: "127.0.0.1".to_string(),
        token: TOKEN.to_string(),
        auth_timeout: 900,
        tcp_mux: false,
        user_conn_timeout: 1,
        ..Default::default()
    };
    mutate(&mut cfg);

    let service = Service::bind(cfg).await.unwrap();
    let addr = service.control_addr();
    let ctx = service.context();
    tokio::spawn(service.run());
    (addr, ctx)
}

fn login_msg(run_id: &str, pool_count: usize) -> Message {
    let now = unix_now();
    Message::Login(Login {
        version: version::full().to_string(),
        hostname: "test-host".to_string(),
        os: "linux".to_string(),
        arch: "x86_64".to_string(),
        user: String::new(),
        privilege_key: privilege_key(TOKEN, now),
        timestamp: now,
        run_id: run_id.to_string(),
        pool_count,
        metas: Default::default(),
    })
}

async fn login(addr: SocketAddr, run_id: &str) -> (TcpStream, String) {
    let mut conn = TcpStream::connect(addr).await.unwrap();
    write_message(&mut conn, &login_msg(run_id, 1)).await.unwrap();
    match read_message(&mut conn).await.unwrap() {
        Message::LoginResp(resp) => {
            assert!(resp.error.is_empty(), "login failed: {}", resp.error);
            (conn, resp.run_id)
        }
        other => panic!("expected LoginResp, got {}", other.name()),
    }
}

async fn register_proxy(conn: &mut TcpStream, msg: NewProxy) -> NewProxyResp {
    write_message(conn, &Message::NewProxy(msg)).await.unwrap();
    loop {
        match read_message(conn).await.unwrap() {
            Message::NewProxyResp(resp) => return resp,
            Message::ReqWorkConn(_) => continue,
            other => panic!("expected NewProxyResp, got {}", other.name()),
        }
    }
}

async fn offer_work_conn(addr: SocketAddr, run_id: &str) -> TcpStream {
    let mut conn = TcpStream::connect(addr).await.unwrap();
    write_message(
        &mut conn,
        &Message::NewWorkConn(NewWorkConn {
            run_id: run_id.to_string(),
        }),
    )
    .await
    .unwrap();
    conn
}

#[tokio::test]
async fn test_happy_login_assigns_run_id() {
    let (addr, ctx) = start_server(|_| {}).await;

    let (_conn, run_id) = login(addr, "").await;
    assert!(run_id.len() >= 8, "run id too short: {}", run_id);
    assert!(ctx.ctl_registry.get_by_id(&run_id).is_some());
    assert_eq!(ctx.ctl_registry.len(), 1);
}

#[tokio::test]
async fn test_auth_failure_closes_connection() {
    let (addr, ctx) = start_server(|_| {}).await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    let now = unix_now();
    write_message(
        &mut conn,
        &Message::Login(Login {
            version: version::full().to_string(),
            privilege_key: "bad".to_string(),
            timestamp: now,
            ..Default::default()
        }),
    )
    .await
    .unwrap();

    match read_message(&mut conn).await.unwrap() {
        Message::LoginResp(resp) => {
            assert_eq!(resp.error, "authorization failed");
            assert!(resp.run_id.is_empty());
        }
        other => panic!("expected LoginResp, got {}", other.name()),
    }

    // Server closes the connection after the error reply.
    let mut rest = Vec::new();
    conn.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    assert_eq!(ctx.ctl_registry.len(), 0);
}

#[tokio::test]
async fn test_stale_timestamp_is_rejected() {
    let (addr, _ctx) = start_server(|_| {}).await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    let stale = unix_now() - 10_000;
    write_message(
        &mut conn,
        &Message::Login(Login {
            version: version::full().to_string(),
            privilege_key: privilege_key(TOKEN, stale),
            timestamp: stale,
            ..Default::default()
        }),
    )
    .await
    .unwrap();

    match read_message(&mut conn).await.unwrap() {
        Message::LoginResp(resp) => assert_eq!(resp.error, "authorization timeout"),
        other => panic!("expected LoginResp, got {}", other.name()),
    }
}

#[tokio::test]
async fn test_takeover_replaces_old_control() {
    let (addr, ctx) = start_server(|cfg| cfg.allow_ports = "7000-7010".to_string()).await;

    let (mut first, _) = login(addr, "X").await;
    let resp = register_proxy(
        &mut first,
        NewProxy {
            proxy_name: "svc".to_string(),
            proxy_type: "tcp".to_string(),
            remote_port: 7000,
            ..Default::default()
        },
    )
    .await;
    assert!(resp.error.is_empty(), "{}", resp.error);
    assert_eq!(ctx.proxy_registry.len(), 1);

    // Second login with the same run id takes over. Its LoginResp is only
    // sent after the old control finished releasing everything.
    let (_second, run_id) = login(addr, "X").await;
    assert_eq!(run_id, "X");
    assert_eq!(ctx.ctl_registry.len(), 1);
    assert_eq!(ctx.proxy_registry.len(), 0);
    assert_eq!(ctx.tcp_ports.used_count(), 0);

    // The first connection is dead.
    let mut rest = Vec::new();
    first.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_port_conflict_and_reuse_after_disconnect() {
    let (addr, ctx) = start_server(|cfg| cfg.allow_ports = "7000-7001".to_string()).await;

    let (mut x, _) = login(addr, "client-x").await;
    let resp = register_proxy(
        &mut x,
        NewProxy {
            proxy_name: "x-svc".to_string(),
            proxy_type: "tcp".to_string(),
            remote_port: 7000,
            ..Default::default()
        },
    )
    .await;
    assert!(resp.error.is_empty(), "{}", resp.error);
    assert_eq!(resp.remote_addr, "127.0.0.1:7000");

    let (mut y, _) = login(addr, "client-y").await;
    let conflict = register_proxy(
        &mut y,
        NewProxy {
            proxy_name: "y-svc".to_string(),
            proxy_type: "tcp".to_string(),
            remote_port: 7000,
            ..Default::default()
        },
    )
    .await;
    assert!(conflict.error.contains("port unavailable"), "{}", conflict.error);

    let ok = register_proxy(
        &mut y,
        NewProxy {
            proxy_name: "y-svc".to_string(),
            proxy_type: "tcp".to_string(),
            remote_port: 7001,
            ..Default::default()
        },
    )
    .await;
    assert!(ok.error.is_empty(), "{}", ok.error);

    // X goes away; once its teardown finishes, 7000 is free again.
    drop(x);
    let mut freed = false;
    for _ in 0..50 {
        if ctx.tcp_ports.used_count() == 1 {
            freed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(freed, "port 7000 was not released after disconnect");

    let reuse = register_proxy(
        &mut y,
        NewProxy {
            proxy_name: "y-svc2".to_string(),
            proxy_type: "tcp".to_string(),
            remote_port: 7000,
            ..Default::default()
        },
    )
    .await;
    assert!(reuse.error.is_empty(), "{}", reuse.error);
}

#[tokio::test]
async fn test_duplicate_proxy_name_is_rejected() {
    let (addr, _ctx) = start_server(|cfg| cfg.allow_ports = "7000-7010".to_string()).await;

    let (mut a, _) = login(addr, "a").await;
    let ok = register_proxy(
        &mut a,
        NewProxy {
            proxy_name: "svc".to_string(),
            proxy_type: "tcp".to_string(),
            ..Default::default()
        },
    )
    .await;
    assert!(ok.error.is_empty(), "{}", ok.error);

    let (mut b, _) = login(addr, "b").await;
    let dup = register_proxy(
        &mut b,
        NewProxy {
            proxy_name: "svc".to_string(),
            proxy_type: "tcp".to_string(),
            ..Default::default()
        },
    )
    .await;
    assert!(dup.error.contains("already in use"), "{}", dup.error);
}

#[tokio::test]
async fn test_work_conn_timeout_and_fresh_pull() {
    let (addr, ctx) = start_server(|cfg| cfg.allow_ports = "7000-7010".to_string()).await;

    let (mut conn, run_id) = login(addr, "").await;
    let ctl = ctx.ctl_registry.get_by_id(&run_id).unwrap();

    // External arrival with an unresponsive client: closed after the
    // work-conn timeout, and the client saw exactly one pull request.
    let err = ctl.get_work_conn().await.unwrap_err();
    assert!(err.to_string().contains("timed out"));
    match read_message(&mut conn).await.unwrap() {
        Message::ReqWorkConn(_) => {}
        other => panic!("expected ReqWorkConn, got {}", other.name()),
    }

    // The next arrival restarts the cycle with a fresh request.
    let err = ctl.get_work_conn().await.unwrap_err();
    assert!(err.to_string().contains("timed out"));
    match read_message(&mut conn).await.unwrap() {
        Message::ReqWorkConn(_) => {}
        other => panic!("expected ReqWorkConn, got {}", other.name()),
    }
}

#[tokio::test]
async fn test_work_conn_delivery_to_waiting_user() {
    let (addr, ctx) = start_server(|_| {}).await;

    let (_conn, run_id) = login(addr, "").await;
    let ctl = ctx.ctl_registry.get_by_id(&run_id).unwrap();

    let mut work_peer = offer_work_conn(addr, &run_id).await;
    // Give the dispatcher a moment to pool the connection.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut user_side = ctl.get_work_conn().await.unwrap();
    user_side.write_all(b"payload").await.unwrap();

    let mut got = [0u8; 7];
    work_peer.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"payload");
}

#[tokio::test]
async fn test_work_conn_for_unknown_run_id_is_dropped() {
    let (addr, _ctx) = start_server(|_| {}).await;

    let mut conn = offer_work_conn(addr, "no-such-client").await;
    let mut rest = Vec::new();
    conn.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_http_vhost_routing_end_to_end() {
    let http_port = 38080;
    let (addr, _ctx) = start_server(|cfg| {
        cfg.vhost_http_port = http_port;
        cfg.user_conn_timeout = 10;
    })
    .await;

    let (mut client, run_id) = login(addr, "").await;
    let resp = register_proxy(
        &mut client,
        NewProxy {
            proxy_name: "web".to_string(),
            proxy_type: "http".to_string(),
            custom_domains: vec!["a.example".to_string()],
            ..Default::default()
        },
    )
    .await;
    assert!(resp.error.is_empty(), "{}", resp.error);
    assert_eq!(resp.remote_addr, format!("http://a.example:{}", http_port));

    // Client side: answer the pull by dialing a work connection that speaks
    // a canned HTTP response.
    let control_addr = addr;
    let worker_run_id = run_id.clone();
    tokio::spawn(async move {
        let mut control = client;
        loop {
            match read_message(&mut control).await {
                Ok(Message::ReqWorkConn(_)) => {
                    let mut work = offer_work_conn(control_addr, &worker_run_id).await;
                    tokio::spawn(async move {
                        let mut req = vec![0u8; 1024];
                        let n = work.read(&mut req).await.unwrap();
                        let text = String::from_utf8_lossy(&req[..n]);
                        assert!(text.starts_with("GET /"));
                        assert!(text.contains("Host: a.example"));
                        work.write_all(
                            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
                        )
                        .await
                        .unwrap();
                    });
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    });

    let mut user = TcpStream::connect(("127.0.0.1", http_port)).await.unwrap();
    user.write_all(b"GET /index HTTP/1.1\r\nHost: a.example\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    user.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200"), "{}", text);
    assert!(text.ends_with("hello"), "{}", text);

    // Unknown host gets a 404-equivalent close.
    let mut stray = TcpStream::connect(("127.0.0.1", http_port)).await.unwrap();
    stray
        .write_all(b"GET / HTTP/1.1\r\nHost: b.example\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    stray.read_to_end(&mut response).await.unwrap();
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 404"));
}

#[tokio::test]
async fn test_shared_port_muxes_control_and_http() {
    // Control traffic and HTTP vhost traffic share one port; the sniffer
    // tells them apart.
    let shared_port = 38090;
    let (addr, _ctx) = start_server(|cfg| {
        cfg.bind_port = shared_port;
        cfg.vhost_http_port = shared_port;
        cfg.user_conn_timeout = 10;
    })
    .await;
    assert_eq!(addr.port(), shared_port);

    let (mut client, run_id) = login(addr, "").await;
    let resp = register_proxy(
        &mut client,
        NewProxy {
            proxy_name: "muxed-web".to_string(),
            proxy_type: "http".to_string(),
            custom_domains: vec!["m.example".to_string()],
            ..Default::default()
        },
    )
    .await;
    assert!(resp.error.is_empty(), "{}", resp.error);

    let control_addr = addr;
    let worker_run_id = run_id.clone();
    tokio::spawn(async move {
        let mut control = client;
        loop {
            match read_message(&mut control).await {
                Ok(Message::ReqWorkConn(_)) => {
                    let mut work = offer_work_conn(control_addr, &worker_run_id).await;
                    tokio::spawn(async move {
                        let mut req = vec![0u8; 1024];
                        let _ = work.read(&mut req).await.unwrap();
                        work.write_all(
                            b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n",
                        )
                        .await
                        .unwrap();
                    });
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    });

    let mut user = TcpStream::connect(addr).await.unwrap();
    user.write_all(b"GET / HTTP/1.1\r\nHost: m.example\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    user.read_to_end(&mut response).await.unwrap();
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 204"));
}

#[tokio::test]
async fn test_visitor_pairing_end_to_end() {
    let (addr, _ctx) = start_server(|cfg| cfg.user_conn_timeout = 10).await;

    let (mut client, run_id) = login(addr, "").await;
    let resp = register_proxy(
        &mut client,
        NewProxy {
            proxy_name: "secret-db".to_string(),
            proxy_type: "stcp".to_string(),
            sk: "tunnel-secret".to_string(),
            ..Default::default()
        },
    )
    .await;
    assert!(resp.error.is_empty(), "{}", resp.error);

    // Client side answers work-conn pulls with an echo service.
    let control_addr = addr;
    let worker_run_id = run_id.clone();
    tokio::spawn(async move {
        let mut control = client;
        loop {
            match read_message(&mut control).await {
                Ok(Message::ReqWorkConn(_)) => {
                    let mut work = offer_work_conn(control_addr, &worker_run_id).await;
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 64];
                        let n = work.read(&mut buf).await.unwrap();
                        work.write_all(&buf[..n]).await.unwrap();
                    });
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    });

    // Visitor presents the right sign key.
    let mut visitor = TcpStream::connect(addr).await.unwrap();
    let now = unix_now();
    write_message(
        &mut visitor,
        &Message::NewVisitorConn(NewVisitorConn {
            proxy_name: "secret-db".to_string(),
            sign_key: privilege_key("tunnel-secret", now),
            timestamp: now,
            use_encryption: false,
            use_compression: false,
        }),
    )
    .await
    .unwrap();

    match read_message(&mut visitor).await.unwrap() {
        Message::NewVisitorConnResp(resp) => {
            assert_eq!(resp.proxy_name, "secret-db");
            assert!(resp.error.is_empty(), "{}", resp.error);
        }
        other => panic!("expected NewVisitorConnResp, got {}", other.name()),
    }

    visitor.write_all(b"ping-through-tunnel").await.unwrap();
    let mut echoed = [0u8; 19];
    visitor.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping-through-tunnel");
}

#[tokio::test]
async fn test_visitor_with_bad_key_is_refused() {
    let (addr, _ctx) = start_server(|_| {}).await;

    let (mut client, _run_id) = login(addr, "").await;
    let resp = register_proxy(
        &mut client,
        NewProxy {
            proxy_name: "secret-db".to_string(),
            proxy_type: "stcp".to_string(),
            sk: "tunnel-secret".to_string(),
            ..Default::default()
        },
    )
    .await;
    assert!(resp.error.is_empty(), "{}", resp.error);

    let mut visitor = TcpStream::connect(addr).await.unwrap();
    write_message(
        &mut visitor,
        &Message::NewVisitorConn(NewVisitorConn {
            proxy_name: "secret-db".to_string(),
            sign_key: "wrong".to_string(),
            timestamp: unix_now(),
            use_encryption: false,
            use_compression: false,
        }),
    )
    .await
    .unwrap();

    match read_message(&mut visitor).await.unwrap() {
        Message::NewVisitorConnResp(resp) => {
            assert_eq!(resp.error, "authorization failed");
        }
        other => panic!("expected NewVisitorConnResp, got {}", other.name()),
    }
}

#[tokio::test]
async fn test_ping_pong_over_wire() {
    let (addr, _ctx) = start_server(|_| {}).await;

    let (mut conn, _) = login(addr, "").await;
    write_message(&mut conn, &Message::Ping(Ping {})).await.unwrap();
    match read_message(&mut conn).await.unwrap() {
        Message::Pong(_) => {}
        other => panic!("expected Pong, got {}", other.name()),
    }
}

#[tokio::test]
async fn test_unexpected_first_message_closes_connection() {
    let (addr, _ctx) = start_server(|_| {}).await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    write_message(&mut conn, &Message::Ping(Ping {})).await.unwrap();

    let mut rest = Vec::new();
    conn.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}
