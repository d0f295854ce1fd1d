//! Control-channel message set.
//!
//! The serialized field names are the wire contract shared with clients;
//! renaming a field is a protocol break.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Client login handshake, the first message on every control connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Login {
    pub version: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub user: String,
    pub privilege_key: String,
    pub timestamp: i64,
    pub run_id: String,
    pub pool_count: usize,
    #[serde(default)]
    pub metas: HashMap<String, String>,
}

/// Server reply to [`Login`]. Success iff `error` is empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoginResp {
    pub version: String,
    pub run_id: String,
    pub error: String,
}

/// Client request to register a named tunnel.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewProxy {
    pub proxy_name: String,
    pub proxy_type: String,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,

    // tcp, udp
    #[serde(default)]
    pub remote_port: u16,

    // http, https
    #[serde(default)]
    pub custom_domains: Vec<String>,
    #[serde(default)]
    pub subdomain: String,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub host_header_rewrite: String,
    #[serde(default)]
    pub http_user: String,
    #[serde(default)]
    pub http_pwd: String,

    // stcp, xtcp
    #[serde(default)]
    pub sk: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewProxyResp {
    pub proxy_name: String,
    pub remote_addr: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CloseProxy {
    pub proxy_name: String,
}

/// Sent by the client on a fresh connection to offer it as a work connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewWorkConn {
    pub run_id: String,
}

/// Server asks the client to dial out one more work connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReqWorkConn {}

/// A visitor dials a secret tunnel by name, proving knowledge of its key.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewVisitorConn {
    pub proxy_name: String,
    pub sign_key: String,
    pub timestamp: i64,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewVisitorConnResp {
    pub proxy_name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Ping {}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Pong {}

/// UDP payload relayed through a work connection, base64-encoded.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UdpPacket {
    #[serde(rename = "c")]
    pub content: String,
    #[serde(rename = "l")]
    pub local_addr: String,
    #[serde(rename = "r")]
    pub remote_addr: String,
}

/// Every message kind that can appear on the control port.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Login(Login),
    LoginResp(LoginResp),
    NewProxy(NewProxy),
    NewProxyResp(NewProxyResp),
    CloseProxy(CloseProxy),
    NewWorkConn(NewWorkConn),
    ReqWorkConn(ReqWorkConn),
    NewVisitorConn(NewVisitorConn),
    NewVisitorConnResp(NewVisitorConnResp),
    Ping(Ping),
    Pong(Pong),
    UdpPacket(UdpPacket),
}

impl Message {
    /// Single-byte wire tag. Stable across releases.
    pub fn type_byte(&self) -> u8 {
        match self {
            Message::Login(_) => b'o',
            Message::LoginResp(_) => b'1',
            Message::NewProxy(_) => b'p',
            Message::NewProxyResp(_) => b'2',
            Message::CloseProxy(_) => b'c',
            Message::NewWorkConn(_) => b'w',
            Message::ReqWorkConn(_) => b'r',
            Message::NewVisitorConn(_) => b'v',
            Message::NewVisitorConnResp(_) => b'3',
            Message::Ping(_) => b'h',
            Message::Pong(_) => b'4',
            Message::UdpPacket(_) => b'u',
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Login(_) => "Login",
            Message::LoginResp(_) => "LoginResp",
            Message::NewProxy(_) => "NewProxy",
            Message::NewProxyResp(_) => "NewProxyResp",
            Message::CloseProxy(_) => "CloseProxy",
            Message::NewWorkConn(_) => "NewWorkConn",
            Message::ReqWorkConn(_) => "ReqWorkConn",
            Message::NewVisitorConn(_) => "NewVisitorConn",
            Message::NewVisitorConnResp(_) => "NewVisitorConnResp",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
            Message::UdpPacket(_) => "UdpPacket",
        }
    }
}
