//! First-bytes protocol detection for the shared listening port.

/// Maximum number of bytes a matcher may need to decide.
pub const SNIFF_LEN: usize = 8;

/// TLS ClientHello: handshake record, TLS major version 3, minor 0..=4.
pub fn is_tls_client_hello(buf: &[u8]) -> bool {
    buf.len() >= 3 && buf[0] == 0x16 && buf[1] == 0x03 && buf[2] <= 0x04
}

const HTTP_METHODS: [&str; 9] = [
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "CONNECT", "TRACE", "PATCH",
];

/// Plain HTTP request: a known method token followed by a space.
pub fn is_http_request(buf: &[u8]) -> bool {
    HTTP_METHODS.iter().any(|m| {
        buf.len() > m.len() && buf.starts_with(m.as_bytes()) && buf[m.len()] == b' '
    })
}
