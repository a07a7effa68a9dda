//! Protocol normalizer
//!
//! Turns a raw descriptor line into a validated [`NormalizedEndpoint`] with a
//! canonical serialization. Each URI scheme is served by a handler
//! registered in a [`HandlerRegistry`]; handlers share the
//! [`ProtocolHandler`] interface (parse, validate, extract, canonicalize).
//!
//! Canonical forms are themselves valid descriptors, so normalizing a
//! canonical string reproduces the same endpoint.

mod encoding;
mod shadowsocks;
mod uri;
mod vmess;

pub(crate) use encoding::decode_base64_text;
pub use shadowsocks::{ShadowsocksHandler, ShadowsocksRHandler};
pub use uri::UriHandler;
pub use vmess::VmessHandler;

use crate::{ParseError, ParseResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Descriptor prefixes accepted by the pipeline (matched case-insensitively)
pub const KNOWN_PREFIXES: &[&str] = &[
    "vmess://",
    "vless://",
    "reality://",
    "ss://",
    "ssr://",
    "trojan://",
    "hy2://",
    "hysteria://",
    "hysteria2://",
    "tuic://",
    "shadowtls://",
    "wireguard://",
    "socks://",
    "socks4://",
    "socks5://",
    "http://",
    "https://",
    "grpc://",
    "ws://",
    "wss://",
    "tcp://",
    "kcp://",
    "quic://",
    "h2://",
];

/// Protocol family of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vmess,
    Vless,
    Reality,
    Shadowsocks,
    ShadowsocksR,
    Trojan,
    Hysteria,
    Hysteria2,
    Tuic,
    ShadowTls,
    WireGuard,
    Socks,
    Http,
    Grpc,
    #[serde(rename = "ws")]
    WebSocket,
    Tcp,
    Kcp,
    Quic,
    H2,
}

impl Protocol {
    pub const ALL: [Protocol; 19] = [
        Self::Vmess,
        Self::Vless,
        Self::Reality,
        Self::Shadowsocks,
        Self::ShadowsocksR,
        Self::Trojan,
        Self::Hysteria,
        Self::Hysteria2,
        Self::Tuic,
        Self::ShadowTls,
        Self::WireGuard,
        Self::Socks,
        Self::Http,
        Self::Grpc,
        Self::WebSocket,
        Self::Tcp,
        Self::Kcp,
        Self::Quic,
        Self::H2,
    ];

    /// Stable lowercase tag, as used in configuration filters
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Vmess => "vmess",
            Self::Vless => "vless",
            Self::Reality => "reality",
            Self::Shadowsocks => "shadowsocks",
            Self::ShadowsocksR => "shadowsocksr",
            Self::Trojan => "trojan",
            Self::Hysteria => "hysteria",
            Self::Hysteria2 => "hysteria2",
            Self::Tuic => "tuic",
            Self::ShadowTls => "shadowtls",
            Self::WireGuard => "wireguard",
            Self::Socks => "socks",
            Self::Http => "http",
            Self::Grpc => "grpc",
            Self::WebSocket => "ws",
            Self::Tcp => "tcp",
            Self::Kcp => "kcp",
            Self::Quic => "quic",
            Self::H2 => "h2",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        let tag = tag.trim().to_ascii_lowercase();
        Self::ALL.iter().copied().find(|p| p.tag() == tag)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Security and transport attributes relevant to ranking
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecurityFlags {
    pub tls: bool,
    pub reality: bool,
    pub ws: bool,
    pub grpc: bool,
}

/// Structured, not yet validated view of a descriptor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedDescriptor {
    /// Lowercase scheme as written (`hy2`, `socks5`, ...)
    pub scheme: String,
    pub host: Option<String>,
    pub port: Option<i64>,
    /// Secret or uuid identifying the account on the server
    pub identity: Option<String>,
    /// Userinfo exactly as rendered in the canonical URI
    pub userinfo: Option<String>,
    pub path: Option<String>,
    /// Query parameters, sorted by key
    pub params: BTreeMap<String, String>,
    /// Structured body fields (decoded JSON or positional fields)
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl ParsedDescriptor {
    pub fn new(scheme: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            ..Self::default()
        }
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }

    pub fn param_lower(&self, key: &str) -> Option<String> {
        self.params.get(key).map(|v| v.to_ascii_lowercase())
    }
}

/// Canonical parsed endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedEndpoint {
    pub protocol: Protocol,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub identity: Option<String>,
    pub security: SecurityFlags,
    pub params: BTreeMap<String, String>,
    /// Canonical descriptor string
    pub canonical: String,
}

impl NormalizedEndpoint {
    /// `host:port`, with IPv6 hosts bracketed
    pub fn address(&self) -> String {
        format!("{}:{}", render_host(&self.host), self.port)
    }

    /// Canonical descriptor, parseable by [`normalize`]
    pub fn to_uri(&self) -> &str {
        &self.canonical
    }
}

/// Common interface of every scheme handler
pub trait ProtocolHandler: Send + Sync {
    /// Protocol family produced by this handler
    fn protocol(&self) -> Protocol;

    /// Parses the raw descriptor into a structured map
    fn parse(&self, scheme: &str, raw: &str) -> ParseResult<ParsedDescriptor>;

    /// Whether a descriptor without an identity is rejected
    fn requires_identity(&self) -> bool {
        false
    }

    /// Checks host, port range, and identity
    fn validate(&self, parsed: &ParsedDescriptor) -> ParseResult<()> {
        validate_common(parsed, self.requires_identity())
    }

    fn security_flags(&self, parsed: &ParsedDescriptor) -> SecurityFlags;

    fn to_canonical_uri(&self, parsed: &ParsedDescriptor) -> String;

    /// Builds the endpoint record from a validated descriptor
    fn extract_endpoint(&self, parsed: ParsedDescriptor) -> ParseResult<NormalizedEndpoint> {
        let host = parsed
            .host
            .clone()
            .ok_or_else(|| ParseError::missing(&parsed.scheme, "host"))?;
        let port = parsed
            .port
            .ok_or_else(|| ParseError::missing(&parsed.scheme, "port"))?;
        let port = u16::try_from(port).map_err(|_| ParseError::InvalidPort {
            scheme: parsed.scheme.clone(),
            port,
        })?;

        Ok(NormalizedEndpoint {
            protocol: self.protocol(),
            security: self.security_flags(&parsed),
            canonical: self.to_canonical_uri(&parsed),
            scheme: parsed.scheme,
            host,
            port,
            identity: parsed.identity,
            params: parsed.params,
        })
    }
}

fn validate_common(parsed: &ParsedDescriptor, identity_required: bool) -> ParseResult<()> {
    match parsed.host.as_deref() {
        Some(host) if !host.trim().is_empty() => {}
        _ => return Err(ParseError::missing(&parsed.scheme, "host")),
    }

    let port = parsed
        .port
        .ok_or_else(|| ParseError::missing(&parsed.scheme, "port"))?;
    if !(1..=65535).contains(&port) {
        return Err(ParseError::InvalidPort {
            scheme: parsed.scheme.clone(),
            port,
        });
    }

    if identity_required && parsed.identity.as_deref().map_or(true, str::is_empty) {
        return Err(ParseError::missing(&parsed.scheme, "identity"));
    }

    Ok(())
}

/// Scheme table mapping each prefix to its handler
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ProtocolHandler>>,
}

impl HandlerRegistry {
    /// Creates a registry with no handlers
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers `handler` for `scheme` (without `://`), replacing any previous one
    pub fn register(&mut self, scheme: &str, handler: Arc<dyn ProtocolHandler>) {
        self.handlers.insert(scheme.to_ascii_lowercase(), handler);
    }

    pub fn handler_for(&self, scheme: &str) -> Option<&dyn ProtocolHandler> {
        self.handlers
            .get(&scheme.to_ascii_lowercase())
            .map(|h| h.as_ref())
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Parses, validates, and canonicalizes one descriptor
    ///
    /// # Arguments
    ///
    /// * `raw` - A single descriptor line such as `trojan://secret@host:443`
    ///
    /// # Returns
    ///
    /// * `Ok(NormalizedEndpoint)` - The validated endpoint
    /// * `Err(ParseError)` - The descriptor is malformed or its scheme is unknown
    pub fn normalize(&self, raw: &str) -> ParseResult<NormalizedEndpoint> {
        let raw = raw.trim();
        let (scheme, _) = raw
            .split_once("://")
            .ok_or_else(|| ParseError::UnsupportedScheme(raw.chars().take(16).collect()))?;
        let scheme = scheme.to_ascii_lowercase();

        let handler = self
            .handler_for(&scheme)
            .ok_or_else(|| ParseError::UnsupportedScheme(scheme.clone()))?;

        let parsed = handler.parse(&scheme, raw)?;
        handler.validate(&parsed)?;
        handler.extract_endpoint(parsed)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();

        registry.register("vmess", Arc::new(VmessHandler));
        registry.register("ss", Arc::new(ShadowsocksHandler));
        registry.register("ssr", Arc::new(ShadowsocksRHandler));

        let uri_schemes: &[(&str, Protocol)] = &[
            ("vless", Protocol::Vless),
            ("reality", Protocol::Reality),
            ("trojan", Protocol::Trojan),
            ("hysteria", Protocol::Hysteria),
            ("hysteria2", Protocol::Hysteria2),
            ("hy2", Protocol::Hysteria2),
            ("tuic", Protocol::Tuic),
            ("shadowtls", Protocol::ShadowTls),
            ("wireguard", Protocol::WireGuard),
            ("socks", Protocol::Socks),
            ("socks4", Protocol::Socks),
            ("socks5", Protocol::Socks),
            ("http", Protocol::Http),
            ("https", Protocol::Http),
            ("grpc", Protocol::Grpc),
            ("ws", Protocol::WebSocket),
            ("wss", Protocol::WebSocket),
            ("tcp", Protocol::Tcp),
            ("kcp", Protocol::Kcp),
            ("quic", Protocol::Quic),
            ("h2", Protocol::H2),
        ];
        for (scheme, protocol) in uri_schemes {
            registry.register(scheme, Arc::new(UriHandler::new(*protocol)));
        }

        registry
    }
}

/// Normalizes a descriptor with the default handler table
pub fn normalize(raw: &str) -> ParseResult<NormalizedEndpoint> {
    static REGISTRY: OnceLock<HandlerRegistry> = OnceLock::new();
    REGISTRY.get_or_init(HandlerRegistry::default).normalize(raw)
}

/// Checks whether a line starts with one of [`KNOWN_PREFIXES`]
pub fn has_known_prefix(line: &str) -> bool {
    KNOWN_PREFIXES.iter().any(|prefix| {
        line.get(..prefix.len())
            .map_or(false, |head| head.eq_ignore_ascii_case(prefix))
    })
}

/// Counts descriptor scheme occurrences anywhere in `text`
///
/// Only whole scheme tokens count, so `wss://` is not also counted as `ss://`.
pub fn count_scheme_occurrences(text: &str) -> usize {
    let bytes = text.as_bytes();
    let mut count = 0;
    let mut search_from = 0;

    while let Some(offset) = text[search_from..].find("://") {
        let sep = search_from + offset;
        let start = bytes[..sep]
            .iter()
            .rposition(|b| !b.is_ascii_alphanumeric())
            .map_or(0, |i| i + 1);
        let token = &text[start..sep];
        if !token.is_empty()
            && KNOWN_PREFIXES
                .iter()
                .any(|p| p[..p.len() - 3].eq_ignore_ascii_case(token))
        {
            count += 1;
        }
        search_from = sep + 3;
    }

    count
}

/// Renders a host for use in an authority, bracketing IPv6 literals
pub fn render_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}
