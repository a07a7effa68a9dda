//! Handler for URI-shaped descriptors
//!
//! Covers every scheme whose descriptor is an ordinary URI with
//! `userinfo@host:port/path?query#remark`: vless, reality, trojan,
//! hysteria, tuic, wireguard, socks, http and the bare transport forms.

use crate::protocol::encoding::{parse_query, with_query};
use crate::protocol::{render_host, ParsedDescriptor, Protocol, ProtocolHandler, SecurityFlags};
use crate::{ParseError, ParseResult};
use url::{Host, Url};

/// URI-style descriptor handler for one protocol family
#[derive(Debug, Clone, Copy)]
pub struct UriHandler {
    protocol: Protocol,
}

impl UriHandler {
    pub fn new(protocol: Protocol) -> Self {
        Self { protocol }
    }

    /// Families whose username is a UUID; UUIDs compare case-insensitively
    fn uuid_username(&self) -> bool {
        matches!(
            self.protocol,
            Protocol::Vless | Protocol::Reality | Protocol::Tuic
        )
    }

    /// QUIC-based and TLS-wrapped families always run over TLS
    fn implies_tls(&self) -> bool {
        matches!(
            self.protocol,
            Protocol::Trojan
                | Protocol::Hysteria
                | Protocol::Hysteria2
                | Protocol::Tuic
                | Protocol::ShadowTls
                | Protocol::Quic
        )
    }
}

impl ProtocolHandler for UriHandler {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn parse(&self, scheme: &str, raw: &str) -> ParseResult<ParsedDescriptor> {
        let url = Url::parse(raw).map_err(|e| ParseError::invalid(scheme, e.to_string()))?;

        let mut parsed = ParsedDescriptor::new(scheme);

        parsed.host = match url.host() {
            Some(Host::Ipv6(addr)) => Some(addr.to_string()),
            Some(Host::Ipv4(addr)) => Some(addr.to_string()),
            Some(Host::Domain(domain)) => Some(domain.to_ascii_lowercase()),
            None => None,
        };
        parsed.port = url.port_or_known_default().map(i64::from);

        let username = if self.uuid_username() {
            url.username().to_ascii_lowercase()
        } else {
            url.username().to_string()
        };
        parsed.userinfo = match (username.is_empty(), url.password()) {
            (true, None) => None,
            (_, Some(password)) => Some(format!("{}:{}", username, password)),
            (false, None) => Some(username),
        };
        parsed.identity = parsed.userinfo.clone();

        parsed.path = match url.path() {
            "" | "/" => None,
            path => Some(path.to_string()),
        };
        parsed.params = url.query().map(parse_query).unwrap_or_default();

        Ok(parsed)
    }

    fn requires_identity(&self) -> bool {
        matches!(
            self.protocol,
            Protocol::Vless | Protocol::Reality | Protocol::Trojan | Protocol::Tuic
        )
    }

    fn security_flags(&self, parsed: &ParsedDescriptor) -> SecurityFlags {
        let security = parsed.param_lower("security").unwrap_or_default();
        let transport = parsed
            .param_lower("type")
            .or_else(|| parsed.param_lower("net"))
            .unwrap_or_default();
        let tls_param = parsed.param_lower("tls").unwrap_or_default();
        let scheme = parsed.scheme.as_str();

        let explicit_none = security == "none";
        let tls = matches!(security.as_str(), "tls" | "xtls")
            || matches!(tls_param.as_str(), "1" | "true" | "tls")
            || matches!(scheme, "https" | "wss" | "h2")
            || (self.implies_tls() && !explicit_none);

        SecurityFlags {
            tls,
            reality: security == "reality"
                || self.protocol == Protocol::Reality
                || parsed.params.contains_key("pbk"),
            ws: transport == "ws" || matches!(scheme, "ws" | "wss"),
            grpc: transport == "grpc" || scheme == "grpc",
        }
    }

    fn to_canonical_uri(&self, parsed: &ParsedDescriptor) -> String {
        let mut uri = format!("{}://", parsed.scheme);
        if let Some(userinfo) = &parsed.userinfo {
            uri.push_str(userinfo);
            uri.push('@');
        }
        uri.push_str(&render_host(parsed.host.as_deref().unwrap_or_default()));
        if let Some(port) = parsed.port {
            uri.push_str(&format!(":{}", port));
        }
        if let Some(path) = &parsed.path {
            uri.push_str(path);
        }
        with_query(uri, &parsed.params)
    }
}
