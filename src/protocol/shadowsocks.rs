//! Handlers for the Shadowsocks family
//!
//! `ss://` accepts both SIP002 (`ss://userinfo@host:port?plugin=..#tag`) and
//! the legacy fully-encoded form (`ss://BASE64(method:password@host:port)`).
//! `ssr://` is always a single URL-safe base64 blob.

use crate::protocol::encoding::{
    decode_base64_text, encode_base64_url, encode_userinfo, parse_query, percent_decode_text,
    with_query,
};
use crate::protocol::{render_host, ParsedDescriptor, Protocol, ProtocolHandler, SecurityFlags};
use crate::{ParseError, ParseResult};
use serde_json::Value;
use std::collections::BTreeMap;

/// SSR query keys that only carry display text
const SSR_REMARK_KEYS: &[&str] = &["remarks", "group"];

/// Splits `host:port`, honoring bracketed IPv6 literals
fn split_host_port(scheme: &str, input: &str) -> ParseResult<(String, i64)> {
    let (host, port) = if let Some(rest) = input.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ParseError::invalid(scheme, "unterminated IPv6 literal"))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| ParseError::missing(scheme, "port"))?;
        (host, port)
    } else {
        input
            .rsplit_once(':')
            .ok_or_else(|| ParseError::missing(scheme, "port"))?
    };

    let port = port
        .trim()
        .parse::<i64>()
        .map_err(|_| ParseError::invalid(scheme, format!("non-numeric port '{}'", port)))?;

    Ok((host.trim().to_ascii_lowercase(), port))
}

/// Strips the `scheme://` prefix and any `#remark`
fn body_of(raw: &str) -> &str {
    let body = raw.split_once("://").map(|(_, b)| b).unwrap_or_default();
    body.split('#').next().unwrap_or_default().trim()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ShadowsocksHandler;

impl ShadowsocksHandler {
    /// Interprets SIP002 userinfo: base64 `method:password`, plain
    /// `method:password`, or an opaque token kept verbatim
    fn apply_userinfo(parsed: &mut ParsedDescriptor, userinfo: &str) {
        let decoded = if userinfo.contains(':') {
            None
        } else {
            decode_base64_text(userinfo).filter(|text| text.contains(':'))
        };

        let credentials = decoded.as_deref().or_else(|| userinfo.contains(':').then_some(userinfo));

        match credentials.and_then(|c| c.split_once(':')) {
            Some((method, password)) => {
                parsed
                    .fields
                    .insert("method".to_string(), Value::String(method.to_string()));
                parsed
                    .fields
                    .insert("password".to_string(), Value::String(password.to_string()));
                parsed.identity = Some(password.to_string()).filter(|p| !p.is_empty());
                parsed.userinfo = Some(encode_base64_url(format!("{}:{}", method, password).as_bytes()));
            }
            None => {
                parsed.identity = Some(userinfo.to_string()).filter(|u| !u.is_empty());
                parsed.userinfo = parsed.identity.as_deref().map(encode_userinfo);
            }
        }
    }
}

impl ProtocolHandler for ShadowsocksHandler {
    fn protocol(&self) -> Protocol {
        Protocol::Shadowsocks
    }

    fn parse(&self, scheme: &str, raw: &str) -> ParseResult<ParsedDescriptor> {
        let body = body_of(raw);
        let (main, query) = body.split_once('?').unwrap_or((body, ""));
        let main = main.trim_end_matches('/');

        let mut parsed = ParsedDescriptor::new(scheme);

        let (userinfo, host_port) = match main.rsplit_once('@') {
            // SIP002 userinfo may be percent-encoded, e.g. `%3D` padding
            Some((userinfo, host_port)) => (percent_decode_text(userinfo), host_port.to_string()),
            None => {
                let decoded = decode_base64_text(main).ok_or_else(|| {
                    ParseError::invalid(scheme, "legacy payload is not valid base64 text")
                })?;
                let (userinfo, host_port) = decoded.rsplit_once('@').ok_or_else(|| {
                    ParseError::invalid(scheme, "legacy payload has no '@' separator")
                })?;
                (userinfo.to_string(), host_port.to_string())
            }
        };

        let (host, port) = split_host_port(scheme, host_port.trim_end_matches('/'))?;
        parsed.host = Some(host).filter(|h| !h.is_empty());
        parsed.port = Some(port);
        Self::apply_userinfo(&mut parsed, &userinfo);
        parsed.params = parse_query(query);

        Ok(parsed)
    }

    fn requires_identity(&self) -> bool {
        true
    }

    fn security_flags(&self, parsed: &ParsedDescriptor) -> SecurityFlags {
        let plugin = parsed.param_lower("plugin").unwrap_or_default();
        SecurityFlags {
            tls: plugin.contains("tls"),
            reality: false,
            ws: plugin.contains("websocket") || plugin.contains("v2ray"),
            grpc: plugin.contains("grpc"),
        }
    }

    fn to_canonical_uri(&self, parsed: &ParsedDescriptor) -> String {
        let base = format!(
            "{}://{}@{}:{}",
            parsed.scheme,
            parsed.userinfo.as_deref().unwrap_or_default(),
            render_host(parsed.host.as_deref().unwrap_or_default()),
            parsed.port.unwrap_or_default()
        );
        with_query(base, &parsed.params)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ShadowsocksRHandler;

impl ProtocolHandler for ShadowsocksRHandler {
    fn protocol(&self) -> Protocol {
        Protocol::ShadowsocksR
    }

    /// Decodes `host:port:protocol:method:obfs:base64(password)/?params`
    fn parse(&self, scheme: &str, raw: &str) -> ParseResult<ParsedDescriptor> {
        let text = decode_base64_text(body_of(raw))
            .ok_or_else(|| ParseError::invalid(scheme, "payload is not valid base64 text"))?;

        let (main, query) = text
            .split_once("/?")
            .or_else(|| text.split_once('?'))
            .unwrap_or((text.as_str(), ""));
        let main = main.trim().trim_end_matches('/');

        let parts: Vec<&str> = main.rsplitn(6, ':').collect();
        let [password_b64, obfs, method, protocol, port, host] = parts[..] else {
            return Err(ParseError::invalid(
                scheme,
                "expected host:port:protocol:method:obfs:password",
            ));
        };

        let password = decode_base64_text(password_b64)
            .ok_or_else(|| ParseError::invalid(scheme, "password is not valid base64 text"))?;
        let port = port
            .trim()
            .parse::<i64>()
            .map_err(|_| ParseError::invalid(scheme, format!("non-numeric port '{}'", port)))?;

        let mut parsed = ParsedDescriptor::new(scheme);
        let host = host.trim().trim_start_matches('[').trim_end_matches(']');
        parsed.host = Some(host.to_ascii_lowercase()).filter(|h| !h.is_empty());
        parsed.port = Some(port);
        parsed.identity = Some(password.clone()).filter(|p| !p.is_empty());

        let fields: BTreeMap<String, Value> = [
            ("protocol", protocol),
            ("method", method),
            ("obfs", obfs),
            ("password", password.as_str()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect();
        parsed.fields = fields;

        parsed.params = parse_query(query)
            .into_iter()
            .filter(|(k, _)| !SSR_REMARK_KEYS.contains(&k.as_str()))
            .collect();

        Ok(parsed)
    }

    fn requires_identity(&self) -> bool {
        true
    }

    fn security_flags(&self, parsed: &ParsedDescriptor) -> SecurityFlags {
        let obfs = parsed.field_str("obfs").unwrap_or_default();
        SecurityFlags {
            tls: obfs.starts_with("tls"),
            ..SecurityFlags::default()
        }
    }

    fn to_canonical_uri(&self, parsed: &ParsedDescriptor) -> String {
        let main = format!(
            "{}:{}:{}:{}:{}:{}",
            parsed.host.as_deref().unwrap_or_default(),
            parsed.port.unwrap_or_default(),
            parsed.field_str("protocol").unwrap_or_default(),
            parsed.field_str("method").unwrap_or_default(),
            parsed.field_str("obfs").unwrap_or_default(),
            encode_base64_url(parsed.field_str("password").unwrap_or_default().as_bytes()),
        );
        let inner = if parsed.params.is_empty() {
            main
        } else {
            with_query(format!("{}/", main), &parsed.params)
        };
        format!("{}://{}", parsed.scheme, encode_base64_url(inner.as_bytes()))
    }
}
