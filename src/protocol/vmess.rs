//! Handler for base64-wrapped JSON VMess descriptors

use crate::protocol::encoding::{decode_base64, encode_base64};
use crate::protocol::{ParsedDescriptor, Protocol, ProtocolHandler, SecurityFlags};
use crate::{ParseError, ParseResult};
use serde_json::Value;
use std::collections::BTreeMap;

/// Display-only keys that never affect identity
const REMARK_KEYS: &[&str] = &["ps"];

#[derive(Debug, Clone, Copy, Default)]
pub struct VmessHandler;

impl VmessHandler {
    fn port_of(scheme: &str, value: Option<&Value>) -> ParseResult<Option<i64>> {
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .map(Some)
                .ok_or_else(|| ParseError::invalid(scheme, format!("non-integer port {}", n))),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| ParseError::invalid(scheme, format!("non-numeric port '{}'", s))),
            Some(other) => Err(ParseError::invalid(
                scheme,
                format!("unexpected port value {}", other),
            )),
        }
    }
}

impl ProtocolHandler for VmessHandler {
    fn protocol(&self) -> Protocol {
        Protocol::Vmess
    }

    fn parse(&self, scheme: &str, raw: &str) -> ParseResult<ParsedDescriptor> {
        let body = raw
            .split_once("://")
            .map(|(_, body)| body)
            .unwrap_or_default();
        let body = body.split('#').next().unwrap_or_default().trim();

        let bytes =
            decode_base64(body).ok_or_else(|| ParseError::invalid(scheme, "payload is not valid base64"))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| ParseError::invalid(scheme, "payload is not valid UTF-8"))?;
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| ParseError::invalid(scheme, format!("payload is not valid JSON: {}", e)))?;

        let Value::Object(object) = value else {
            return Err(ParseError::invalid(scheme, "payload is not a JSON object"));
        };

        let fields: BTreeMap<String, Value> = object
            .into_iter()
            .filter(|(key, _)| !REMARK_KEYS.contains(&key.as_str()))
            .collect();

        let mut parsed = ParsedDescriptor::new(scheme);
        parsed.host = fields
            .get("add")
            .and_then(Value::as_str)
            .map(|h| h.trim().trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase())
            .filter(|h| !h.is_empty());
        parsed.port = Self::port_of(scheme, fields.get("port"))?;
        parsed.identity = fields
            .get("id")
            .and_then(Value::as_str)
            .map(|id| id.trim().to_ascii_lowercase())
            .filter(|id| !id.is_empty());
        parsed.fields = fields;

        Ok(parsed)
    }

    fn security_flags(&self, parsed: &ParsedDescriptor) -> SecurityFlags {
        let tls = parsed.field_str("tls").unwrap_or_default().to_ascii_lowercase();
        let security = parsed
            .field_str("security")
            .unwrap_or_default()
            .to_ascii_lowercase();
        let net = parsed.field_str("net").unwrap_or_default().to_ascii_lowercase();

        SecurityFlags {
            tls: tls == "tls" || security == "tls",
            reality: tls == "reality" || security == "reality",
            ws: net == "ws",
            grpc: net == "grpc",
        }
    }

    /// Re-serializes the JSON body with sorted keys, then re-encodes it
    fn to_canonical_uri(&self, parsed: &ParsedDescriptor) -> String {
        let json = serde_json::to_string(&parsed.fields).unwrap_or_default();
        format!("{}://{}", parsed.scheme, encode_base64(json.as_bytes()))
    }
}
