//! Base64 and query-string helpers shared by the scheme handlers

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD, URL_SAFE_NO_PAD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::collections::BTreeMap;
use url::form_urlencoded;

/// Characters escaped when an opaque token is written into URI userinfo
const USERINFO: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b':')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

const LENIENT: GeneralPurposeConfig = GeneralPurposeConfig::new()
    .with_decode_padding_mode(DecodePaddingMode::Indifferent)
    .with_decode_allow_trailing_bits(true);

const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);

/// Decodes standard or URL-safe base64, padded or not, ignoring whitespace
///
/// Subscription feeds mix both alphabets and frequently drop padding.
pub(crate) fn decode_base64(input: &str) -> Option<Vec<u8>> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }

    if compact.contains(['-', '_']) {
        URL_SAFE_LENIENT.decode(&compact).ok()
    } else {
        STANDARD_LENIENT.decode(&compact).ok()
    }
}

/// Decodes base64 into UTF-8 text
pub(crate) fn decode_base64_text(input: &str) -> Option<String> {
    decode_base64(input).and_then(|bytes| String::from_utf8(bytes).ok())
}

pub(crate) fn encode_base64(input: &[u8]) -> String {
    STANDARD.encode(input)
}

pub(crate) fn encode_base64_url(input: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(input)
}

/// Undoes `%XX` escapes; `+` is left alone since base64 userinfo uses it
pub(crate) fn percent_decode_text(input: &str) -> String {
    percent_decode_str(input).decode_utf8_lossy().into_owned()
}

/// Escapes a token for use as URI userinfo
pub(crate) fn encode_userinfo(input: &str) -> String {
    utf8_percent_encode(input, USERINFO).to_string()
}

/// Parses a query string into a key-sorted map; later duplicates win
pub(crate) fn parse_query(query: &str) -> BTreeMap<String, String> {
    form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

/// Renders sorted parameters as `k=v&...`, empty when there are none
pub(crate) fn render_query(params: &BTreeMap<String, String>) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

/// Appends `?query` when there are parameters
pub(crate) fn with_query(base: String, params: &BTreeMap<String, String>) -> String {
    if params.is_empty() {
        base
    } else {
        format!("{}?{}", base, render_query(params))
    }
}
