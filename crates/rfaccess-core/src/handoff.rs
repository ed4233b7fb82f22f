//! Launch URI handoff
//!
//! The web programmer page hands a one-time token to the app through a
//! launch URI such as
//!
//! ```text
//! rfaccess://open?username=jdoe&cardData=tok_8f2a91c4&action=program
//! intent://open?cardData=tok_8f2a91c4&action=program#Intent;scheme=rfaccess;end
//! action=program&cardData=tok_8f2a91c4
//! ```
//!
//! [`resolve`] validates the structure and lays the token out as a card
//! payload. It does no network access and no authorization check; the
//! record store does that when the token is redeemed.

use std::collections::HashMap;
use std::time::SystemTime;

use thiserror::Error;
use url::{form_urlencoded, Url};

use crate::error::ErrorClass;
use crate::payload::{CardPayload, PayloadError};
use crate::profile::CardProfile;
use crate::request::ProgramRequest;

/// The only action this app accepts
pub const PROGRAM_ACTION: &str = "program";

const SCHEMES: [&str; 2] = ["rfaccess", "intent"];
const TARGET: &str = "open";

/// Malformed launch input
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandoffError {
    /// Not a parseable URI
    #[error("malformed launch URI: {0}")]
    Malformed(#[from] url::ParseError),
    /// URI scheme other than `rfaccess://` or `intent://`
    #[error("unsupported URI scheme '{0}'")]
    UnsupportedScheme(String),
    /// URI target other than `open`
    #[error("unsupported launch target '{0}'")]
    UnsupportedTarget(String),
    /// A query segment without `=`
    #[error("malformed query pair '{0}'")]
    MalformedPair(String),
    /// A query pair with an empty key
    #[error("query pair with empty key")]
    EmptyKey,
    /// The same key appears twice
    #[error("duplicate query key '{0}'")]
    DuplicateKey(String),
    /// Invalid percent-escape or non UTF-8 text
    #[error("invalid percent-encoding in '{0}'")]
    BadEscape(String),
    /// No `action` parameter
    #[error("missing action")]
    MissingAction,
    /// `action` is not `program`
    #[error("unsupported action '{0}'")]
    UnsupportedAction(String),
    /// No `cardData` parameter
    #[error("missing cardData")]
    MissingCardData,
    /// `cardData` is present but empty
    #[error("cardData is empty")]
    EmptyCardData,
    /// The token does not fit the card profile
    #[error("card data does not fit the card: {0}")]
    Payload(#[from] PayloadError),
}

impl HandoffError {
    /// Failure class (always [`ErrorClass::InvalidHandoff`])
    pub fn class(&self) -> ErrorClass {
        ErrorClass::InvalidHandoff
    }
}

/// Validated launch parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchParams {
    /// Opaque programming token
    pub card_data: String,
    /// Request id, when the page supplied one
    pub id: Option<String>,
}

/// Parse and validate a launch URI
pub fn parse(uri: &str) -> Result<LaunchParams, HandoffError> {
    let mut params = parse_query(&extract_query(uri.trim())?)?;

    let action = params.remove("action").ok_or(HandoffError::MissingAction)?;
    if action != PROGRAM_ACTION {
        return Err(HandoffError::UnsupportedAction(action));
    }

    let card_data = params.remove("cardData").ok_or(HandoffError::MissingCardData)?;
    if card_data.trim().is_empty() {
        return Err(HandoffError::EmptyCardData);
    }

    let id = params.remove("id").filter(|id| !id.is_empty());
    if !params.is_empty() {
        let mut ignored: Vec<&str> = params.keys().map(String::as_str).collect();
        ignored.sort_unstable();
        log::debug!("Ignoring launch parameters: {}", ignored.join(", "));
    }

    Ok(LaunchParams { card_data, id })
}

/// Resolve a launch URI into a program request for `profile`
///
/// Either returns a complete request or fails; nothing is built from a
/// partially valid URI.
pub fn resolve(uri: &str, profile: &CardProfile) -> Result<ProgramRequest, HandoffError> {
    let params = parse(uri)?;
    let payload = CardPayload::from_token(&params.card_data, profile)?;
    let id = params.id.unwrap_or(params.card_data);

    log::info!("Resolved program request {} ({} blocks)", id, payload.len());
    Ok(ProgramRequest::new(id, payload, SystemTime::now()))
}

/// Find the raw query of a launch URI, or take the input as a bare query
fn extract_query(uri: &str) -> Result<String, HandoffError> {
    let url = match Url::parse(uri) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            return Ok(uri.strip_prefix('?').unwrap_or(uri).to_string());
        }
        Err(e) => return Err(e.into()),
    };

    if !SCHEMES.iter().any(|s| *s == url.scheme()) {
        return Err(HandoffError::UnsupportedScheme(url.scheme().to_string()));
    }

    // intent:// URIs carry "#Intent;...;end" in the fragment
    let host = url.host_str().unwrap_or_default();
    let path = url.path().trim_end_matches('/');
    if !host.eq_ignore_ascii_case(TARGET) || !path.is_empty() {
        return Err(HandoffError::UnsupportedTarget(format!("{}{}", host, path)));
    }
    Ok(url.query().unwrap_or_default().to_string())
}

/// Split `key=value&...` into decoded pairs
fn parse_query(query: &str) -> Result<HashMap<String, String>, HandoffError> {
    let mut params = HashMap::new();
    for segment in query.split('&').filter(|s| !s.is_empty()) {
        if !segment.contains('=') {
            return Err(HandoffError::MalformedPair(segment.to_string()));
        }
        let Some((key, value)) = form_urlencoded::parse(segment.as_bytes()).next() else {
            continue;
        };
        if !escapes_valid(segment) || lost_bytes(segment, &key, &value) {
            return Err(HandoffError::BadEscape(segment.to_string()));
        }
        if key.is_empty() {
            return Err(HandoffError::EmptyKey);
        }
        if params.contains_key(&*key) {
            return Err(HandoffError::DuplicateKey(key.into_owned()));
        }
        params.insert(key.into_owned(), value.into_owned());
    }
    Ok(params)
}

/// Every `%` starts a two-digit hex escape
fn escapes_valid(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes
        .iter()
        .enumerate()
        .filter(|&(_, &b)| b == b'%')
        .all(|(i, _)| {
            bytes
                .get(i + 1..i + 3)
                .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit))
        })
}

/// The decoder replaced non UTF-8 bytes with U+FFFD
fn lost_bytes(segment: &str, key: &str, value: &str) -> bool {
    const REPLACEMENT: char = char::REPLACEMENT_CHARACTER;
    let decoded = key.contains(REPLACEMENT) || value.contains(REPLACEMENT);
    decoded
        && !segment.contains(REPLACEMENT)
        && !segment.to_ascii_uppercase().contains("%EF%BF%BD")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::decode_token;
    use crate::tag::BLOCK_SIZE;

    fn profile() -> CardProfile {
        CardProfile::default()
    }

    #[test]
    fn test_custom_scheme() {
        let request = resolve(
            "rfaccess://open?username=user_from_web&cardData=tok_8f2a91c4&action=program",
            &profile(),
        )
        .unwrap();
        assert_eq!(request.id(), "tok_8f2a91c4");
        assert_eq!(request.payload().len(), 3);

        let blocks: Vec<[u8; BLOCK_SIZE]> = request
            .payload()
            .writes()
            .iter()
            .map(|w| w.image_over(&[]))
            .collect();
        assert_eq!(decode_token(&blocks).unwrap(), "tok_8f2a91c4");
    }

    #[test]
    fn test_intent_and_bare_query() {
        let intent = "intent://open?username=x&cardData=abc%2Fdef&action=program\
                      #Intent;scheme=rfaccess;package=com.example.rfaccess;end";
        assert_eq!(parse(intent).unwrap().card_data, "abc/def");

        let bare = parse("action=program&cardData=a+b&id=req-17").unwrap();
        assert_eq!(bare.card_data, "a b");
        assert_eq!(bare.id.as_deref(), Some("req-17"));

        assert!(parse("?action=program&cardData=t").is_ok());
        assert_eq!(parse("RFACCESS://open/?action=program&cardData=t").unwrap().card_data, "t");
        assert_eq!(parse("action=program&&cardData=%C3%A9").unwrap().card_data, "\u{e9}");
    }

    #[test]
    fn test_missing_card_data_never_builds_request() {
        let inputs = [
            "rfaccess://open?action=program",
            "rfaccess://open?action=program&username=jdoe",
            "action=program&carddata=tok",
            "rfaccess://open?action=program#cardData=tok",
        ];
        for uri in inputs {
            let err = resolve(uri, &profile()).unwrap_err();
            assert_eq!(err, HandoffError::MissingCardData, "{}", uri);
            assert_eq!(err.class(), ErrorClass::InvalidHandoff);
        }
        assert_eq!(
            resolve("action=program&cardData=", &profile()).unwrap_err(),
            HandoffError::EmptyCardData
        );
    }

    #[test]
    fn test_structural_errors() {
        assert_eq!(parse("cardData=t").unwrap_err(), HandoffError::MissingAction);
        assert_eq!(
            parse("action=erase&cardData=t").unwrap_err(),
            HandoffError::UnsupportedAction("erase".into())
        );
        assert!(matches!(parse("action=program&cardData"), Err(HandoffError::MalformedPair(_))));
        assert_eq!(parse("=x&action=program").unwrap_err(), HandoffError::EmptyKey);
        assert!(matches!(
            parse("action=program&cardData=a&cardData=b"),
            Err(HandoffError::DuplicateKey(_))
        ));
        assert!(matches!(parse("action=program&cardData=%zz"), Err(HandoffError::BadEscape(_))));
        assert!(matches!(parse("action=program&cardData=%4"), Err(HandoffError::BadEscape(_))));
        assert!(matches!(parse("action=program&cardData=%+a"), Err(HandoffError::BadEscape(_))));
        assert!(matches!(parse("action=program&cardData=%C3%28"), Err(HandoffError::BadEscape(_))));
        assert!(matches!(
            parse("rfaccess://open:99999?action=program&cardData=t"),
            Err(HandoffError::Malformed(_))
        ));
        assert!(matches!(
            parse("https://open?action=program&cardData=t"),
            Err(HandoffError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            parse("rfaccess://settings?action=program&cardData=t"),
            Err(HandoffError::UnsupportedTarget(_))
        ));
    }

    #[test]
    fn test_token_too_long_for_profile() {
        let uri = format!("action=program&cardData={}", "x".repeat(33));
        assert!(matches!(
            resolve(&uri, &profile()),
            Err(HandoffError::Payload(PayloadError::TokenTooLong { .. }))
        ));
    }
}
