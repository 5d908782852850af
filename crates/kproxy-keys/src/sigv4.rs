//! AWS Signature Version 4 for Bedrock requests.
//!
//! Pure computation over the final request bytes; the caller supplies the
//! timestamp so signatures are deterministic under test.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct SigningParams<'a> {
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
    pub region: &'a str,
    /// AWS service name, e.g. `bedrock`.
    pub service: &'a str,
    pub method: &'a str,
    pub host: &'a str,
    /// Already percent-encoded path.
    pub path: &'a str,
    /// Canonical query string ("" when none).
    pub query: &'a str,
    /// Extra headers to include in the signature (content-type, accept, ...).
    pub headers: &'a [(String, String)],
    pub payload: &'a [u8],
    pub timestamp: time::OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    /// Every header to attach, including `host`, `x-amz-date`,
    /// `x-amz-content-sha256` and `authorization`.
    pub headers: Vec<(String, String)>,
}

#[derive(Debug)]
pub enum SignError {
    Time(time::error::Format),
    Mac,
}

impl std::fmt::Display for SignError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignError::Time(err) => write!(f, "sigv4 timestamp format: {err}"),
            SignError::Mac => write!(f, "sigv4 hmac key error"),
        }
    }
}

impl std::error::Error for SignError {}

const AMZ_DATE_FORMAT: &[time::format_description::BorrowedFormatItem<'static>] =
    time::macros::format_description!("[year][month][day]T[hour][minute][second]Z");
const DATE_FORMAT: &[time::format_description::BorrowedFormatItem<'static>] =
    time::macros::format_description!("[year][month][day]");

pub fn sign(params: &SigningParams<'_>) -> Result<SignedHeaders, SignError> {
    let amz_date = params.timestamp.format(&AMZ_DATE_FORMAT).map_err(SignError::Time)?;
    let date = params.timestamp.format(&DATE_FORMAT).map_err(SignError::Time)?;
    let payload_hash = hex(&Sha256::digest(params.payload));

    // Headers that participate in the signature, sorted by lowercase name.
    let mut signed: Vec<(String, String)> = params
        .headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    signed.push(("host".to_string(), params.host.to_string()));
    signed.push(("x-amz-date".to_string(), amz_date.clone()));
    signed.push(("x-amz-content-sha256".to_string(), payload_hash.clone()));
    signed.sort_by(|a, b| a.0.cmp(&b.0));

    let canonical_headers: String = signed
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();
    let signed_header_names: String = signed
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "{method}\n{path}\n{query}\n{canonical_headers}\n{signed_header_names}\n{payload_hash}",
        method = params.method,
        path = params.path,
        query = params.query,
    );

    let scope = format!(
        "{date}/{region}/{service}/aws4_request",
        region = params.region,
        service = params.service,
    );
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{hash}",
        hash = hex(&Sha256::digest(canonical_request.as_bytes())),
    );

    let mut signing_key = hmac(
        format!("AWS4{}", params.secret_access_key).as_bytes(),
        date.as_bytes(),
    )?;
    for part in [params.region, params.service, "aws4_request"] {
        signing_key = hmac(&signing_key, part.as_bytes())?;
    }
    let signature = hex(&hmac(&signing_key, string_to_sign.as_bytes())?);

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={access_key}/{scope}, SignedHeaders={signed_header_names}, Signature={signature}",
        access_key = params.access_key_id,
    );

    let mut headers = signed;
    headers.push(("authorization".to_string(), authorization));
    Ok(SignedHeaders { headers })
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SignError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| SignError::Mac)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn params<'a>(payload: &'a [u8], headers: &'a [(String, String)]) -> SigningParams<'a> {
        SigningParams {
            access_key_id: "AKIDEXAMPLE",
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            region: "us-east-1",
            service: "bedrock",
            method: "POST",
            host: "bedrock-runtime.us-east-1.amazonaws.com",
            path: "/model/anthropic.claude-3-5-sonnet-20240620-v1%3A0/invoke",
            query: "",
            headers,
            payload,
            timestamp: datetime!(2024-06-20 12:00:00 UTC),
        }
    }

    #[test]
    fn signature_is_deterministic() {
        let headers = vec![("content-type".to_string(), "application/json".to_string())];
        let a = sign(&params(b"{}", &headers)).unwrap();
        let b = sign(&params(b"{}", &headers)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn signature_changes_with_payload() {
        let headers = Vec::new();
        let a = sign(&params(b"{}", &headers)).unwrap();
        let b = sign(&params(b"{\"max_tokens\":1}", &headers)).unwrap();
        let auth = |signed: &SignedHeaders| {
            signed
                .headers
                .iter()
                .find(|(name, _)| name == "authorization")
                .map(|(_, value)| value.clone())
                .unwrap()
        };
        assert_ne!(auth(&a), auth(&b));
    }

    #[test]
    fn authorization_header_shape() {
        let headers = vec![("content-type".to_string(), "application/json".to_string())];
        let signed = sign(&params(b"{}", &headers)).unwrap();
        let authorization = signed
            .headers
            .iter()
            .find(|(name, _)| name == "authorization")
            .map(|(_, value)| value.as_str())
            .unwrap();
        assert!(authorization.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240620/us-east-1/bedrock/aws4_request"
        ));
        assert!(authorization.contains(
            "SignedHeaders=content-type;host;x-amz-content-sha256;x-amz-date"
        ));
        let signature = authorization.rsplit("Signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn amz_date_headers_are_attached() {
        let signed = sign(&params(b"{}", &[])).unwrap();
        let date = signed
            .headers
            .iter()
            .find(|(name, _)| name == "x-amz-date")
            .map(|(_, value)| value.as_str())
            .unwrap();
        assert_eq!(date, "20240620T120000Z");
    }
}
