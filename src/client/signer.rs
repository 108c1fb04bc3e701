//! ACS3-HMAC-SHA256 request signing.
//!
//! Every product is called with the V3 signature: a canonical request built
//! from the method, path, sorted query, the signed headers and the payload
//! hash is hashed, and the hash is signed with the access key secret.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::error::ApiError;

type HmacSha256 = Hmac<Sha256>;

/// Signature algorithm name, also the `Authorization` scheme.
pub const ALGORITHM: &str = "ACS3-HMAC-SHA256";

/// Access credentials used to sign requests.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Access key id.
    pub access_key_id: String,
    /// Access key secret.
    pub access_key_secret: String,
    /// STS token for temporary credentials.
    pub security_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("access_key_secret", &"<redacted>")
            .field(
                "security_token",
                &self.security_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// RFC 3986 percent-encoding (unreserved characters are kept).
pub fn percent_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Query string in canonical form: encoded pairs sorted by key then value.
pub fn canonical_query(query: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (percent_encode(k), percent_encode(v)))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn is_signed_header(name: &str) -> bool {
    name == "host" || name == "content-type" || name.starts_with("x-acs-")
}

/// Build the canonical request, returning it with the signed header list.
///
/// Header names must already be lowercase.
pub fn canonical_request(
    method: &str,
    path: &str,
    query: &[(String, String)],
    headers: &BTreeMap<String, String>,
    payload_hash: &str,
) -> (String, String) {
    let signed: Vec<(&String, &String)> = headers
        .iter()
        .filter(|(name, _)| is_signed_header(name))
        .collect();

    let canonical_headers: String = signed
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value.trim()))
        .collect();
    let signed_headers = signed
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method,
        path,
        canonical_query(query),
        canonical_headers,
        signed_headers,
        payload_hash
    );
    (request, signed_headers)
}

fn hmac_hex(secret: &str, message: &str) -> Result<String, ApiError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ApiError::client("SDK.InvalidCredentials", e.to_string()))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Sign a request in place.
///
/// Adds `x-acs-content-sha256`, the security token header when present, and
/// `authorization`. The caller provides `host`, `x-acs-action`,
/// `x-acs-version`, `x-acs-date` and `x-acs-signature-nonce`.
pub fn sign(
    credentials: &Credentials,
    method: &str,
    path: &str,
    query: &[(String, String)],
    headers: &mut BTreeMap<String, String>,
    body: &[u8],
) -> Result<(), ApiError> {
    let payload_hash = sha256_hex(body);
    headers.insert("x-acs-content-sha256".to_string(), payload_hash.clone());
    if let Some(token) = &credentials.security_token {
        headers.insert("x-acs-security-token".to_string(), token.clone());
    }

    let (request, signed_headers) = canonical_request(method, path, query, headers, &payload_hash);
    let string_to_sign = format!("{}\n{}", ALGORITHM, sha256_hex(request.as_bytes()));
    let signature = hmac_hex(&credentials.access_key_secret, &string_to_sign)?;

    headers.insert(
        "authorization".to_string(),
        format!(
            "{} Credential={},SignedHeaders={},Signature={}",
            ALGORITHM, credentials.access_key_id, signed_headers, signature
        ),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Credentials {
        Credentials {
            access_key_id: "YourAccessKeyId".to_string(),
            access_key_secret: "YourAccessKeySecret".to_string(),
            security_token: None,
        }
    }

    fn base_headers() -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), "ecs.cn-shanghai.aliyuncs.com".to_string());
        headers.insert("x-acs-action".to_string(), "RunInstances".to_string());
        headers.insert("x-acs-version".to_string(), "2014-05-26".to_string());
        headers.insert("x-acs-date".to_string(), "2023-10-26T10:22:32Z".to_string());
        headers.insert(
            "x-acs-signature-nonce".to_string(),
            "3156853299f313e23d1673dc12e1703d".to_string(),
        );
        headers.insert("user-agent".to_string(), "hemmer".to_string());
        headers
    }

    #[test]
    fn test_percent_encode_rfc3986() {
        assert_eq!(percent_encode("a b*c~d"), "a%20b%2Ac~d");
        assert_eq!(percent_encode("SecurityGroupId.1"), "SecurityGroupId.1");
        assert_eq!(percent_encode("k=v&x"), "k%3Dv%26x");
    }

    #[test]
    fn test_canonical_query_sorted() {
        let query = vec![
            ("RegionId".to_string(), "cn-hangzhou".to_string()),
            ("ImageId".to_string(), "win2019_1809_x64_dtc_zh-cn_40G_alibase_20230811.vhd".to_string()),
            ("InstanceName".to_string(), "my ecs".to_string()),
        ];
        assert_eq!(
            canonical_query(&query),
            "ImageId=win2019_1809_x64_dtc_zh-cn_40G_alibase_20230811.vhd&InstanceName=my%20ecs&RegionId=cn-hangzhou"
        );
        assert_eq!(canonical_query(&[]), "");
    }

    #[test]
    fn test_canonical_request_layout() {
        let headers = base_headers();
        let (request, signed) = canonical_request("POST", "/", &[], &headers, &sha256_hex(b""));
        assert_eq!(
            signed,
            "host;x-acs-action;x-acs-date;x-acs-signature-nonce;x-acs-version"
        );
        let lines: Vec<&str> = request.split('\n').collect();
        assert_eq!(lines[0], "POST");
        assert_eq!(lines[1], "/");
        assert_eq!(lines[2], "");
        assert_eq!(lines[3], "host:ecs.cn-shanghai.aliyuncs.com");
        assert!(!request.contains("user-agent"));
        assert_eq!(
            lines.last().copied(),
            Some("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
        );
    }

    #[test]
    fn test_sign_adds_authorization() {
        let mut headers = base_headers();
        sign(&credentials(), "POST", "/", &[], &mut headers, b"").unwrap();

        let auth = headers.get("authorization").unwrap();
        assert!(auth.starts_with(
            "ACS3-HMAC-SHA256 Credential=YourAccessKeyId,SignedHeaders=host;x-acs-action;x-acs-content-sha256;"
        ));
        let signature = auth.rsplit("Signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
        assert!(!headers.contains_key("x-acs-security-token"));
    }

    #[test]
    fn test_sign_is_deterministic_and_key_dependent() {
        let mut first = base_headers();
        let mut second = base_headers();
        sign(&credentials(), "POST", "/", &[], &mut first, b"{}").unwrap();
        sign(&credentials(), "POST", "/", &[], &mut second, b"{}").unwrap();
        assert_eq!(first.get("authorization"), second.get("authorization"));

        let mut other = base_headers();
        let mut creds = credentials();
        creds.access_key_secret = "another".to_string();
        sign(&creds, "POST", "/", &[], &mut other, b"{}").unwrap();
        assert_ne!(first.get("authorization"), other.get("authorization"));
    }

    #[test]
    fn test_security_token_is_signed() {
        let mut headers = base_headers();
        let mut creds = credentials();
        creds.security_token = Some("sts-token".to_string());
        sign(&creds, "GET", "/", &[], &mut headers, b"").unwrap();
        assert_eq!(headers.get("x-acs-security-token").unwrap(), "sts-token");
        assert!(headers
            .get("authorization")
            .unwrap()
            .contains("x-acs-security-token"));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let debug = format!("{:?}", credentials());
        assert!(!debug.contains("YourAccessKeySecret"));
        assert!(debug.contains("<redacted>"));
    }
}
