//! AWS Signature Version 4 request signing.
//!
//! SES requests are authenticated with SigV4: a canonical request is
//! hashed, wrapped in a string-to-sign scoped to date/region/service,
//! and signed with a key derived from the secret through a chain of
//! HMAC-SHA256 steps.
//! Reference: https://docs.aws.amazon.com/IAM/latest/UserGuide/create-signed-request.html

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "ses";

/// `20260830T120000Z`
const AMZ_DATE_FORMAT: &[FormatItem<'_>] =
    format_description!("[year][month][day]T[hour][minute][second]Z");

/// `20260830`
const DATE_STAMP_FORMAT: &[FormatItem<'_>] = format_description!("[year][month][day]");

/// Static credentials for signing.
#[derive(Debug, Clone)]
pub struct SigningKey {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
}

/// Headers produced by signing one request.
#[derive(Debug)]
pub struct SignedHeaders {
    /// Value for the `authorization` header.
    pub authorization: String,
    /// Value for the `x-amz-date` header.
    pub amz_date: String,
    /// Value for the `x-amz-content-sha256` header.
    pub content_sha256: String,
}

/// Sign one SES API request at the given instant.
///
/// `host` must match the host header the request is sent with, `path`
/// the URI path, and `body` the exact bytes of the payload (empty for
/// GET requests).
pub fn sign_request(
    key: &SigningKey,
    method: &str,
    host: &str,
    path: &str,
    body: &[u8],
    now: OffsetDateTime,
) -> SignedHeaders {
    // Formatting with these descriptions cannot fail for a valid instant
    let amz_date = now
        .format(AMZ_DATE_FORMAT)
        .unwrap_or_else(|_| String::new());
    let date_stamp = now
        .format(DATE_STAMP_FORMAT)
        .unwrap_or_else(|_| String::new());

    let payload_hash = hex_sha256(body);

    // Canonical headers must be sorted by name; we sign host, the
    // payload hash, and the date.
    let canonical_headers = format!(
        "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
        host, payload_hash, amz_date
    );
    let signed_headers = "host;x-amz-content-sha256;x-amz-date";

    let canonical_request = format!(
        "{}\n{}\n\n{}\n{}\n{}",
        method, path, canonical_headers, signed_headers, payload_hash
    );

    let credential_scope = format!("{}/{}/{}/aws4_request", date_stamp, key.region, SERVICE);

    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    // Key derivation: secret → date → region → service → aws4_request
    let k_date = hmac_sha256(
        format!("AWS4{}", key.secret_access_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, key.region.as_bytes());
    let k_service = hmac_sha256(&k_region, SERVICE.as_bytes());
    let k_signing = hmac_sha256(&k_service, b"aws4_request");

    let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));

    let authorization = format!(
        "{} Credential={}/{}, SignedHeaders={}, Signature={}",
        ALGORITHM, key.access_key_id, credential_scope, signed_headers, signature
    );

    SignedHeaders {
        authorization,
        amz_date,
        content_sha256: payload_hash,
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC-SHA256 accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
