use callscope_core::types::TRANSACTION_HEADER;
use ferroid::id::ULID;
use tonic::codegen::http::HeaderMap;

/// Returns the caller's transaction id, or mints a new one.
///
/// A value under [`TRANSACTION_HEADER`] is returned verbatim when it is
/// non-empty visible ASCII. Anything else (missing, empty, or not ASCII) is
/// replaced by a freshly generated id.
pub fn extract_transaction_id(headers: &HeaderMap) -> String {
    headers
        .get(TRANSACTION_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map_or_else(mint_transaction_id, str::to_owned)
}

/// Generates a new transaction id: a ULID (48-bit millisecond timestamp and
/// 80 random bits) rendered as 26 Crockford Base32 characters.
///
/// Uniqueness is probabilistic and not checked against previously issued ids.
pub fn mint_transaction_id() -> String {
    ULID::now().to_string()
}
