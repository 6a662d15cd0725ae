use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Name of the digest field carried by gateway requests and callbacks.
pub const CHECK_MAC_FIELD: &str = "CheckMacValue";

/// Literal substitutions applied after lowercasing the percent-encoded string.
/// These five pairs are the gateway's documented table and nothing more.
///
/// `~` is handled separately by [`TILDE_ESCAPE`]: it is an extra rule on top of
/// this table. The gateway hashes .NET `HttpUtility.UrlEncode` output, which
/// escapes `~`, while `urlencoding` leaves it bare. Values containing `~`
/// therefore hash differently from a literal reading of the five-pair table.
const GATEWAY_SUBSTITUTIONS: [(&str, &str); 5] = [
    ("%20", "+"),
    ("%21", "!"),
    ("%28", "("),
    ("%29", ")"),
    ("%2a", "*"),
];

/// Applied after [`GATEWAY_SUBSTITUTIONS`]; not part of the documented table.
const TILDE_ESCAPE: (char, &str) = ('~', "%7e");

/// Build the exact string the gateway hashes: digest field removed, keys
/// sorted case-insensitively, wrapped in `HashKey=..&..&HashIV=..`, then
/// percent-encoded and lowercased with the gateway substitutions applied.
pub fn canonical_string<I, K, V>(params: I, hash_key: &str, hash_iv: &str) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut pairs: Vec<(String, String)> = params
        .into_iter()
        .filter(|(k, _)| !k.as_ref().eq_ignore_ascii_case(CHECK_MAC_FIELD))
        .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
        .collect();
    // Ties on the lowercased key fall back to the original key so the order is total.
    pairs.sort_by(|a, b| {
        a.0.to_lowercase()
            .cmp(&b.0.to_lowercase())
            .then_with(|| a.0.cmp(&b.0))
    });

    let joined = pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    let raw = format!("HashKey={hash_key}&{joined}&HashIV={hash_iv}");
    gateway_url_encode(&raw)
}

/// Percent-encode the way the gateway does before hashing.
pub fn gateway_url_encode(raw: &str) -> String {
    let mut encoded = urlencoding::encode(raw).to_lowercase();
    for (from, to) in GATEWAY_SUBSTITUTIONS {
        encoded = encoded.replace(from, to);
    }
    encoded.replace(TILDE_ESCAPE.0, TILDE_ESCAPE.1)
}

/// Compute the CheckMacValue (uppercase hex SHA-256) for a parameter set.
pub fn sign<I, K, V>(params: I, hash_key: &str, hash_iv: &str) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let canonical = canonical_string(params, hash_key, hash_iv);
    hex::encode_upper(Sha256::digest(canonical.as_bytes()))
}

/// Recompute the digest over `params` (supplied digest excluded) and compare it
/// with the supplied `CheckMacValue`. A missing digest never verifies.
pub fn verify<I, K, V>(params: I, hash_key: &str, hash_iv: &str) -> bool
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let pairs: Vec<(K, V)> = params.into_iter().collect();
    let Some(supplied) = pairs
        .iter()
        .find(|(k, _)| k.as_ref().eq_ignore_ascii_case(CHECK_MAC_FIELD))
        .map(|(_, v)| v.as_ref().to_string())
    else {
        return false;
    };
    let expected = sign(pairs, hash_key, hash_iv);
    digests_match(&expected, &supplied)
}

/// Case-insensitive, constant-time digest comparison.
pub fn digests_match(expected: &str, supplied: &str) -> bool {
    let expected = expected.trim().to_ascii_uppercase();
    let supplied = supplied.trim().to_ascii_uppercase();
    expected.as_bytes().ct_eq(supplied.as_bytes()).unwrap_u8() == 1
}

/// Deterministic identifier derived from business keys: `prefix` followed by
/// the first 24 hex chars of SHA-256 over the parts joined with `|`.
pub fn stable_key(prefix: &str, parts: &[&str]) -> String {
    let digest = Sha256::digest(parts.join("|").as_bytes());
    let hex = hex::encode(digest);
    format!("{prefix}{}", &hex[..24])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn canonical_string_matches_gateway_layout() {
        let p = params(&[
            ("TotalAmount", "100"),
            ("MerchantID", "2000132"),
            ("ItemName", "A B"),
        ]);
        assert_eq!(
            canonical_string(&p, "abc", "xyz"),
            "hashkey%3dabc%26itemname%3da+b%26merchantid%3d2000132%26totalamount%3d100%26hashiv%3dxyz"
        );
    }

    #[test]
    fn substitutions_keep_gateway_quirks() {
        assert_eq!(gateway_url_encode("(x)!*~'"), "(x)!*%7e%27");
        assert_eq!(gateway_url_encode("a b"), "a+b");
        assert_eq!(gateway_url_encode("-_."), "-_.");
    }

    #[test]
    fn tilde_is_escaped_inside_values() {
        assert_eq!(gateway_url_encode("a=x~y"), "a%3dx%7ey");
    }

    #[test]
    fn keys_sort_case_insensitively() {
        let p = vec![("b", "2"), ("A", "1"), ("c", "3")];
        assert_eq!(
            canonical_string(p, "k", "i"),
            "hashkey%3dk%26a%3d1%26b%3d2%26c%3d3%26hashiv%3di"
        );
    }

    #[test]
    fn digest_field_is_excluded() {
        let without = params(&[("MerchantID", "1"), ("RtnCode", "1")]);
        let mut with = without.clone();
        with.insert(CHECK_MAC_FIELD.into(), "DEADBEEF".into());
        assert_eq!(sign(&without, "k", "i"), sign(&with, "k", "i"));
    }

    #[test]
    fn sign_is_uppercase_sha256_of_canonical() {
        let p = params(&[("MerchantID", "3002607"), ("TotalAmount", "1200")]);
        let digest = sign(&p, "key", "iv");
        let expected = hex::encode_upper(Sha256::digest(canonical_string(&p, "key", "iv").as_bytes()));
        assert_eq!(digest, expected);
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
    }

    #[test]
    fn verify_accepts_lowercase_digest_and_rejects_missing() {
        let mut p = params(&[("MerchantID", "1"), ("TradeAmt", "50")]);
        assert!(!verify(&p, "k", "i"));
        let digest = sign(&p, "k", "i").to_lowercase();
        p.insert(CHECK_MAC_FIELD.into(), digest);
        assert!(verify(&p, "k", "i"));
        assert!(!verify(&p, "k", "other-iv"));
    }

    #[test]
    fn stable_key_is_deterministic() {
        let a = stable_key("pay_", &["order-1", "2401011200000001"]);
        let b = stable_key("pay_", &["order-1", "2401011200000001"]);
        let c = stable_key("pay_", &["order-1", "2401011200000002"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 4 + 24);
    }
}
