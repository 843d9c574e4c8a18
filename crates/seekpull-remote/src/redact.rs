use reqwest::Url;

/// URL safe for logs and errors: credentials dropped, query values masked.
///
/// Registry blob URLs are usually pre-signed; the signature lives in the query.
pub fn redact_url(url: &Url) -> String {
    let mut out = url.clone();
    let _ = out.set_password(None);
    let _ = out.set_username("");
    if out.query().is_some() {
        let keys: Vec<String> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();
        out.query_pairs_mut()
            .clear()
            .extend_pairs(keys.iter().map(|k| (k.as_str(), "REDACTED")));
    }
    out.to_string()
}
