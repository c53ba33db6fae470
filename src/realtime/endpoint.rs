use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};

use crate::realtime::channel::ChannelError;

/// Derives the realtime websocket URL from the HTTP base endpoint.
///
/// `http` becomes `ws` and `https` becomes `wss`; `path` is appended to any
/// path the base already has, and the access token, when present, is added
/// as the `token_param` query parameter.
pub fn realtime_url(
    base_url: &str,
    path: &str,
    token_param: &str,
    access: Option<&SecretString>,
) -> Result<Url, ChannelError> {
    let base = base_url.trim_end().trim_end_matches('/');
    let mut url = Url::parse(&format!("{base}{path}"))
        .map_err(|err| ChannelError::InvalidEndpoint(format!("{base}{path}: {err}")))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ChannelError::InvalidEndpoint(format!(
                "unsupported scheme {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| ChannelError::InvalidEndpoint(format!("cannot switch scheme to {scheme}")))?;

    if let Some(access) = access {
        url.query_pairs_mut()
            .append_pair(token_param, access.expose_secret());
    }

    Ok(url)
}
