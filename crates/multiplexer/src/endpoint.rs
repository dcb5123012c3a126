use shared::protocol::JoinConfig;
use url::Url;

use crate::error::MuxError;

/// Query parameter that identifies the chat channel on the backend.
pub const CHANNEL_QUERY_PARAM: &str = "channel";

pub fn validate_endpoint(raw: &str) -> Result<Url, MuxError> {
    let invalid = |reason: &str| MuxError::InvalidEndpoint {
        endpoint: raw.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(raw.trim()).map_err(|err| invalid(&err.to_string()))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(invalid("scheme must be ws or wss"));
    }
    let has_channel = url
        .query_pairs()
        .any(|(key, value)| key == CHANNEL_QUERY_PARAM && !value.trim().is_empty());
    if !has_channel {
        return Err(invalid("missing channel query parameter"));
    }
    Ok(url)
}

/// Url actually dialed: the joined endpoint plus the member identity.
pub fn connect_url(endpoint: &Url, config: &JoinConfig) -> Url {
    let mut url = endpoint.clone();
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("member_id", config.member_id.as_str());
        if let Some(name) = config.member_name.as_deref() {
            query.append_pair("member_name", name);
        }
    }
    url
}
