//! Downstream calls for fan-out combination.

use portico_common::{ApiCombination, GatewayError, Result};
use serde_json::{Map, Value};
use std::time::Duration;

/// Budget for the whole fan-out; each worker is cancelled when it
/// expires.
pub(crate) const COMBINE_TIMEOUT: Duration = Duration::from_secs(5);

/// Issue one configured downstream request and decode its JSON body.
///
/// The inbound request body is deliberately not forwarded; a combination
/// downstream is fully described by its config. A body that fails to
/// decode as a JSON object yields `None` so the field is reported as
/// null rather than failing the envelope.
pub(crate) async fn combine_one(
    client: reqwest::Client,
    addr: String,
    cfg: ApiCombination,
) -> Result<Option<Map<String, Value>>> {
    let method = http::Method::from_bytes(cfg.method.to_uppercase().as_bytes())
        .map_err(|_| GatewayError::ConfigInvalid(format!("bad combine method: {}", cfg.method)))?;
    let url = format!("{}{}", addr.trim_end_matches('/'), cfg.path);

    let response = client
        .request(method, &url)
        .send()
        .await
        .map_err(|err| GatewayError::Downstream(err.to_string()))?;
    let body = response
        .bytes()
        .await
        .map_err(|err| GatewayError::Downstream(err.to_string()))?;

    Ok(serde_json::from_slice(&body).ok())
}
