//! Key/value endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Form, Json,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use logkv_core::TypeTag;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct TypeQuery {
    /// `string` (the default) or `int64`.
    #[serde(default, rename = "type")]
    ty: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PutForm {
    #[serde(default)]
    value: String,
}

#[derive(Debug, Serialize)]
pub struct KeyValue {
    key: String,
    value: serde_json::Value,
}

/// The original service answers every client-visible failure - missing
/// key, unknown type, wrong type - with a 400 carrying the error text.
type HandlerError = (StatusCode, String);

fn bad_request(message: impl Into<String>) -> HandlerError {
    (StatusCode::BAD_REQUEST, message.into())
}

fn parse_type(query: &TypeQuery) -> Result<TypeTag, HandlerError> {
    match query.ty.as_deref() {
        None | Some("") | Some("string") => Ok(TypeTag::Str),
        Some("int64") => Ok(TypeTag::Int64),
        Some(_) => Err(bad_request("Unknown data type")),
    }
}

pub async fn get_value(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<TypeQuery>,
) -> Result<Json<KeyValue>, HandlerError> {
    let value = match parse_type(&query)? {
        TypeTag::Str => state
            .db
            .get_string(&key)
            .await
            .map(serde_json::Value::from)
            .map_err(|e| bad_request(e.to_string()))?,
        TypeTag::Int64 => state
            .db
            .get_i64(&key)
            .await
            .map(serde_json::Value::from)
            .map_err(|e| bad_request(e.to_string()))?,
    };

    debug!(%key, "get");
    Ok(Json(KeyValue { key, value }))
}

pub async fn put_value(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<TypeQuery>,
    Form(form): Form<PutForm>,
) -> Result<StatusCode, HandlerError> {
    let ty = parse_type(&query)?;

    if form.value.is_empty() {
        return Err(bad_request("Can't save empty value"));
    }

    match ty {
        TypeTag::Str => state
            .db
            .put_string(&key, form.value)
            .await
            .map_err(|e| bad_request(e.to_string()))?,
        TypeTag::Int64 => {
            let n: i64 = form
                .value
                .parse()
                .map_err(|_| bad_request("Can't convert value to the given type"))?;
            state
                .db
                .put_i64(&key, n)
                .await
                .map_err(|e| bad_request(e.to_string()))?
        }
    }

    debug!(%key, "put");
    Ok(StatusCode::OK)
}

pub async fn health() -> &'static str {
    "OK"
}
