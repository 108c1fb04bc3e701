//! Per-product API helpers.
//!
//! Services wrap the raw client with describe calls that map vendor
//! not-found codes onto [`ProviderError::NotFound`], plus the waiters the
//! resources poll on.

pub mod ecs;
pub mod fc;
pub mod ga;
pub mod log;
pub mod rds;

use std::future::Future;
use std::time::Duration;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::client::ApiError;
use crate::error::ProviderError;
use crate::wait::StateWaiter;

pub use ecs::EcsService;
pub use fc::FcService;
pub use ga::GaService;
pub use log::LogService;
pub use rds::RdsService;

/// Placeholder state reported while an object exists.
pub const AVAILABLE: &str = "Available";

/// What a presence wait is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// The object can be described.
    Exists,
    /// The object is gone.
    Deleted,
}

/// A `NotFound` error for `kind` with `id`.
pub fn not_found(kind: &str, id: &str) -> ProviderError {
    ProviderError::NotFound(format!("{} {} does not exist", kind, id))
}

/// Turn an API error whose code is one of `codes` into `NotFound`.
pub fn map_not_found(err: ApiError, codes: &[&str], kind: &str, id: &str) -> ProviderError {
    if err.is_expected(codes) {
        ProviderError::NotFound(format!("{} {} does not exist: {}", kind, id, err))
    } else {
        err.into()
    }
}

/// Poll `describe` until the object exists or is gone.
///
/// `describe` returning `NotFound` counts as gone; any other error aborts.
pub async fn wait_presence<T, F, Fut>(
    presence: Presence,
    timeout: Duration,
    interval: Duration,
    mut describe: F,
) -> Result<(), ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let waiter = match presence {
        Presence::Exists => StateWaiter::new(&[], &[AVAILABLE], timeout),
        Presence::Deleted => StateWaiter::until_gone(&[AVAILABLE], timeout),
    }
    .with_poll_interval(interval);

    waiter
        .wait(move || {
            let fut = describe();
            async move {
                match fut.await {
                    Ok(object) => Ok(Some((object, AVAILABLE.to_string()))),
                    Err(err) if err.is_not_found() => Ok(None),
                    Err(err) => Err(err),
                }
            }
        })
        .await?;
    Ok(())
}

/// Idempotency token for mutating calls, at most 64 characters.
pub fn client_token(action: &str) -> String {
    format!("TF-{}-{}", action, Uuid::new_v4().simple())
        .chars()
        .take(64)
        .collect()
}

/// Encode ids as the JSON string list some actions take, e.g. `["i-1"]`.
pub fn json_list<S: AsRef<str>>(items: &[S]) -> String {
    let items: Vec<&str> = items.iter().map(AsRef::as_ref).collect();
    serde_json::to_string(&items).unwrap_or_default()
}

/// Take `pointer` out of `value`, or `Null`.
pub fn pointer(value: &Value, pointer: &str) -> Value {
    value.pointer(pointer).cloned().unwrap_or(Value::Null)
}

/// Items of the array at `pointer`, empty when absent.
pub fn items(value: &Value, pointer: &str) -> Vec<Value> {
    value
        .pointer(pointer)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Build an object from `(key, value)` pairs, skipping nulls and empty strings.
pub fn params<const N: usize>(pairs: [(&str, Value); N]) -> Value {
    let mut map = Map::new();
    for (key, value) in pairs {
        let empty = match &value {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            _ => false,
        };
        if !empty {
            map.insert(key.to_string(), value);
        }
    }
    Value::Object(map)
}
