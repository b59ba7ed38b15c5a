use bson::Bson;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::protocol::{self, Reply};

/// Type-erased async handler function
///
/// Takes the raw request payload and always produces a [`Reply`]: decoding
/// and encoding failures become `success: false` replies instead of errors.
///
/// Wrapped in Arc for cheap cloning when spawning tasks.
pub(super) type BoxedHandler =
    Arc<dyn Fn(Bytes) -> Pin<Box<dyn Future<Output = Reply> + Send>> + Send + Sync>;

/// Wrap a typed handler function into a type-erased handler
pub(super) fn wrap_handler<F, Fut, Req, Resp, E>(handler: F) -> BoxedHandler
where
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Resp, E>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    E: Serialize + Send + 'static,
{
    // ---
    let handler = Arc::new(handler);

    Arc::new(move |bytes: Bytes| {
        let handler = handler.clone();
        let fut = Box::pin(async move {
            // ---
            let request: Req = match protocol::decode(&bytes) {
                Ok(request) => request,
                Err(err) => return Reply::failed(Bson::String(err.to_string())),
            };

            match handler(request).await {
                Ok(resp) => match protocol::encode_value(&resp) {
                    Ok(result) => Reply::ok(result),
                    Err(err) => Reply::failed(Bson::String(err.to_string())),
                },
                Err(err) => match protocol::encode_value(&err) {
                    Ok(detail) => Reply::failed(detail),
                    Err(encode_err) => Reply::failed(Bson::String(encode_err.to_string())),
                },
            }
        });

        fut as Pin<Box<dyn Future<Output = Reply> + Send>>
    })
}
