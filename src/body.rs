//! Body types carried through a pipeline.

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};

use crate::BoxError;

/// Request and response body type.
///
/// Responses may have passed through the decompression layer, so their errors
/// are boxed.
pub type Body = http_body_util::combinators::UnsyncBoxBody<Bytes, BoxError>;

/// An empty body.
pub fn empty() -> Body {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// A body containing exactly `data`.
pub fn full(data: impl Into<Bytes>) -> Body {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}
