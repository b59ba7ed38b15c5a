//! Wire format for requests and replies.
//!
//! Application data travels as a BSON document. Correlation and reply routing
//! live in transport metadata, never inside the payload, so workers written in
//! other languages only need to agree on the `{success, result}` reply shape.
mod codec;
mod message;

pub use codec::{decode, decode_value, encode, encode_value};
pub use message::Reply;
