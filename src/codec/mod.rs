//! HTTP/1.1 wire codec: parse and serialize messages from byte streams
//! with no regular expressions — a small hand-written tokenizer over the
//! header block, plus explicit framing for `Content-Length` and chunked
//! transfer-encoding.

pub mod message;
mod parser;
mod serializer;

pub use message::{Headers, Request, Response};
pub use parser::{read_request, read_response, DEFAULT_HEADER_LIMIT};
pub use serializer::{encode_single_chunk, write_request, write_response};
