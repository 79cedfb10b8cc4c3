pub mod listen;
pub mod write;

pub use listen::{
    decode_listen_request, encode_listen_request, ListenRequest, ListenStream, WatchStreamListener,
};
pub use write::{
    decode_write_request, encode_write_response, WriteRequest, WriteStream, WriteStreamListener,
};
