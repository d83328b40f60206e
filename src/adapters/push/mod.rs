pub mod http2;

pub use http2::Http2Transport;
