pub mod buffer;
pub mod consumer;
pub mod decoder;

pub use buffer::LogBuffer;
pub use consumer::LogStreamConsumer;
pub use decoder::FrameDecoder;
