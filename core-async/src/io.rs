//! Async I/O traits used when reading byte ranges out of cached files.

pub use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt, SeekFrom};
