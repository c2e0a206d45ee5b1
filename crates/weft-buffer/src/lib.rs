//! # weft-buffer: byte staging for the connection pipeline
//!
//! Every stage of a connection (raw socket bytes, TLS ciphertext, decrypted
//! plaintext, negotiated application data, formatted output) stages its bytes
//! in a [`ByteBuffer`]:
//!
//! ```text
//!   0        read_pos            write_pos             capacity
//!   |  consumed  |    readable     |      writable        |
//! ```
//!
//! `read_pos <= write_pos <= capacity` holds after every operation. A buffer
//! can be *locked* while a native completion-style operation owns its memory;
//! any mutation while locked is a programming error and panics.
//!
//! [`BufferPool`] recycles buffers across connections.

mod buffer;
mod pool;

pub use buffer::ByteBuffer;
pub use pool::BufferPool;
