//! Framed, optionally RC4-encrypted TCP transport over a hand-rolled
//! readiness poller, plus the data structures (paged byte stream, ring
//! buffer, open-hash dictionary, tagged value) that back it.
//!
//! Ported from `gattaca-com-flux`'s `flux-network` crate and rebuilt around
//! `easenet`'s C core (`examples/original_source/`) rather than the
//! teacher's fixed-format, mio-driven stream — see `DESIGN.md` for the
//! module-by-module grounding.

pub mod base64;
pub mod dict;
pub mod framing;
pub mod mem_stream;
pub mod page_pool;
pub mod poll;
pub mod rc4;
pub mod ring_buffer;
pub mod tcp;
pub mod value;

pub use dict::Dict;
pub use mem_stream::MemStream;
pub use page_pool::PagePool;
pub use poll::{Device, Poller};
pub use rc4::Rc4;
pub use ring_buffer::RingBuffer;
pub use tcp::client::Client;
pub use tcp::host::Host;
pub use value::Value;
