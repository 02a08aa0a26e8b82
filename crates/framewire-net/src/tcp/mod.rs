//! TCP transport: a single framed [`client::Client`] connection, and
//! [`host::Host`], which multiplexes many of them behind one listener.

pub mod client;
pub mod host;
