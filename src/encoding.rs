//! Wire-format primitives for MQTT 3.1.1: variable byte integers and
//! u16-length-prefixed strings and byte blocks, all over [`bytes::Buf`] /
//! [`bytes::BufMut`].

pub mod binary;
pub mod string;
pub mod variable_byte;

pub use binary::{decode_bytes, encode_bytes};
pub use string::{decode_string, encode_string};
pub use variable_byte::{decode_variable_int, encode_variable_int, variable_int_len};
