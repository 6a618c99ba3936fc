//! AMF0 encoding for RTMP command messages

pub mod amf0;
pub mod value;

pub use amf0::{Amf0Decoder, Amf0Encoder};
pub use value::{AmfValue, Properties};
