// src/io/serial/mod.rs
//
// Serial stream framing: raw/delimiter, SLIP and Modbus RTU.

pub mod framer;
mod modbus;

pub use framer::{
    append_modbus_crc, extract_byte_index, frame_all, slip_encode, validate_modbus_crc, ByteIndexConfig,
    FramingMode, SerialFrame, SerialFramer,
};
