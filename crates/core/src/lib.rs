#![forbid(unsafe_code)]

pub mod chunk;
