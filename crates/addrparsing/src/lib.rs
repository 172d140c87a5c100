mod error;
mod nom_utils;
mod rfc5322_parser;

pub use error::AddrParsingError;
pub type Result<T> = std::result::Result<T, AddrParsingError>;

pub use rfc5322_parser::*;
