use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum AddrParsingError {
    #[error("invalid address: {0}")]
    AddrSpec(String),
}
