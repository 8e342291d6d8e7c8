use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("entity id is missing the '#' separator")]
    MissingSeparator,
    #[error("entity id has an empty collection segment")]
    EmptyCollection,
    #[error("entity id has an empty external id segment")]
    EmptyExternalId,
    #[error("attribute path is empty")]
    EmptyAttrPath,
}
