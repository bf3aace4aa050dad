use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),

    #[error("Key material is empty")]
    EmptyKeyMaterial,

    #[error("Key material is not valid base64 after normalization")]
    InvalidKeyMaterial,
}
