use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Store error: {0}")]
    Store(#[from] chiffre_store::StoreError),

    #[error("Protocol error: {0}")]
    Proto(#[from] chiffre_proto::ProtoError),

    #[error("Username already taken")]
    UsernameTaken,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
