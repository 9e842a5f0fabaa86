use thiserror::Error;

#[derive(Debug, Error)]
pub enum SubdefError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Coarse factorization error: {0}")]
    Factorization(String),

    #[error("Solve error: {0}")]
    Solve(String),
}

pub type Result<T> = std::result::Result<T, SubdefError>;
