use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShimError {
    #[error("out of host memory")]
    OutOfHostMemory,

    #[error("device driver error: {0}")]
    Driver(#[from] std::io::Error),

    #[error("memory map failed")]
    MapFailed,
}

// A convenient alias
pub type ShimResult<T> = Result<T, ShimError>;
