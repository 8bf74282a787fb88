use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HgalError {
    #[error("GPU resource pool exhausted: {0}")]
    PoolExhausted(&'static str),

    #[error("Handle does not refer to a live {0}")]
    InvalidHandle(&'static str),

    #[error("Swapchain is out of date")]
    SwapchainOutOfDate,

    #[error("Device lost")]
    DeviceLost,

    #[error("Timed out waiting for the {queue} timeline to reach {value}")]
    UploadTimeout { queue: &'static str, value: u64 },

    #[error("Buffer is device local and has no mapped memory")]
    NoMappedPointer,

    #[error("Write of {size} bytes at offset {offset} exceeds buffer size {buffer_size}")]
    BufferOutOfBounds {
        offset: u64,
        size: u64,
        buffer_size: u64,
    },

    #[error("Shader bytecode is malformed: {0}")]
    MalformedShader(String),

    #[error("Bind group index {0} is out of range or has no layout in the shader")]
    NoBindGroupLayout(u32),

    #[error("Bind groups in one set_bind_groups call must share a shader")]
    MismatchedBindGroups,

    #[error("No command buffer is recording on this thread")]
    NoActiveCommandBuffer,

    #[error("Render graph error: {0}")]
    Graph(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Poisoned renderer lock")]
    Poisoned,
}

impl From<hearth_containers::PoolError> for HgalError {
    fn from(err: hearth_containers::PoolError) -> Self {
        match err {
            hearth_containers::PoolError::Exhausted => HgalError::PoolExhausted("resource"),
            hearth_containers::PoolError::InvalidHandle => HgalError::InvalidHandle("resource"),
            hearth_containers::PoolError::Poisoned => HgalError::Poisoned,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for HgalError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        HgalError::Poisoned
    }
}
