use thiserror::Error;

/// GPU launch-refusal and execution errors, categorized so callers can
/// tell a bad argument from an exhausted device from a failed launch.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("device memory error: {0}")]
    DeviceMemory(String),

    #[error("kernel compilation failed: {0}")]
    Compilation(String),

    #[error("kernel launch failed: {0}")]
    LaunchFailure(String),

    #[error("CUDA driver error: {0:?}")]
    Driver(#[from] cudarc::driver::DriverError),
}

pub type GpuResult<T> = std::result::Result<T, GpuError>;

/// Host-side preconditions for `kawpow_search`. The kernel itself has
/// no error states; everything is rejected here before a launch.
pub fn validate_search_inputs(header_len: usize, dag_size: u64) -> GpuResult<()> {
    if header_len != kawpow_spec::HEADER_BYTES {
        return Err(GpuError::InvalidArgument(format!(
            "header must be {} bytes, got {header_len}",
            kawpow_spec::HEADER_BYTES
        )));
    }
    if dag_size % kawpow_spec::DAG_ITEM_BYTES as u64 != 0 {
        return Err(GpuError::InvalidArgument(format!(
            "dag size {dag_size} is not a multiple of {}",
            kawpow_spec::DAG_ITEM_BYTES
        )));
    }
    if dag_size < kawpow_spec::PROGPOW_CACHE_BYTES as u64 {
        return Err(GpuError::InvalidArgument(format!(
            "dag size {dag_size} is smaller than the {}-byte hot cache",
            kawpow_spec::PROGPOW_CACHE_BYTES
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_minimal_valid_inputs() {
        assert!(validate_search_inputs(32, 16384).is_ok());
        assert!(validate_search_inputs(32, 1024 * 1024).is_ok());
    }

    #[test]
    fn rejects_bad_header_length() {
        let err = validate_search_inputs(31, 16384).unwrap_err();
        assert!(matches!(err, GpuError::InvalidArgument(_)));
        assert!(err.to_string().contains("header"));
    }

    #[test]
    fn rejects_misaligned_dag() {
        let err = validate_search_inputs(32, 16384 + 63).unwrap_err();
        assert!(matches!(err, GpuError::InvalidArgument(_)));
        assert!(err.to_string().contains("multiple of 64"));
    }

    #[test]
    fn rejects_dag_smaller_than_hot_cache() {
        let err = validate_search_inputs(32, 8192).unwrap_err();
        assert!(matches!(err, GpuError::InvalidArgument(_)));
        assert!(err.to_string().contains("hot cache"));
    }
}
