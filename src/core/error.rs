use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// 引擎错误。
///
/// 两大类：调用方 bug（越界 / 参数 / 容量 / 协议 / 已释放）与环境失败（I/O）。
/// 只有后者值得重试，见 [`Error::is_environmental`]。
#[derive(Debug, Error)]
pub enum Error {
    #[error("index {index} out of range for length {len}")]
    OutOfRange { index: u64, len: u64 },

    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    #[error("capacity {requested} is lower than the current count {count}")]
    CapacityBelowCount { requested: u64, count: u64 },

    #[error("incomplete {op}: {done} of {requested} bytes at offset {offset}")]
    IncompleteIo {
        op: &'static str,
        offset: u64,
        requested: usize,
        done: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{} parallel sort failure(s): {}", .0.len(), join_messages(.0))]
    SortFailed(Vec<Error>),

    #[error("sort worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("an inner transaction was rolled back, the transaction can't be committed anymore")]
    RollbackRequested,

    #[error("{0} was already disposed")]
    Disposed(&'static str),

    #[error("there is no index named `{0}`")]
    IndexNotFound(String),

    #[error("an index named `{0}` already exists")]
    DuplicateIndex(String),

    #[error("index `{name}` is not a {expected}")]
    IndexTypeMismatch { name: String, expected: &'static str },

    #[error("configuration error: {0}")]
    Config(String),
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }

    /// 环境失败（I/O / 截断）：调用方可以选择重试。
    pub fn is_environmental(&self) -> bool {
        match self {
            Error::Io(_) | Error::IncompleteIo { .. } => true,
            Error::SortFailed(errors) => errors.iter().all(Error::is_environmental),
            _ => false,
        }
    }

    /// 调用方 bug：重试没有意义。
    pub fn is_caller_bug(&self) -> bool {
        matches!(
            self,
            Error::OutOfRange { .. }
                | Error::InvalidArgument { .. }
                | Error::CapacityBelowCount { .. }
                | Error::RollbackRequested
                | Error::Disposed(_)
                | Error::IndexNotFound(_)
                | Error::DuplicateIndex(_)
                | Error::IndexTypeMismatch { .. }
        )
    }
}

/// 边界检查：`0 <= index < len`。
#[inline]
pub(crate) fn check_index(index: u64, len: u64) -> Result<()> {
    if index >= len {
        return Err(Error::OutOfRange { index, len });
    }
    Ok(())
}

/// 区间检查：`start <= len` 且 `start + count <= len`。
pub(crate) fn check_range(start: u64, count: u64, len: u64) -> Result<()> {
    if start > len {
        return Err(Error::OutOfRange { index: start, len });
    }
    match start.checked_add(count) {
        Some(end) if end <= len => Ok(()),
        _ => Err(Error::invalid(
            "count",
            format!("range {start}+{count} exceeds length {len}"),
        )),
    }
}
