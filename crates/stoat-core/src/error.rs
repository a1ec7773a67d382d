use crate::shape::Shape;

/// All errors that can occur within Stoat.
///
/// The variants fall into three classes (see [`ErrorKind`]): shape errors
/// (incompatible dimensions), arithmetic errors (division by exact zero),
/// and usage errors (calling the graph API in an unsupported way). Every
/// error is raised synchronously at the offending call; nothing is retried
/// and no partial graph state is left behind.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two shapes cannot be broadcast against each other.
    #[error("shapes {lhs} and {rhs} are not broadcast-compatible")]
    BroadcastMismatch { lhs: Shape, rhs: Shape },

    /// Operation requires a specific rank (number of axes).
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// Axis index out of range for the array's rank.
    #[error("axis out of range: axis {axis} for array with {rank} axes")]
    AxisOutOfRange { axis: usize, rank: usize },

    /// Multi-dimensional index outside the per-axis bounds.
    #[error("index {index:?} out of bounds for shape {shape}")]
    IndexOutOfBounds { index: Vec<usize>, shape: Shape },

    /// Narrow/slice operation out of bounds.
    #[error("narrow out of bounds: axis {axis}, start {start}, len {len}, axis size {axis_size}")]
    NarrowOutOfBounds {
        axis: usize,
        start: usize,
        len: usize,
        axis_size: usize,
    },

    /// Element count mismatch when building an array from a slice.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Cannot reshape because element counts differ.
    #[error(
        "cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements"
    )]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// Matrix multiplication inner-dimension mismatch.
    #[error("matmul shape mismatch: [{m}x{k1}] @ [{k2}x{n}] — inner dims must match")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// `sum_to` target is not reachable by collapsing broadcast axes.
    #[error("cannot sum {src} down to {target}: target is not broadcastable to source")]
    SumToMismatch { src: Shape, target: Shape },

    /// An operation's backward produced a gradient whose shape differs from
    /// the corresponding input.
    #[error("gradient shape {got} does not match input shape {expected}")]
    GradShapeMismatch { expected: Shape, got: Shape },

    /// Division where the denominator contains an exact zero.
    #[error("division by zero")]
    DivisionByZero,

    /// An operation's backward returned the wrong number of gradients.
    #[error("operation with {expected} inputs returned {got} gradients")]
    GradientArityMismatch { expected: usize, got: usize },

    /// backward() was invoked on a Variable that does not track gradients.
    #[error("backward on a variable that does not require gradients")]
    BackwardOnUntracked,

    /// backward() without a seed gradient requires a scalar target.
    #[error("backward without a seed requires a scalar target, got shape {shape}")]
    NonScalarBackward { shape: Shape },

    /// A seed gradient's shape does not match the target Variable.
    #[error("seed gradient shape {got} does not match target shape {expected}")]
    SeedShapeMismatch { expected: Shape, got: Shape },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

/// The three failure classes of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Incompatible dimensions, axes, or element counts.
    Shape,
    /// Numeric failure (division by exact zero).
    Arithmetic,
    /// The graph API was called in an unsupported way.
    Usage,
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Which failure class this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BroadcastMismatch { .. }
            | Error::RankMismatch { .. }
            | Error::AxisOutOfRange { .. }
            | Error::IndexOutOfBounds { .. }
            | Error::NarrowOutOfBounds { .. }
            | Error::ElementCountMismatch { .. }
            | Error::ReshapeElementMismatch { .. }
            | Error::MatmulShapeMismatch { .. }
            | Error::SumToMismatch { .. }
            | Error::GradShapeMismatch { .. } => ErrorKind::Shape,
            Error::DivisionByZero => ErrorKind::Arithmetic,
            Error::GradientArityMismatch { .. }
            | Error::BackwardOnUntracked
            | Error::NonScalarBackward { .. }
            | Error::SeedShapeMismatch { .. }
            | Error::Msg(_) => ErrorKind::Usage,
        }
    }
}

/// Convenience Result type used throughout Stoat.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let e = Error::DivisionByZero;
        assert_eq!(e.kind(), ErrorKind::Arithmetic);

        let e = Error::RankMismatch {
            expected: 4,
            got: 2,
        };
        assert_eq!(e.kind(), ErrorKind::Shape);

        let e = Error::BackwardOnUntracked;
        assert_eq!(e.kind(), ErrorKind::Usage);
    }

    #[test]
    fn test_display() {
        let e = Error::MatmulShapeMismatch {
            m: 2,
            k1: 3,
            k2: 4,
            n: 5,
        };
        assert_eq!(
            format!("{}", e),
            "matmul shape mismatch: [2x3] @ [4x5] — inner dims must match"
        );
    }
}
