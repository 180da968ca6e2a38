use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures of the work-group flattening pass.
///
/// Precondition violations and a failed post-transform verification are
/// fatal to the compilation of the function; the offending function is
/// dumped to the log at error level before the variant is returned.
/// Skipping a function is not an error, see [`crate::Outcome::Unchanged`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("no function named {name} in module"))]
    NoSuchFunction { name: String },

    #[snafu(display("invalid kernel {function}: no exit block"))]
    NoExitBlock { function: String },

    #[snafu(display("malformed kernel {function}: {reason}"))]
    MalformedKernel { function: String, reason: String },

    #[snafu(display("verification failed after flattening {function}: {source}"))]
    VerifierFailed { function: String, source: veld_ir::Error },
}
