use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Structural IR errors, raised by the verifier.
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("function {function} has no blocks"))]
    EmptyFunction { function: String },

    #[snafu(display("block {block} is empty"))]
    EmptyBlock { block: String },

    #[snafu(display("block {block} does not end in a terminator"))]
    MissingTerminator { block: String },

    #[snafu(display("terminator {inst} in the middle of block {block}"))]
    TerminatorInBlockBody { block: String, inst: String },

    #[snafu(display("phi {inst} after non-phi instructions in block {block}"))]
    PhiNotAtBlockStart { block: String, inst: String },

    #[snafu(display("instruction {inst} in block {block} uses detached value {operand}"))]
    DetachedOperand { block: String, inst: String, operand: String },

    #[snafu(display("branch in block {block} targets removed block {target}"))]
    DeadBranchTarget { block: String, target: String },

    #[snafu(display("phi {inst} in block {block}: incoming blocks {incoming:?} != predecessors {preds:?}"))]
    PhiIncomingMismatch { block: String, inst: String, incoming: Vec<String>, preds: Vec<String> },

    #[snafu(display("switch in block {block} has duplicate case value {value}"))]
    DuplicateSwitchCase { block: String, value: i64 },

    #[snafu(display("entry block {block} has predecessors"))]
    EntryHasPredecessors { block: String },

    #[snafu(display("definition of {operand} does not dominate its use {inst} in block {block}"))]
    DefDoesNotDominateUse { block: String, inst: String, operand: String },
}
