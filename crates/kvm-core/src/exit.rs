//! Process exit codes shared by the binaries.

pub const EXIT_SUCCESS: i32 = 0;
/// Runtime failure, including a dead socket multiplexer.
pub const EXIT_FAILURE: i32 = 1;
/// Bad command-line arguments.
pub const EXIT_ARGS: i32 = 2;
/// Unreadable or inconsistent configuration.
pub const EXIT_CONFIG: i32 = 3;
