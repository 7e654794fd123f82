//! Standard exit codes for CLI operations
//!
//! Every failure, usage errors included, exits with [`ERROR`].

/// Success - operation completed without errors
pub const SUCCESS: i32 = 0;

/// General error - any failure
pub const ERROR: i32 = 1;
