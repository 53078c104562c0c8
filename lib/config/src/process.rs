//! Process parameters.

/// Maximum length of a process name.
pub const PROC_NAME_LEN: usize = 256;

/// Maximum number of open files per process.
pub const NFILES: usize = 32;
