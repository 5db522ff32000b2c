//! Process exit codes. `main` negates a configuration error's legacy code
//! rather than exiting with it directly, per the CLI's documented
//! "non-zero negated `ARG_*` codes on init failure" convention; these two
//! constants cover the cases that aren't a config error.

pub const OK: i32 = 0;
pub const ERR_USAGE: i32 = 1;
pub const ERR_IOERR: i32 = 74;
