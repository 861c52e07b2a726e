//! Per-proc logging context.
//!
//! Each proc thread registers its id once; `proc_log!` prefixes every
//! message with it, so interleaved proc output stays attributable.

use std::cell::Cell;

thread_local! {
    static PROC_ID: Cell<u64> = Cell::new(0);
}

#[inline]
pub fn set_proc_id(id: u64) {
    PROC_ID.with(|r| r.set(id));
}

#[inline]
pub fn proc_id() -> u64 {
    PROC_ID.with(|r| r.get())
}

/// `proc_log!(info, "fmt", args...)` — any `log` level macro name works.
#[macro_export]
macro_rules! proc_log {
    ($lvl:ident, $t:tt $(, $arg:expr)* $(,)?) => (
        log::$lvl!(std::concat!("proc-{}: ", $t), $crate::proc_log::proc_id() $(, $arg)*)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_thread_local() {
        set_proc_id(7);
        assert_eq!(proc_id(), 7);
        let other = std::thread::spawn(proc_id).join().unwrap();
        assert_eq!(other, 0);
    }
}
