//! Captures a stack-carrying description of a panic that happens while
//! running a task's batch transform, so it can be stored verbatim in the
//! task's `error` field (spec §3: "typically a captured stack trace").
//!
//! A worker runs each task's chunk processing on a blocking thread and
//! marks that thread with the task id via [`run_marked`]. If the
//! transform panics, the installed hook records a backtrace against that
//! task id; [`take_captured_panic`] retrieves it once the blocking call
//! returns via a `JoinError`.

use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::PanicInfo;
use std::sync::Mutex;

use lazy_static::lazy_static;

thread_local! {
    static CURRENT_TASK: RefCell<Option<String>> = RefCell::new(None);
}

lazy_static! {
    static ref LAST_PANICS: Mutex<HashMap<String, String>> = Mutex::new(HashMap::new());
}

fn panic_message(info: &PanicInfo<'_>) -> String {
    if let Some(s) = info.payload().downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Installs a panic hook that, in addition to the previous hook,
/// captures a backtrace keyed by whichever task id is currently marked
/// on the panicking thread. Call this once at process startup.
pub fn install_panic_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        CURRENT_TASK.with(|cell| {
            if let Some(task_id) = cell.borrow().clone() {
                let message = panic_message(info);
                let backtrace = Backtrace::force_capture();
                let captured =
                    format!("panic while running task {task_id}: {message}\n{backtrace}");
                LAST_PANICS
                    .lock()
                    .expect("panic map poisoned")
                    .insert(task_id, captured);
            }
        });
        previous(info);
    }));
}

struct ClearOnDrop;

impl Drop for ClearOnDrop {
    fn drop(&mut self) {
        CURRENT_TASK.with(|cell| *cell.borrow_mut() = None);
    }
}

/// Marks `task_id` as executing on the calling (blocking) thread for the
/// duration of `f`, clearing any stale capture from a previous run first.
pub fn run_marked<T>(task_id: &str, f: impl FnOnce() -> T) -> T {
    LAST_PANICS
        .lock()
        .expect("panic map poisoned")
        .remove(task_id);
    CURRENT_TASK.with(|cell| *cell.borrow_mut() = Some(task_id.to_string()));
    let _guard = ClearOnDrop;
    f()
}

/// Retrieves and clears the captured panic description for `task_id`, if
/// the panic hook recorded one.
pub fn take_captured_panic(task_id: &str) -> Option<String> {
    LAST_PANICS
        .lock()
        .expect("panic map poisoned")
        .remove(task_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn ensure_hook_installed() {
        INIT.call_once(install_panic_hook);
    }

    #[test]
    fn captures_panic_message_for_marked_task() {
        ensure_hook_installed();
        let task_id = "capture-test-task";

        let result = std::panic::catch_unwind(|| {
            run_marked(task_id, || {
                panic!("boom");
            })
        });
        assert!(result.is_err());

        let captured = take_captured_panic(task_id).expect("panic should have been captured");
        assert!(captured.contains("boom"));
        assert!(captured.contains(task_id));

        // a second retrieval finds nothing: it was cleared.
        assert!(take_captured_panic(task_id).is_none());
    }

    #[test]
    fn unmarked_panics_are_not_captured() {
        ensure_hook_installed();
        let task_id = "never-marked-task";
        assert!(take_captured_panic(task_id).is_none());
    }
}
