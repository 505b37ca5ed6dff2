//! Key-space layout for the coordination store.
//!
//! Every key lives under `/services/{service}/{category}/{task_id}`, one
//! category per entity in the data model (tasks, queue, claims, interrupt).

pub fn concat_bytes(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(a.len() + b.len());
    result.extend_from_slice(a);
    result.extend_from_slice(b);
    result
}

fn category_prefix(service: &str, category: &str) -> Vec<u8> {
    format!("/services/{service}/{category}/").into_bytes()
}

pub fn tasks_prefix(service: &str) -> Vec<u8> {
    category_prefix(service, "tasks")
}

pub fn queue_prefix(service: &str) -> Vec<u8> {
    category_prefix(service, "queue")
}

pub fn claims_prefix(service: &str) -> Vec<u8> {
    category_prefix(service, "claims")
}

pub fn interrupt_prefix(service: &str) -> Vec<u8> {
    category_prefix(service, "interrupt")
}

pub fn task_key(service: &str, task_id: &str) -> Vec<u8> {
    concat_bytes(&tasks_prefix(service), task_id.as_bytes())
}

pub fn queue_key(service: &str, task_id: &str) -> Vec<u8> {
    concat_bytes(&queue_prefix(service), task_id.as_bytes())
}

pub fn claim_key(service: &str, task_id: &str) -> Vec<u8> {
    concat_bytes(&claims_prefix(service), task_id.as_bytes())
}

pub fn interrupt_key(service: &str, task_id: &str) -> Vec<u8> {
    concat_bytes(&interrupt_prefix(service), task_id.as_bytes())
}

/// Strips a known prefix off a key, returning the task id that remains.
///
/// Panics if `key` does not start with `prefix`; callers only use this on
/// keys already known to come from a scan or watch rooted at `prefix`.
pub fn task_id_from_key<'a>(prefix: &[u8], key: &'a [u8]) -> &'a str {
    std::str::from_utf8(&key[prefix.len()..]).expect("task id was not valid utf8")
}

/// Calculates the first key that would not be part of a prefix, i.e. the
/// exclusive upper bound of a range scan over that prefix.
pub fn key_after_prefix(key: &[u8]) -> Vec<u8> {
    let mut key_bytes = key.to_vec();

    for b in key_bytes.iter_mut().rev() {
        if *b == 255 {
            *b = 0;
        } else {
            *b += 1;
            return key_bytes;
        }
    }

    key_bytes.insert(0, 1);
    key_bytes
}

/// Calculates the next possible key after `key`, for resuming a paginated
/// range scan right after the last key already seen.
pub fn get_increment_key(key: &[u8]) -> Vec<u8> {
    let mut key_bytes = Vec::with_capacity(key.len() + 1);
    key_bytes.extend_from_slice(key);
    key_bytes.push(0);
    key_bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_are_disjoint_and_delimited() {
        assert_eq!(tasks_prefix("vectorizer"), b"/services/vectorizer/tasks/");
        assert_eq!(queue_prefix("vectorizer"), b"/services/vectorizer/queue/");
        assert_ne!(tasks_prefix("vectorizer"), queue_prefix("vectorizer"));
    }

    #[test]
    fn task_key_roundtrips_through_prefix_strip() {
        let prefix = tasks_prefix("vectorizer");
        let key = task_key("vectorizer", "a.jsonl->a.vec");
        assert_eq!(task_id_from_key(&prefix, &key), "a.jsonl->a.vec");
    }

    #[test]
    fn key_after_prefix_wraps_on_0xff() {
        assert_eq!(key_after_prefix(b"ab"), b"ac");
        assert_eq!(key_after_prefix(&[0xffu8]), vec![1u8, 0]);
    }

    #[test]
    fn get_increment_key_appends_nul() {
        assert_eq!(get_increment_key(b"abc"), b"abc\0");
    }
}
