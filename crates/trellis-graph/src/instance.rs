//! Parallel-instance id scheme.
//!
//! A splitter fans out into sibling instances of its downstream node,
//! identified as `<base>_<index>` with a 0-based index. Author-facing node
//! ids may not use this suffix pattern; the compiler rejects them, which
//! keeps `split_instance` unambiguous.

/// Build the id of the `index`-th parallel instance of `base`.
pub fn instance_id(base: &str, index: usize) -> String {
  format!("{base}_{index}")
}

/// Split an id into its base and parallel-instance index, if any.
///
/// `"worker_1"` → `("worker", Some(1))`, `"worker"` → `("worker", None)`.
pub fn split_instance(id: &str) -> (&str, Option<usize>) {
  if let Some(pos) = id.rfind('_') {
    let (base, suffix) = (&id[..pos], &id[pos + 1..]);
    if !base.is_empty() && !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
      if let Ok(index) = suffix.parse::<usize>() {
        return (base, Some(index));
      }
    }
  }
  (id, None)
}

/// The base node id an instance id resolves to. Static ids resolve to
/// themselves.
pub fn base_of(id: &str) -> &str {
  split_instance(id).0
}

/// Whether an author-facing id collides with the reserved instance suffix.
pub fn is_reserved_id(id: &str) -> bool {
  split_instance(id).1.is_some()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn instance_ids_round_trip() {
    let id = instance_id("enrich", 3);
    assert_eq!(id, "enrich_3");
    assert_eq!(split_instance(&id), ("enrich", Some(3)));
  }

  #[test]
  fn static_ids_have_no_index() {
    assert_eq!(split_instance("enrich"), ("enrich", None));
    assert_eq!(base_of("enrich"), "enrich");
  }

  #[test]
  fn non_numeric_suffix_is_not_an_instance() {
    assert_eq!(split_instance("send_email"), ("send_email", None));
    assert_eq!(split_instance("v_2x"), ("v_2x", None));
    assert!(!is_reserved_id("send_email"));
  }

  #[test]
  fn bare_underscore_forms_are_static() {
    assert_eq!(split_instance("_5"), ("_5", None));
    assert_eq!(split_instance("x_"), ("x_", None));
  }

  #[test]
  fn reserved_ids_are_detected() {
    assert!(is_reserved_id("worker_0"));
    assert!(is_reserved_id("worker_12"));
  }
}
