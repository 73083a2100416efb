//! Cross-crate checks for the registration workspace; see `tests/`.
