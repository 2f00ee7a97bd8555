//! Workspace root. Integration tests for the foreman crates live in `tests/`.
