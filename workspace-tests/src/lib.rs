//! Integration tests for the Wiretap workspace live in `tests/`.
