//! Helpers for driving the sync engine against an in-process backend.

mod fake_backend;

pub use fake_backend::FakeBackend;
