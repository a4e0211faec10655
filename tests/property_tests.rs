// Property-based test suite
mod property;
