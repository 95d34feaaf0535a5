//! Control layer exposing a mapped control block to external tooling.

/// Snapshot and action API over a file-backed region.
pub mod api;
/// Ratatui-based inspection console.
pub mod ui;
