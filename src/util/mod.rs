pub mod file_backed_json;
pub mod format_bytes;
pub mod history_broadcast;
