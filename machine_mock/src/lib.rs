mod board;

pub use board::{spawn_board, BoardLog, MockBoard, ReportStyle};
