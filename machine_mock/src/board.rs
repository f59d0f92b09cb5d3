use std::sync::{Arc, Mutex};

use tokio::{
    io::{duplex, split, AsyncReadExt, AsyncWriteExt, DuplexStream},
    spawn,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStyle {
    // 1.1: <Idle|MPos:...|FS:...>
    Pipe,
    // 0.9: <Idle,MPos:...,WPos:...>
    Comma,
}

/*
    A fake Grbl board: acknowledges every line, answers `?` with a status report,
dumps its settings on `$$` and prints its banner again after a soft reset.
*/
#[derive(Debug, Clone)]
pub struct MockBoard {
    pub banner: String,
    pub report_style: ReportStyle,
    pub settings: Vec<(u32, f64)>,
    // Lines containing the text are answered with the error code instead of ok.
    pub errors: Vec<(String, u64)>,
}

const V11_SETTINGS: &[u32] = &[
    0, 1, 2, 3, 4, 5, 6, 10, 11, 12, 13, 20, 21, 22, 23, 24, 25, 26, 27, 30, 31, 32, 100, 101,
    102, 110, 111, 112, 120, 121, 122, 130, 131, 132,
];

fn default_value(number: u32) -> f64 {
    match number {
        0 => 10.0,
        1 => 25.0,
        100..=102 => 250.0,
        110..=112 => 4000.0,
        120..=122 => 10.0,
        130 => 300.0,
        131 => 200.0,
        _ => 0.0,
    }
}

impl MockBoard {
    pub fn grbl_1_1() -> Self {
        MockBoard {
            banner: "Grbl 1.1h ['$' for help]".to_string(),
            report_style: ReportStyle::Pipe,
            settings: V11_SETTINGS.iter().map(|&n| (n, default_value(n))).collect(),
            errors: Vec::new(),
        }
    }
    pub fn grbl_0_9() -> Self {
        MockBoard {
            banner: "Grbl 0.9j ['$' for help]".to_string(),
            report_style: ReportStyle::Comma,
            settings: V11_SETTINGS
                .iter()
                .filter(|&&n| !(30..=32).contains(&n))
                .map(|&n| (n, default_value(n)))
                .collect(),
            errors: Vec::new(),
        }
    }
    pub fn with_error(mut self, text: impl Into<String>, code: u64) -> Self {
        self.errors.push((text.into(), code));
        self
    }
    pub fn without_settings(mut self, keep: usize) -> Self {
        self.settings.truncate(keep);
        self
    }

    fn status_report(&self, held: bool) -> String {
        let state = if held { "Hold:0" } else { "Idle" };
        match self.report_style {
            ReportStyle::Pipe => format!("<{}|MPos:0.000,0.000,0.000|FS:0,0|WCO:0.000,0.000,0.000>\r\n", state),
            ReportStyle::Comma => format!(
                "<{},MPos:0.000,0.000,0.000,WPos:0.000,0.000,0.000>\r\n",
                if held { "Hold" } else { "Idle" }
            ),
        }
    }

    fn answer(&mut self, line: &str) -> String {
        if let Some((_, code)) = self.errors.iter().find(|(text, _)| line.contains(text.as_str())) {
            return format!("error:{}\r\n", code);
        }
        if line == "$$" {
            let mut out: String = self
                .settings
                .iter()
                .map(|(number, value)| format!("${}={:.3}\r\n", number, value))
                .collect();
            out.push_str("ok\r\n");
            return out;
        }
        if let Some((number, value)) = line
            .strip_prefix('$')
            .and_then(|rest| rest.split_once('='))
            .and_then(|(n, v)| Some((n.parse::<u32>().ok()?, v.parse::<f64>().ok()?)))
        {
            match self.settings.iter_mut().find(|(n, _)| *n == number) {
                Some(setting) => setting.1 = value,
                None => return "error:3\r\n".to_string(),
            }
        }
        "ok\r\n".to_string()
    }
}

// Every line the board received, in order.
#[derive(Debug, Clone, Default)]
pub struct BoardLog(Arc<Mutex<Vec<String>>>);

impl BoardLog {
    pub fn lines(&self) -> Vec<String> {
        match self.0.lock() {
            Ok(lines) => lines.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
    fn push(&self, line: String) {
        match self.0.lock() {
            Ok(mut lines) => lines.push(line),
            Err(poisoned) => poisoned.into_inner().push(line),
        }
    }
}

// Starts the board on a task and returns the host end of the link.
pub fn spawn_board(mut board: MockBoard) -> (DuplexStream, BoardLog) {
    let (host, device) = duplex(4096);
    let log = BoardLog::default();
    let board_log = log.clone();
    spawn(async move {
        let (mut input, mut output) = split(device);
        drop(output.write_all(format!("\r\n{}\r\n", board.banner).as_bytes()).await);
        let mut line = Vec::new();
        let mut held = false;
        loop {
            let value = match input.read_u8().await {
                Ok(value) => value,
                Err(_) => return,
            };
            let reply = match value {
                b'\n' => {
                    let text = String::from_utf8_lossy(&line).trim().to_string();
                    line.clear();
                    let reply = board.answer(&text);
                    board_log.push(text);
                    reply
                }
                b'?' => board.status_report(held),
                b'!' => {
                    held = true;
                    continue;
                }
                b'~' => {
                    held = false;
                    continue;
                }
                0x18 => {
                    line.clear();
                    held = false;
                    format!("\r\n{}\r\n", board.banner)
                }
                b'\r' => continue,
                value if value >= 0x80 => continue,
                value => {
                    line.push(value);
                    continue;
                }
            };
            if output.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    });
    (host, log)
}
