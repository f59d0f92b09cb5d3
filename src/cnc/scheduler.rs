use std::collections::VecDeque;

use chrono::{DateTime, Local};

use super::{
    command::{Command, CommandStatus},
    grbl::messages::CommandResponse,
    threading::StreamingMode,
};

// Grbl's serial receive buffer, minus one for safety, until the board reports otherwise.
pub const DEFAULT_BUFFER_SIZE: usize = 127;
// Sizes a `Bf:` report may reveal: 1.1 with buffer report, Grbl-Mega, Grbl-LPC.
const BUFFER_TIERS: [usize; 3] = [128, 256, 10240];

#[derive(Debug, Clone, PartialEq)]
pub enum HistoryRow {
    Command(Command),
    Message { time: DateTime<Local>, text: String },
}

// Where a sent command's history row lives, so its ack can update it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistorySlot {
    pub list: u64,
    pub index: usize,
}

/*
    Lines waiting to be sent and the history of what was sent or received. A diagnostic
session swaps in its own pair, so every set carries an id that history slots point
back to.
*/
#[derive(Debug, Clone)]
pub struct Queues {
    id: u64,
    to_send: VecDeque<Command>,
    history: Vec<HistoryRow>,
}

impl Queues {
    pub fn new(id: u64) -> Self {
        Queues {
            id,
            to_send: VecDeque::new(),
            history: Vec::new(),
        }
    }
    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn enqueue(&mut self, command: Command) {
        self.to_send.push_back(command);
    }
    pub fn enqueue_front(&mut self, command: Command) {
        self.to_send.push_front(command);
    }
    pub fn to_send(&self) -> &VecDeque<Command> {
        &self.to_send
    }
    pub fn clear_to_send(&mut self) {
        self.to_send.clear();
    }
    pub fn history(&self) -> &[HistoryRow] {
        &self.history
    }
    pub fn clear_history(&mut self) {
        self.history.clear();
    }
    // Out of range requests are clamped rather than rejected.
    pub fn history_range(&self, start: usize, count: usize) -> Vec<HistoryRow> {
        let start = start.min(self.history.len());
        let end = start.saturating_add(count).min(self.history.len());
        self.history[start..end].to_vec()
    }
    pub fn push_message(&mut self, text: impl Into<String>) {
        self.history.push(HistoryRow::Message {
            time: Local::now(),
            text: text.into(),
        });
    }
    fn push_command(&mut self, command: Command) -> HistorySlot {
        self.history.push(HistoryRow::Command(command));
        HistorySlot {
            list: self.id,
            index: self.history.len() - 1,
        }
    }
    pub fn update_row(&mut self, slot: HistorySlot, update: impl FnOnce(&mut Command)) -> bool {
        if slot.list != self.id {
            return false;
        }
        match self.history.get_mut(slot.index) {
            Some(HistoryRow::Command(command)) => {
                update(command);
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingEntry {
    command: Command,
    slot: HistorySlot,
}

#[derive(Debug, Clone)]
pub struct Acknowledged {
    pub command: Command,
    pub slot: HistorySlot,
}

/*
    Character-counting flow control. `used` is the number of bytes sent but not yet
acknowledged, plus the bytes of the command waiting in the retry slot: a rejected line
keeps its room reserved until it is sent again.
*/
#[derive(Debug, Clone)]
pub struct Scheduler {
    mode: StreamingMode,
    pending: VecDeque<PendingEntry>,
    retry: Option<Command>,
    used: usize,
    buffer_size: usize,
}

impl Scheduler {
    pub fn new(mode: StreamingMode) -> Self {
        Scheduler {
            mode,
            pending: VecDeque::new(),
            retry: None,
            used: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
    pub fn mode(&self) -> StreamingMode {
        self.mode
    }
    pub fn set_mode(&mut self, mode: StreamingMode) {
        self.mode = mode;
    }
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
    pub fn used(&self) -> usize {
        self.used
    }
    pub fn free(&self) -> usize {
        self.buffer_size.saturating_sub(self.used)
    }
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
    pub fn pending(&self) -> impl Iterator<Item = &Command> {
        self.pending.iter().map(|entry| &entry.command)
    }
    pub fn retry(&self) -> Option<&Command> {
        self.retry.as_ref()
    }
    // Nothing in flight and nothing waiting to be resent.
    pub fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.retry.is_none()
    }
    // A new link starts from the conservative buffer size again.
    pub fn on_connect(&mut self) {
        self.clear();
        self.buffer_size = DEFAULT_BUFFER_SIZE;
    }
    // After a reset nothing we sent will be acknowledged.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.retry = None;
        self.used = 0;
    }
    pub fn clear_retry(&mut self) {
        if let Some(command) = self.retry.take() {
            self.used -= command.serial_len();
        }
    }
    /*
        Called with the free byte count of every `Bf:` report. Only the first report on a
    connection can change the size, and only to a known tier.
    */
    pub fn enlarge(&mut self, reported_free: u64) -> bool {
        if self.buffer_size != DEFAULT_BUFFER_SIZE {
            return false;
        }
        match BUFFER_TIERS
            .iter()
            .find(|tier| **tier as u64 == reported_free)
        {
            Some(tier) => {
                self.buffer_size = *tier;
                true
            }
            None => false,
        }
    }

    // The next line to go out and whether it comes from the retry slot.
    fn peek<'a>(&'a self, to_send: &'a VecDeque<Command>) -> Option<(&'a Command, bool)> {
        if self
            .pending
            .front()
            .map_or(false, |entry| entry.command.is_write_eeprom())
        {
            // Grbl ignores the serial buffer while it writes EEPROM.
            return None;
        }
        if self.mode.is_synchronous() && !self.pending.is_empty() {
            return None;
        }
        // A retried line is always the next one in program order, whatever the mode.
        match &self.retry {
            Some(command) => Some((command, true)),
            None => to_send.front().map(|command| (command, false)),
        }
    }
    fn fits(&self, command: &Command, from_retry: bool) -> bool {
        let reserved = if from_retry { command.serial_len() } else { 0 };
        self.used - reserved + command.serial_len() <= self.buffer_size
    }
    pub fn can_send(&self, queues: &Queues) -> bool {
        self.peek(&queues.to_send)
            .map_or(false, |(command, from_retry)| self.fits(command, from_retry))
    }
    /*
        Moves the next line into the pending queue and the history and returns its bytes,
    or None when nothing may be sent right now.
    */
    pub fn send_next(&mut self, queues: &mut Queues) -> Option<Vec<u8>> {
        if !self.can_send(queues) {
            return None;
        }
        let from_retry = self.retry.is_some();
        let mut command = if from_retry {
            self.retry.take()?
        } else {
            let command = queues.to_send.pop_front()?;
            self.used += command.serial_len();
            command
        };
        command.set_status(CommandStatus::Sending);
        let data = command.serial_data();
        let slot = queues.push_command(command.clone());
        self.pending.push_back(PendingEntry { command, slot });
        Some(data)
    }
    // Sent lines have left the building; returns the history rows to update.
    pub fn mark_written(&mut self) -> Vec<HistorySlot> {
        self.pending
            .iter_mut()
            .filter(|entry| entry.command.status() == CommandStatus::Sending)
            .map(|entry| {
                entry.command.set_status(CommandStatus::WaitingResponse);
                entry.slot
            })
            .collect()
    }
    // Acks arrive in send order, so the head of the pending queue is the one answered.
    pub fn acknowledge(&mut self, response: CommandResponse) -> Option<Acknowledged> {
        let PendingEntry { mut command, slot } = self.pending.pop_front()?;
        command.set_response(response);
        self.used -= command.serial_len();
        Some(Acknowledged { command, slot })
    }
    // Puts a copy of a rejected line back, reserving its bytes again.
    pub fn schedule_retry(&mut self, command: Command) {
        self.clear_retry();
        self.used += command.serial_len();
        self.retry = Some(command);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_of(len: usize) -> Command {
        // serial length is text + newline
        Command::new(format!("G1X{}", "1".repeat(len - 4)))
    }

    fn outstanding(scheduler: &Scheduler) -> usize {
        scheduler.pending().map(Command::serial_len).sum::<usize>()
            + scheduler.retry().map_or(0, Command::serial_len)
    }

    #[test]
    fn test_buffered_fills_to_capacity() {
        let mut scheduler = Scheduler::new(StreamingMode::Buffered);
        let mut queues = Queues::new(0);
        for _ in 0..3 {
            queues.enqueue(line_of(50));
        }
        assert_eq!(queues.to_send()[0].serial_len(), 50);
        assert!(scheduler.send_next(&mut queues).is_some());
        assert!(scheduler.send_next(&mut queues).is_some());
        assert!(scheduler.send_next(&mut queues).is_none());
        assert_eq!(scheduler.used(), 100);

        scheduler.acknowledge(CommandResponse::Ok).unwrap();
        assert_eq!(scheduler.used(), 50);
        assert!(scheduler.send_next(&mut queues).is_some());
        assert_eq!(scheduler.used(), 100);
        assert_eq!(scheduler.used(), outstanding(&scheduler));
    }

    #[test]
    fn test_acks_in_send_order() {
        let mut scheduler = Scheduler::new(StreamingMode::Buffered);
        let mut queues = Queues::new(7);
        for text in ["G0 X1", "G0 X2", "G0 X3"] {
            queues.enqueue(Command::new(text));
        }
        while scheduler.send_next(&mut queues).is_some() {}
        let slots = scheduler.mark_written();
        assert_eq!(slots.len(), 3);
        let first = scheduler.acknowledge(CommandResponse::Ok).unwrap();
        let second = scheduler.acknowledge(CommandResponse::Error(Some(20))).unwrap();
        assert_eq!(first.command.text(), "G0 X1");
        assert_eq!(first.slot, HistorySlot { list: 7, index: 0 });
        assert_eq!(second.command.status(), CommandStatus::ResponseBad);
        assert_eq!(scheduler.pending().next().unwrap().status(), CommandStatus::WaitingResponse);
        assert_eq!(scheduler.used(), outstanding(&scheduler));
    }

    #[test]
    fn test_synchronous_waits_for_ack() {
        let mut scheduler = Scheduler::new(StreamingMode::Synchronous);
        let mut queues = Queues::new(0);
        queues.enqueue(Command::new("G0 X1"));
        queues.enqueue(Command::new("G0 X2"));
        assert!(scheduler.send_next(&mut queues).is_some());
        assert!(!scheduler.can_send(&queues));
        scheduler.acknowledge(CommandResponse::Ok);
        assert!(scheduler.can_send(&queues));
    }

    #[test]
    fn test_retry_keeps_bytes_and_goes_first() {
        let mut scheduler = Scheduler::new(StreamingMode::RepeatOnError);
        let mut queues = Queues::new(0);
        queues.enqueue(Command::new("G1 X1"));
        queues.enqueue(Command::new("G1 X2"));
        scheduler.send_next(&mut queues);
        let rejected = scheduler.acknowledge(CommandResponse::Error(Some(9))).unwrap();
        scheduler.schedule_retry(rejected.command.retry());
        assert_eq!(scheduler.used(), 6);
        assert_eq!(scheduler.used(), outstanding(&scheduler));

        assert_eq!(scheduler.send_next(&mut queues), Some(b"G1 X1\n".to_vec()));
        assert_eq!(scheduler.used(), 6);
        assert!(scheduler.retry().is_none());
        assert_eq!(scheduler.pending().next().unwrap().repeat_count(), 1);
        assert_eq!(queues.to_send().len(), 1);
        assert_eq!(scheduler.used(), outstanding(&scheduler));
    }

    #[test]
    fn test_retry_sent_after_switch_to_buffered() {
        let mut scheduler = Scheduler::new(StreamingMode::RepeatOnError);
        let mut queues = Queues::new(0);
        queues.enqueue(Command::new("G1 X1"));
        queues.enqueue(Command::new("G1 X2"));
        scheduler.send_next(&mut queues);
        let rejected = scheduler.acknowledge(CommandResponse::Error(Some(9))).unwrap();
        scheduler.schedule_retry(rejected.command.retry());

        scheduler.set_mode(StreamingMode::Buffered);
        assert_eq!(scheduler.send_next(&mut queues), Some(b"G1 X1\n".to_vec()));
        assert_eq!(scheduler.send_next(&mut queues), Some(b"G1 X2\n".to_vec()));
        assert!(scheduler.retry().is_none());
        assert_eq!(scheduler.used(), 12);
        scheduler.acknowledge(CommandResponse::Ok);
        scheduler.acknowledge(CommandResponse::Ok);
        assert!(scheduler.is_drained());
        assert_eq!(scheduler.used(), 0);
    }

    #[test]
    fn test_eeprom_write_blocks_sending() {
        let mut scheduler = Scheduler::new(StreamingMode::Buffered);
        let mut queues = Queues::new(0);
        queues.enqueue(Command::new("$110=4000"));
        queues.enqueue(Command::new("G0 X1"));
        scheduler.send_next(&mut queues);
        assert!(!scheduler.can_send(&queues));
        scheduler.acknowledge(CommandResponse::Ok);
        assert!(scheduler.can_send(&queues));
    }

    #[test]
    fn test_enlarge_once() {
        let mut scheduler = Scheduler::new(StreamingMode::Buffered);
        assert!(!scheduler.enlarge(100));
        assert_eq!(scheduler.buffer_size(), 127);
        assert!(scheduler.enlarge(256));
        assert_eq!(scheduler.buffer_size(), 256);
        assert!(!scheduler.enlarge(10240));
        assert_eq!(scheduler.buffer_size(), 256);
        scheduler.on_connect();
        assert_eq!(scheduler.buffer_size(), DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn test_history_range_clamped() {
        let mut queues = Queues::new(0);
        for i in 0..5 {
            queues.push_message(format!("line {}", i));
        }
        assert_eq!(queues.history_range(3, 10).len(), 2);
        assert!(queues.history_range(9, 2).is_empty());
        assert!(!queues.update_row(HistorySlot { list: 1, index: 0 }, |_| {}));
    }
}
