use chrono::Local;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::Streamer;
use crate::{
    cnc::{
        events::MachineEvent,
        grbl::{
            machine::{DetectedIssue, MachineStatus},
            messages::{CommandResponse, GrblMessage, StatusField},
            parser::{parse_grbl_line, parse_status_report},
            version::GrblVersion,
        },
        overrides::OverrideValues,
        threading::StreamingMode,
    },
    settings,
};

impl Streamer {
    // One line from the firmware, newline already stripped.
    pub fn receive_line(&mut self, line: &str, now: Instant) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match parse_grbl_line(line) {
            GrblMessage::Response(response) => {
                self.emit(MachineEvent::Received(Local::now(), line.to_string()));
                self.on_response(response, now);
            }
            GrblMessage::Status(report) => self.on_status_report(&report, now),
            GrblMessage::Banner(version) => {
                self.emit(MachineEvent::Received(Local::now(), line.to_string()));
                self.on_banner(line, version, now);
            }
            GrblMessage::Unrecognized(text) => {
                self.emit(MachineEvent::Received(Local::now(), text.clone()));
                if let Some(alarm) = text
                    .strip_prefix("ALARM:")
                    .and_then(|code| code.trim().parse::<u64>().ok())
                {
                    warn!("grbl alarm {}: {}", alarm, GrblMessage::get_alarm_text(alarm));
                }
                self.queues.push_message(text);
            }
        }
    }

    fn on_response(&mut self, response: CommandResponse, now: Instant) {
        let Some(acknowledged) = self.scheduler.acknowledge(response) else {
            self.warn_event(format!("unexpected response {:?} with nothing pending", response));
            return;
        };
        let command = acknowledged.command;
        self.update_history_row(acknowledged.slot, |row| row.set_response(response));

        let in_program = self.in_program();
        if in_program && command.repeat_count() == 0 {
            self.projection.job_executed(command.time_offset());
        }
        if let CommandResponse::Error(code) = response {
            if in_program {
                self.projection.job_error();
            }
            let description = code.map_or_else(
                || "unknown error".into(),
                GrblMessage::get_error_text,
            );
            self.warn_event(format!("{:?} rejected: {}", command.text(), description));
            if in_program
                && self.scheduler.mode() == StreamingMode::RepeatOnError
                && self.scheduler.pending_len() == 0
                && command.repeat_count() < 3
            {
                info!("retrying {:?} (attempt {})", command.text(), command.repeat_count() + 2);
                self.scheduler.schedule_retry(command.retry());
            }
        }

        if in_program && self.queues.to_send().is_empty() && self.scheduler.is_drained() {
            self.on_program_end(now);
        }
    }

    fn on_banner(&mut self, line: &str, version: Option<GrblVersion>, now: Instant) {
        match version {
            Some(version) => {
                info!("grbl version {}", version);
                if self.version != Some(version) {
                    self.version = Some(version);
                    if let Err(e) = self.settings.set(settings::LAST_GRBL_VERSION, Some(version)) {
                        warn!("could not store grbl version: {}", e);
                    }
                }
                self.raise_issue_if_running(DetectedIssue::UnexpectedReset);
                self.queues.clear_to_send();
                self.scheduler.clear();
                self.projection.job_end(now);
                self.reset_overrides();
            }
            None => warn!("unparsable banner {:?}", line),
        }
        self.queues.push_message(line);
    }

    fn on_status_report(&mut self, report: &str, now: Instant) {
        self.last_status_report = now;
        let Some(report) = parse_status_report(report, self.version) else {
            self.warn_event(format!("malformed status report <{}>", report));
            return;
        };
        if self.status == MachineStatus::Connecting {
            self.connect_started = None;
        }
        let name = report.state.split(':').next().unwrap_or_default();
        let status = match MachineStatus::from_report(name) {
            Some(MachineStatus::Idle) if self.in_program() => MachineStatus::Run,
            Some(MachineStatus::Hold) if !self.hold_by_user => MachineStatus::Cooling,
            Some(status) => status,
            None => {
                warn!("unknown machine status {:?}", report.state);
                MachineStatus::Unknown
            }
        };
        self.set_status(status, now);

        for field in report.fields {
            match field {
                StatusField::Overrides { feed, rapid, spindle } => {
                    let values = OverrideValues { feed, rapid, spindle };
                    if self.overrides.update_current(values) {
                        self.emit(MachineEvent::OverridesChanged(self.overrides));
                    }
                    for step in self.overrides.next_steps() {
                        self.send_immediate(step.byte());
                    }
                }
                StatusField::Buffer { bytes, .. } => {
                    if self.scheduler.enlarge(bytes) {
                        info!("serial buffer enlarged to {}", self.scheduler.buffer_size());
                    }
                }
                StatusField::WorkPosition(position) => {
                    self.machine_position = &position + &self.work_offset;
                }
                StatusField::MachinePosition(position) => self.machine_position = position,
                StatusField::WorkCoordinateOffset(offset) => {
                    self.projection.set_last_known_wco(&offset);
                    self.work_offset = offset;
                }
                StatusField::FeedSpindle(feed, spindle) => {
                    self.feed = feed;
                    self.spindle = spindle;
                }
                StatusField::Feed(feed) => {
                    self.feed = feed;
                    self.spindle = 0.0;
                }
            }
        }
        debug!("status {:?} at {}", self.status, self.machine_position);
    }

    fn on_program_end(&mut self, now: Instant) {
        let ended = self.projection.job_end(now);
        let elapsed = self.projection.total_job_time(now).as_secs();
        let summary = format!(
            "[{} lines, {} errors, {} min, {} sec]",
            self.projection.target(),
            self.projection.error_count(),
            elapsed / 60,
            elapsed % 60
        );
        info!("program ended {}", summary);
        self.queues.push_message(summary.clone());
        if ended && self.loop_count > 1 && self.status != MachineStatus::Check {
            self.loop_count -= 1;
            self.emit(MachineEvent::LoopCountChanged(self.loop_count));
            self.run_from_start(false, false, true, now);
            self.emit(MachineEvent::ProgramEnded {
                summary,
                restarting: true,
            });
        } else {
            let footer = self.settings.gcode_footer();
            self.execute_sequence(&footer);
            self.emit(MachineEvent::ProgramEnded {
                summary,
                restarting: false,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::super::tests::{connected, load, pump};
    use super::*;
    use crate::cnc::{
        command::CommandStatus,
        grbl::realtime::RealtimeCommand,
        scheduler::HistoryRow,
    };

    #[test]
    fn test_idle_during_job_reads_as_run() {
        let now = Instant::now();
        let mut streamer = connected(now);
        load(&mut streamer, "G1 X1 F100\nG1 X2");
        streamer.run_program(now).unwrap();
        streamer.receive_line("<Idle|MPos:0.000,0.000,0.000|FS:0,0>", now);
        assert_eq!(streamer.status(), MachineStatus::Run);
    }

    #[test]
    fn test_comma_idle_during_job_without_version() {
        let now = Instant::now();
        let mut streamer = Streamer::new(crate::settings::Settings::in_memory(), now);
        streamer.begin_connect(now).unwrap();
        streamer.on_connected(now);
        assert_eq!(streamer.version(), None);
        streamer.receive_line("<Idle,MPos:5.000,4.000,0.000,WPos:4.000,2.000,0.000>", now);
        assert_eq!(streamer.status(), MachineStatus::Idle);
        assert_eq!(streamer.machine_position(), &array![5.0, 4.0, 0.0]);
        assert_eq!(streamer.work_offset(), &array![1.0, 2.0, 0.0]);

        load(&mut streamer, "G1 X1 F100\nG1 X2");
        streamer.run_program(now).unwrap();
        pump(&mut streamer, now);
        streamer.receive_line("<Idle,MPos:5.000,4.000,0.000,WPos:4.000,2.000,0.000>", now);
        assert_eq!(streamer.status(), MachineStatus::Run);
        assert!(streamer.in_program());
    }

    #[test]
    fn test_extra_axes_complete_connect() {
        let now = Instant::now();
        let mut streamer = Streamer::new(crate::settings::Settings::in_memory(), now);
        streamer.begin_connect(now).unwrap();
        streamer.on_connected(now);
        streamer.receive_line("Grbl 1.1f ['$' for help]", now);
        streamer.receive_line("<Idle|MPos:1.000,2.000,3.000,0.000|FS:0,0>", now);
        assert_eq!(streamer.status(), MachineStatus::Idle);
        assert_eq!(streamer.machine_position(), &array![1.0, 2.0, 3.0]);
        streamer.tick(now + std::time::Duration::from_secs(11));
        assert!(!streamer.take_close_request());
    }

    #[test]
    fn test_retry_survives_switch_to_buffered() {
        let now = Instant::now();
        let mut streamer = connected(now);
        streamer.set_streaming_mode(StreamingMode::RepeatOnError).unwrap();
        streamer.settings_mut().set(settings::GCODE_HEADER, "").unwrap();
        load(&mut streamer, "G1 X1 F100\nG1 X2");
        streamer.run_program(now).unwrap();
        assert_eq!(pump(&mut streamer, now), vec!["G1 X1 F100"]);
        streamer.receive_line("error:9", now);
        assert!(streamer.scheduler().retry().is_some());

        streamer.set_streaming_mode(StreamingMode::Buffered).unwrap();
        assert_eq!(pump(&mut streamer, now), vec!["G1 X1 F100", "G1 X2"]);
        streamer.receive_line("ok", now);
        streamer.receive_line("ok", now);
        assert!(!streamer.in_program());
        assert_eq!(streamer.scheduler().used(), 0);
        assert_eq!(streamer.projection().executed(), 2);
    }

    #[test]
    fn test_error_nine_is_retried() {
        let now = Instant::now();
        let mut streamer = connected(now);
        streamer.set_streaming_mode(StreamingMode::RepeatOnError).unwrap();
        streamer.settings_mut().set(settings::GCODE_HEADER, "").unwrap();
        load(&mut streamer, "G1 X1 F100\nG1 X2");
        streamer.run_program(now).unwrap();
        assert_eq!(pump(&mut streamer, now), vec!["G1 X1 F100"]);

        streamer.receive_line("error:9", now);
        assert_eq!(streamer.projection().error_count(), 1);
        assert_eq!(streamer.scheduler().used(), 11);
        assert_eq!(pump(&mut streamer, now), vec!["G1 X1 F100"]);
        assert_eq!(streamer.scheduler().pending().next().unwrap().repeat_count(), 1);

        streamer.receive_line("ok", now);
        // Only the first attempt advances the executed counter.
        assert_eq!(streamer.projection().executed(), 1);
        assert_eq!(pump(&mut streamer, now), vec!["G1 X2"]);
        match &streamer.history()[0] {
            HistoryRow::Command(command) => {
                assert_eq!(command.status(), CommandStatus::ResponseBad);
                assert_eq!(command.response(), Some(CommandResponse::Error(Some(9))));
            }
            row => panic!("unexpected row {:?}", row),
        }
    }

    #[test]
    fn test_retry_gives_up_after_three_repeats() {
        let now = Instant::now();
        let mut streamer = connected(now);
        streamer.set_streaming_mode(StreamingMode::RepeatOnError).unwrap();
        streamer.settings_mut().set(settings::GCODE_HEADER, "").unwrap();
        load(&mut streamer, "G1 X1 F100\nG1 X2");
        streamer.run_program(now).unwrap();
        for _ in 0..4 {
            assert_eq!(pump(&mut streamer, now), vec!["G1 X1 F100"]);
            streamer.receive_line("error:9", now);
        }
        assert!(streamer.scheduler().retry().is_none());
        assert_eq!(pump(&mut streamer, now), vec!["G1 X2"]);
        assert_eq!(streamer.projection().error_count(), 4);
    }

    #[test]
    fn test_ten_line_job_ends_once() {
        let now = Instant::now();
        let mut streamer = connected(now);
        let text = (1..=10).map(|i| format!("G0 X{}", i)).collect::<Vec<_>>().join("\n");
        load(&mut streamer, &text);
        streamer.run_program(now).unwrap();
        assert_eq!(pump(&mut streamer, now).len(), 11);
        streamer.take_events();
        for _ in 0..11 {
            streamer.receive_line("ok", now);
        }
        assert!(!streamer.in_program());
        assert_eq!(streamer.projection().executed(), 10);
        assert_eq!(pump(&mut streamer, now), vec!["G0 X0 Y0 Z0 (move back to origin)"]);
        streamer.receive_line("ok", now);

        let ended: Vec<_> = streamer
            .take_events()
            .into_iter()
            .filter_map(|event| match event {
                MachineEvent::ProgramEnded { summary, restarting } => Some((summary, restarting)),
                _ => None,
            })
            .collect();
        assert_eq!(
            ended,
            vec![("[10 lines, 0 errors, 0 min, 0 sec]".to_string(), false)]
        );
        assert!(pump(&mut streamer, now).is_empty());
    }

    #[test]
    fn test_loop_restarts_with_passes() {
        let now = Instant::now();
        let mut streamer = connected(now);
        load(&mut streamer, "G1 X1 F100");
        streamer.set_loop_count(2);
        streamer.run_program(now).unwrap();
        pump(&mut streamer, now);
        streamer.receive_line("ok", now);
        streamer.receive_line("ok", now);
        assert!(streamer.in_program());
        assert_eq!(streamer.loop_count(), 1);
        assert_eq!(
            pump(&mut streamer, now),
            vec!["G91", "G0 Z-1 (sinks the Z axis)", "G90", "G1 X1 F100"]
        );
        assert!(streamer.take_events().contains(&MachineEvent::LoopCountChanged(1)));
    }

    #[test]
    fn test_banner_mid_job_is_unexpected_reset() {
        let now = Instant::now();
        let mut streamer = connected(now);
        load(&mut streamer, "G1 X1 F100\nG1 X2\nG1 X3");
        streamer.run_program(now).unwrap();
        pump(&mut streamer, now);
        streamer.receive_line("<Run|MPos:0.000,0.000,0.000|Ov:120,100,100>", now);
        streamer.take_events();

        streamer.receive_line("Grbl 1.1h ['$' for help]", now);
        assert!(!streamer.in_program());
        assert_eq!(streamer.projection().last_issue(), DetectedIssue::UnexpectedReset);
        assert_eq!(streamer.scheduler().used(), 0);
        assert_eq!(streamer.overrides().current.feed, 100);
        assert_eq!(streamer.history().len(), 5);
        let events = streamer.take_events();
        assert!(events.contains(&MachineEvent::IssueDetected(DetectedIssue::UnexpectedReset)));
    }

    #[test]
    fn test_banner_versions_persisted() {
        let now = Instant::now();
        let mut streamer = connected(now);
        streamer.receive_line("Grbl v1.1f ['$' for help]", now);
        assert_eq!(streamer.version(), Some(GrblVersion::new(1, 1, Some('f'))));
        assert_eq!(
            streamer.settings().last_grbl_version(),
            Some(GrblVersion::new(1, 1, Some('f')))
        );
        streamer.receive_line("Grbl garbage", now);
        assert_eq!(streamer.version(), Some(GrblVersion::new(1, 1, Some('f'))));
        assert!(matches!(
            streamer.history().last(),
            Some(HistoryRow::Message { text, .. }) if text == "Grbl garbage"
        ));
    }

    #[test]
    fn test_status_fields() {
        let now = Instant::now();
        let mut streamer = connected(now);
        streamer.receive_line("<Idle|WPos:1.000,2.000,3.000|Bf:15,128|WCO:0.000,0.000,0.000|F:500>", now);
        assert_eq!(streamer.machine_position(), &array![1.0, 2.0, 3.0]);
        assert_eq!(streamer.scheduler().buffer_size(), 128);
        streamer.receive_line("<Idle|MPos:5.000,5.000,0.000|WCO:1.000,1.000,0.000|FS:800,300>", now);
        let snapshot = streamer.snapshot(now);
        assert_eq!(snapshot.work_position, array![4.0, 4.0, 0.0]);
        assert_eq!((snapshot.feed, snapshot.spindle), (800.0, 300.0));
    }

    #[test]
    fn test_comma_report_derives_offset() {
        let now = Instant::now();
        let mut streamer = connected(now);
        streamer.receive_line("Grbl 0.9j ['$' for help]", now);
        streamer.receive_line("<Idle,MPos:5.000,5.000,0.000,WPos:1.000,2.000,0.000>", now);
        assert_eq!(streamer.machine_position(), &array![5.0, 5.0, 0.0]);
        assert_eq!(streamer.work_offset(), &array![4.0, 3.0, 0.0]);
    }

    #[test]
    fn test_malformed_report_dropped() {
        let now = Instant::now();
        let mut streamer = connected(now);
        streamer.receive_line("<Idle|MPos:abc>", now);
        assert_eq!(streamer.status(), MachineStatus::Idle);
        assert!(streamer
            .take_events()
            .iter()
            .any(|event| matches!(event, MachineEvent::Warning(..))));
    }

    #[test]
    fn test_hold_without_request_is_cooling() {
        let now = Instant::now();
        let mut streamer = connected(now);
        streamer.receive_line("<Hold:0|MPos:0.000,0.000,0.000>", now);
        assert_eq!(streamer.status(), MachineStatus::Cooling);

        load(&mut streamer, "G1 X1 F100");
        streamer.receive_line("<Idle|MPos:0.000,0.000,0.000>", now);
        streamer.run_program(now).unwrap();
        streamer.receive_line("<Run|MPos:0.000,0.000,0.000>", now);
        streamer.feed_hold(false).unwrap();
        assert_eq!(streamer.take_outbox(), vec![RealtimeCommand::FeedHold.byte()]);
        streamer.receive_line("<Hold:0|MPos:0.000,0.000,0.000>", now);
        assert_eq!(streamer.status(), MachineStatus::Hold);
    }

    #[test]
    fn test_stray_ack_warns() {
        let now = Instant::now();
        let mut streamer = connected(now);
        streamer.receive_line("ok", now);
        assert!(streamer
            .take_events()
            .iter()
            .any(|event| matches!(event, MachineEvent::Warning(..))));
    }
}
