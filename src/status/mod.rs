pub mod bambu_status;

use self::bambu_status::{AmsSlot, AmsStatus};

/// Job state as reported in `print.gcode_state`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GcodeState {
    Idle,
    Slicing,
    Prepare,
    Running,
    Pause,
    Finish,
    Failed,
    Offline,
    Unknown(String),
}

impl Default for GcodeState {
    fn default() -> Self {
        GcodeState::Offline
    }
}

impl GcodeState {
    pub fn from_report(s: &str) -> Self {
        match s {
            "IDLE" | "READY" => GcodeState::Idle,
            "SLICING" => GcodeState::Slicing,
            "CREATED" | "PREPARE" => GcodeState::Prepare,
            "RUNNING" => GcodeState::Running,
            "PAUSE" => GcodeState::Pause,
            "FINISH" => GcodeState::Finish,
            "FAILED" => GcodeState::Failed,
            s => GcodeState::Unknown(s.to_string()),
        }
    }

    pub fn description(&self) -> &str {
        match self {
            GcodeState::Idle => "Idle",
            GcodeState::Slicing => "Slicing",
            GcodeState::Prepare => "Preparing",
            GcodeState::Running => "Printing",
            GcodeState::Pause => "Paused",
            GcodeState::Finish => "Finished",
            GcodeState::Failed => "Failed",
            GcodeState::Offline => "Offline",
            GcodeState::Unknown(s) => s.as_str(),
        }
    }

    /// A printer in one of these states will accept a new job
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            GcodeState::Idle | GcodeState::Finish | GcodeState::Failed
        )
    }

    pub fn is_printing(&self) -> bool {
        matches!(
            self,
            GcodeState::Prepare | GcodeState::Running | GcodeState::Pause
        )
    }
}

#[derive(Default, Debug, Clone)]
pub struct GenericPrinterState {
    pub state: GcodeState,
    /// 0.0 - 1.0
    pub progress: f32,
    pub time_remaining: Option<chrono::Duration>,
    pub subtask_name: Option<String>,
    pub ams: Option<AmsStatus>,
    /// the external spool holder, `vt_tray` in reports
    pub external_spool: Option<AmsSlot>,
    /// set once a report carried `ams` or `vt_tray`
    pub filaments_reported: bool,
    pub last_report: Option<chrono::DateTime<chrono::Local>>,
}

impl GenericPrinterState {
    pub fn update(&mut self, update: GenericPrinterStateUpdate) {
        for u in update.0 {
            self._update(u);
        }
        self.last_report = Some(chrono::Local::now());
    }

    fn _update(&mut self, update: PrinterStateUpdate) {
        match update {
            PrinterStateUpdate::State(state) => self.state = state,
            PrinterStateUpdate::Progress(progress) => self.progress = progress,
            PrinterStateUpdate::TimeRemaining(time) => self.time_remaining = Some(time),
            PrinterStateUpdate::SubtaskName(name) => self.subtask_name = Some(name),
            PrinterStateUpdate::Ams(ams) => {
                self.ams = Some(ams);
                self.filaments_reported = true;
            }
            PrinterStateUpdate::ExternalSpool(slot) => {
                self.external_spool = slot;
                self.filaments_reported = true;
            }
        }
    }

    /// `42% 1h 05m` while a job runs
    pub fn progress_text(&self) -> String {
        if !self.state.is_printing() {
            return String::new();
        }
        let percent = format!("{:.0}%", self.progress * 100.0);
        match self.time_remaining {
            Some(t) => format!(
                "{} {}",
                percent,
                crate::project::plate::format_time(t.num_seconds().max(0) as u64)
            ),
            None => percent,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PrinterStateUpdate {
    State(GcodeState),
    Progress(f32),
    TimeRemaining(chrono::Duration),
    SubtaskName(String),
    Ams(AmsStatus),
    ExternalSpool(Option<AmsSlot>),
}

#[derive(Debug, Default, Clone)]
pub struct GenericPrinterStateUpdate(pub Vec<PrinterStateUpdate>);

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("IDLE", GcodeState::Idle, true)]
    #[case("READY", GcodeState::Idle, true)]
    #[case("FINISH", GcodeState::Finish, true)]
    #[case("FAILED", GcodeState::Failed, true)]
    #[case("PREPARE", GcodeState::Prepare, false)]
    #[case("RUNNING", GcodeState::Running, false)]
    #[case("PAUSE", GcodeState::Pause, false)]
    #[case("SLICING", GcodeState::Slicing, false)]
    #[case("WHATEVER", GcodeState::Unknown("WHATEVER".to_string()), false)]
    fn gcode_state_from_report(
        #[case] raw: &str,
        #[case] expected: GcodeState,
        #[case] ready: bool,
    ) {
        let state = GcodeState::from_report(raw);
        assert_eq!(state, expected);
        assert_eq!(state.is_ready(), ready);
    }

    #[test]
    fn default_state_is_offline_and_not_ready() {
        let state = GenericPrinterState::default();
        assert_eq!(state.state, GcodeState::Offline);
        assert!(!state.state.is_ready());
        assert!(state.last_report.is_none());
    }

    #[test]
    fn partial_updates_keep_previous_values() {
        let mut state = GenericPrinterState::default();
        state.update(GenericPrinterStateUpdate(vec![
            PrinterStateUpdate::State(GcodeState::Running),
            PrinterStateUpdate::Progress(0.25),
            PrinterStateUpdate::SubtaskName("cube.3mf".to_string()),
        ]));
        state.update(GenericPrinterStateUpdate(vec![
            PrinterStateUpdate::Progress(0.5),
            PrinterStateUpdate::TimeRemaining(chrono::Duration::minutes(65)),
        ]));

        assert_eq!(state.state, GcodeState::Running);
        assert_eq!(state.subtask_name.as_deref(), Some("cube.3mf"));
        assert_eq!(state.progress_text(), "50% 1h 05m");
        assert!(state.last_report.is_some());
        assert!(!state.filaments_reported);
    }

    #[test]
    fn empty_spool_report_still_counts_as_reported() {
        let mut state = GenericPrinterState::default();
        state.update(GenericPrinterStateUpdate(vec![
            PrinterStateUpdate::ExternalSpool(None),
        ]));
        assert!(state.filaments_reported);
        assert!(state.external_spool.is_none());
        assert!(state.ams.is_none());
    }
}
