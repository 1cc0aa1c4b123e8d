//! Machine state and status report decoding
//!
//! The firmware reports its state as the first field of a `<State|...>` line;
//! the remaining fields (machine position, work coordinate offset, feed/spindle)
//! are decoded best-effort into a [`StatusReport`].

use serde::{Deserialize, Serialize};

/// Machine state as reported by the firmware's status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineState {
    Idle,
    Run,
    Hold,
    Jog,
    Alarm,
    Door,
    Check,
    Home,
    Sleep,
    /// Any value the firmware emits that isn't one of the known states above,
    /// or the state before the first status report is decoded.
    Unknown,
}

impl MachineState {
    /// Decode the leading state field of a status line, e.g. `"Run"` from `<Run|...>`.
    pub fn parse(field: &str) -> Self {
        match field {
            "Idle" => MachineState::Idle,
            "Run" => MachineState::Run,
            "Hold" => MachineState::Hold,
            "Jog" => MachineState::Jog,
            "Alarm" => MachineState::Alarm,
            "Door" => MachineState::Door,
            "Check" => MachineState::Check,
            "Home" => MachineState::Home,
            "Sleep" => MachineState::Sleep,
            _ => MachineState::Unknown,
        }
    }

    /// True for states a running program should never encounter.
    pub fn is_unexpected_during_stream(&self) -> bool {
        matches!(
            self,
            MachineState::Alarm
                | MachineState::Door
                | MachineState::Check
                | MachineState::Home
                | MachineState::Sleep
                | MachineState::Jog
        )
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MachineState::Idle => "Idle",
            MachineState::Run => "Run",
            MachineState::Hold => "Hold",
            MachineState::Jog => "Jog",
            MachineState::Alarm => "Alarm",
            MachineState::Door => "Door",
            MachineState::Check => "Check",
            MachineState::Home => "Home",
            MachineState::Sleep => "Sleep",
            MachineState::Unknown => "Unknown",
        };
        write!(f, "{name}")
    }
}

/// Machine position in machine coordinates, as reported by `MPos:`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MachinePosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl MachinePosition {
    fn parse(s: &str) -> Option<Self> {
        let coords: Vec<f64> = s.split(',').filter_map(|p| p.trim().parse().ok()).collect();
        if coords.len() < 3 {
            return None;
        }
        Some(Self { x: coords[0], y: coords[1], z: coords[2] })
    }
}

/// Work coordinate offset, as reported by `WCO:`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkCoordinateOffset {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl WorkCoordinateOffset {
    fn parse(s: &str) -> Option<Self> {
        let coords: Vec<f64> = s.split(',').filter_map(|p| p.trim().parse().ok()).collect();
        if coords.len() < 3 {
            return None;
        }
        Some(Self { x: coords[0], y: coords[1], z: coords[2] })
    }
}

/// Feed and heater/spindle duty reported by `FS:`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeedSpindleState {
    pub feed_rate: f64,
    pub spindle_speed: u32,
}

impl FeedSpindleState {
    fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split(',');
        let feed_rate = parts.next()?.trim().parse().ok()?;
        let spindle_speed = parts.next()?.trim().parse().ok()?;
        Some(Self { feed_rate, spindle_speed })
    }
}

/// Everything decoded from a single `<...>` status frame besides the bare state.
///
/// Decoding any individual field is best-effort: a firmware that omits a field
/// on a given poll simply leaves it `None` here.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StatusReport {
    pub mpos: Option<MachinePosition>,
    pub wco: Option<WorkCoordinateOffset>,
    pub feed_spindle: Option<FeedSpindleState>,
}

impl StatusReport {
    /// Parse the supplemental fields of a status line's inner content
    /// (the part between `<` and `>`, with the leading state field already stripped).
    pub fn parse(inner: &str) -> Self {
        let mut report = StatusReport::default();
        for field in inner.split('|') {
            if let Some(rest) = field.strip_prefix("MPos:") {
                report.mpos = MachinePosition::parse(rest);
            } else if let Some(rest) = field.strip_prefix("WCO:") {
                report.wco = WorkCoordinateOffset::parse(rest);
            } else if let Some(rest) = field.strip_prefix("FS:") {
                report.feed_spindle = FeedSpindleState::parse(rest);
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_state_collapses() {
        assert_eq!(MachineState::parse("Sleep"), MachineState::Sleep);
        assert_eq!(MachineState::parse("Bogus"), MachineState::Unknown);
        assert_eq!(MachineState::parse(""), MachineState::Unknown);
    }

    #[test]
    fn unexpected_during_stream() {
        assert!(MachineState::Alarm.is_unexpected_during_stream());
        assert!(!MachineState::Idle.is_unexpected_during_stream());
        assert!(!MachineState::Run.is_unexpected_during_stream());
    }

    #[test]
    fn status_report_parses_supplemental_fields() {
        let report = StatusReport::parse("Run|MPos:1.0,2.0,3.0|FS:500,80|WCO:0,0,0");
        assert_eq!(report.mpos, Some(MachinePosition { x: 1.0, y: 2.0, z: 3.0 }));
        assert_eq!(report.feed_spindle, Some(FeedSpindleState { feed_rate: 500.0, spindle_speed: 80 }));
        assert_eq!(report.wco, Some(WorkCoordinateOffset { x: 0.0, y: 0.0, z: 0.0 }));
    }

    #[test]
    fn status_report_missing_fields_stay_none() {
        let report = StatusReport::parse("Idle");
        assert_eq!(report, StatusReport::default());
    }
}
