use serde::{Deserialize, Serialize};
use std::fmt;

/// Snapshot of the device as last reported on the status channel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Hierarchical dotted identifier, e.g. `strokeEngine.idle`
    pub status: String,
    pub speed: u8,
    pub stroke: u8,
    pub depth: u8,
    pub sensation: u8,
    pub pattern: u32,
}

impl DeviceState {
    /// Numeric value of a field
    pub fn get(&self, field: Field) -> u32 {
        match field {
            Field::Speed => self.speed as u32,
            Field::Stroke => self.stroke as u32,
            Field::Depth => self.depth as u32,
            Field::Sensation => self.sensation as u32,
            Field::Pattern => self.pattern,
        }
    }

    /// Page the status belongs to, if it is a known one
    pub fn page(&self) -> Option<Page> {
        Page::from_status(&self.status)
    }

    /// Lower edge of the current stroke range
    pub fn range_min(&self) -> u8 {
        self.depth.saturating_sub(self.stroke)
    }

    /// Upper edge of the current stroke range
    pub fn range_max(&self) -> u8 {
        self.depth
    }
}

/// Numeric device fields addressable with `set:<field>:<value>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Field {
    Speed,
    Stroke,
    Depth,
    Sensation,
    Pattern,
}

impl Field {
    pub const ALL: [Field; 5] = [
        Field::Speed,
        Field::Stroke,
        Field::Depth,
        Field::Sensation,
        Field::Pattern,
    ];

    /// Name used on the wire and in status payloads
    pub fn wire_name(&self) -> &'static str {
        match self {
            Field::Speed => "speed",
            Field::Stroke => "stroke",
            Field::Depth => "depth",
            Field::Sensation => "sensation",
            Field::Pattern => "pattern",
        }
    }

    /// Percentage fields are bounded to 0..=100, the pattern is an index
    pub fn is_percent(&self) -> bool {
        !matches!(self, Field::Pattern)
    }

    /// Firmware re-adds 1 to stroke/depth/sensation values strictly inside
    /// the range, so those are sent one lower.
    pub fn wire_value(&self, value: u32) -> u32 {
        match self {
            Field::Stroke | Field::Depth | Field::Sensation if value > 0 && value < 100 => {
                value - 1
            }
            _ => value,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Top-level operating mode of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Page {
    Menu,
    SimplePenetration,
    StrokeEngine,
}

impl Page {
    pub const ALL: [Page; 3] = [Page::Menu, Page::SimplePenetration, Page::StrokeEngine];

    pub fn wire_name(&self) -> &'static str {
        match self {
            Page::Menu => "menu",
            Page::SimplePenetration => "simplePenetration",
            Page::StrokeEngine => "strokeEngine",
        }
    }

    pub fn from_wire(name: &str) -> Option<Page> {
        Page::ALL.into_iter().find(|p| p.wire_name() == name)
    }

    /// `strokeEngine.idle` -> `StrokeEngine`
    pub fn from_status(status: &str) -> Option<Page> {
        let root = status.split('.').next().unwrap_or_default();
        Page::from_wire(root)
    }

    /// Whether patterns can run on this page
    pub fn supports_motion(&self) -> bool {
        matches!(self, Page::StrokeEngine)
    }
}

impl fmt::Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Pattern as advertised by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternDescriptor {
    pub name: String,
    pub index: u32,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    StateChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Connected,
    Disconnected,
    StateChanged(DeviceState),
}

impl DeviceEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DeviceEvent::Connected => EventKind::Connected,
            DeviceEvent::Disconnected => EventKind::Disconnected,
            DeviceEvent::StateChanged(_) => EventKind::StateChanged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_value_compensation() {
        for v in 1..100 {
            assert_eq!(Field::Stroke.wire_value(v), v - 1);
            assert_eq!(Field::Depth.wire_value(v), v - 1);
            assert_eq!(Field::Sensation.wire_value(v), v - 1);
            assert_eq!(Field::Speed.wire_value(v), v);
        }
        for v in [0, 100] {
            assert_eq!(Field::Stroke.wire_value(v), v);
            assert_eq!(Field::Depth.wire_value(v), v);
            assert_eq!(Field::Sensation.wire_value(v), v);
        }
        assert_eq!(Field::Pattern.wire_value(42), 42);
    }

    #[test]
    fn test_page_from_status() {
        assert_eq!(Page::from_status("strokeEngine.idle"), Some(Page::StrokeEngine));
        assert_eq!(Page::from_status("menu"), Some(Page::Menu));
        assert_eq!(
            Page::from_status("simplePenetration.preflight"),
            Some(Page::SimplePenetration)
        );
        assert_eq!(Page::from_status("homing.forward"), None);
        assert_eq!(Page::from_status(""), None);
    }

    #[test]
    fn test_range_edges() {
        let state = DeviceState {
            depth: 80,
            stroke: 30,
            ..Default::default()
        };
        assert_eq!(state.range_min(), 50);
        assert_eq!(state.range_max(), 80);
    }
}
