//! Typed views over board, resource and identity records.
//!
//! Reservation sentinels ("nobody", "never", "unknown") exist only at the
//! persistence boundary; inside the kernel they are `Assignee` and `Expiry`.

use std::collections::HashMap;
use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::warn;

use crate::error::{LabError, LabResult, TemplateError};
use crate::store::Record;

pub const ASSIGNED_TO: &str = "AssignedTo";
pub const START_TIME: &str = "start_time";
pub const END_TIME: &str = "end_time";

const NOBODY: &str = "nobody";
const NEVER: &str = "never";
const UNSET: &str = "unknown";

const TIMESTAMP: &[time::format_description::BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

pub fn format_timestamp(t: OffsetDateTime) -> String {
    t.format(TIMESTAMP).unwrap_or_else(|_| UNSET.to_string())
}

/// Parses a persisted timestamp; `None` for the unset sentinels and epoch zero
pub fn parse_timestamp(s: &str) -> Option<OffsetDateTime> {
    let s = s.trim();
    if s.is_empty() || s == "0" || s == UNSET {
        return None;
    }
    let parsed = PrimitiveDateTime::parse(s, TIMESTAMP)
        .map(PrimitiveDateTime::assume_utc)
        .or_else(|_| OffsetDateTime::parse(s, &Rfc3339));
    match parsed {
        Ok(t) if t.unix_timestamp() == 0 => None,
        Ok(t) => Some(t),
        Err(_) => {
            warn!(value = s, "unparsable reservation timestamp");
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignee {
    Nobody,
    User(String),
}

impl Assignee {
    pub fn is(&self, name: &str) -> bool {
        matches!(self, Assignee::User(u) if u == name)
    }
}

impl fmt::Display for Assignee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Assignee::Nobody => f.write_str(NOBODY),
            Assignee::User(u) => f.write_str(u),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Unset,
    Never,
    At(OffsetDateTime),
}

impl Expiry {
    fn to_field(self) -> String {
        match self {
            Expiry::Unset => UNSET.to_string(),
            Expiry::Never => NEVER.to_string(),
            Expiry::At(t) => format_timestamp(t),
        }
    }

    fn from_field(s: &str) -> Self {
        if s.trim() == NEVER {
            return Expiry::Never;
        }
        parse_timestamp(s).map_or(Expiry::Unset, Expiry::At)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    Free,
    Reserved,
    /// Reserved shape with an end time in the past; detected on read, never stored
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub assignee: Assignee,
    pub start: Option<OffsetDateTime>,
    pub end: Expiry,
}

impl Reservation {
    pub fn free() -> Self {
        Self {
            assignee: Assignee::Nobody,
            start: None,
            end: Expiry::Unset,
        }
    }

    pub fn held_by(holder: &str, start: OffsetDateTime, end: Expiry) -> Self {
        Self {
            assignee: Assignee::User(holder.to_string()),
            start: Some(start),
            end,
        }
    }

    pub fn read(record: &Record) -> Self {
        let assignee = match record.get_str(ASSIGNED_TO).map(str::trim) {
            None | Some("") | Some(NOBODY) => Assignee::Nobody,
            Some(user) => Assignee::User(user.to_string()),
        };
        if assignee == Assignee::Nobody {
            return Self::free();
        }
        Self {
            assignee,
            start: record.get_str(START_TIME).and_then(parse_timestamp),
            end: record
                .get_str(END_TIME)
                .map_or(Expiry::Unset, Expiry::from_field),
        }
    }

    pub fn write(&self, record: &mut Record) {
        record.set(ASSIGNED_TO, self.assignee.to_string());
        record.set(
            START_TIME,
            self.start.map_or_else(|| UNSET.to_string(), format_timestamp),
        );
        record.set(END_TIME, self.end.to_field());
    }

    /// A holder with an unreadable end time stays reserved rather than being freed
    pub fn state(&self, now: OffsetDateTime) -> ReservationState {
        match (&self.assignee, self.end) {
            (Assignee::Nobody, _) => ReservationState::Free,
            (Assignee::User(_), Expiry::At(end)) if end <= now => ReservationState::Expired,
            (Assignee::User(_), _) => ReservationState::Reserved,
        }
    }
}

/// Board attributes that reference a resource by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardRole {
    PowerController,
    PowerMeasurement,
    Camera,
    Audio,
    Canbus,
    Serial,
}

impl BoardRole {
    pub fn parse(feature: &str) -> LabResult<Self> {
        match feature.replace('-', "_").as_str() {
            "power_controller" | "power" => Ok(BoardRole::PowerController),
            "power_measurement" => Ok(BoardRole::PowerMeasurement),
            "camera" => Ok(BoardRole::Camera),
            "audio" => Ok(BoardRole::Audio),
            "canbus" => Ok(BoardRole::Canbus),
            "serial" | "serial_endpoints" => Ok(BoardRole::Serial),
            _ => Err(LabError::invalid(
                "feature",
                format!("unknown board feature '{feature}'"),
            )),
        }
    }

    pub fn field(self) -> &'static str {
        match self {
            BoardRole::PowerController => "power_controller",
            BoardRole::PowerMeasurement => "power_measurement",
            BoardRole::Camera => "camera",
            BoardRole::Audio => "audio",
            BoardRole::Canbus => "canbus",
            BoardRole::Serial => "serial_endpoints",
        }
    }
}

impl fmt::Display for BoardRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Board {
    record: Record,
}

impl Board {
    pub fn new(record: Record) -> Self {
        Self { record }
    }

    pub fn name(&self) -> &str {
        self.record.name()
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn into_record(self) -> Record {
        self.record
    }

    pub fn reservation(&self) -> Reservation {
        Reservation::read(&self.record)
    }

    pub fn set_reservation(&mut self, reservation: &Reservation) {
        reservation.write(&mut self.record);
    }

    /// Name of the resource filling `role`; for serial the first endpoint
    /// Resource named for `role`; records may spell the field with dashes
    pub fn role(&self, role: BoardRole) -> Option<String> {
        let field = role.field();
        let mut names = self.record.get_list(field);
        if names.is_empty() {
            names = self.record.get_list(&field.replace('_', "-"));
        }
        names.into_iter().find(|name| !name.is_empty())
    }

    pub fn template(&self, key: &str) -> LabResult<&str> {
        self.record.get_str(key).ok_or_else(|| {
            TemplateError::MissingTemplate {
                owner: format!("board '{}'", self.name()),
                key: key.to_string(),
            }
            .into()
        })
    }

    pub fn attrs(&self) -> HashMap<String, String> {
        let mut attrs = self.record.string_attrs();
        attrs.insert("board".into(), self.name().to_string());
        attrs
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    record: Record,
}

impl Resource {
    pub fn new(record: Record) -> Self {
        Self { record }
    }

    pub fn name(&self) -> &str {
        self.record.name()
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    /// Type tags, e.g. `power-controller`, `serial`, `camera`
    pub fn types(&self) -> Vec<String> {
        self.record.get_list("type")
    }

    pub fn has_type(&self, tag: &str) -> bool {
        let wanted = tag.replace('_', "-");
        self.types().iter().any(|t| t.replace('_', "-") == wanted)
    }

    pub fn template(&self, key: &str) -> LabResult<&str> {
        self.record.get_str(key).ok_or_else(|| {
            TemplateError::MissingTemplate {
                owner: format!("resource '{}'", self.name()),
                key: key.to_string(),
            }
            .into()
        })
    }

    pub fn has_template(&self, key: &str) -> bool {
        self.record.get_str(key).is_some()
    }

    pub fn attrs(&self) -> HashMap<String, String> {
        let mut attrs = self.record.string_attrs();
        attrs.insert("resource".into(), self.name().to_string());
        attrs
    }
}

/// Authenticated caller, resolved once per request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Identity {
    #[default]
    Anonymous,
    User { name: String, admin: bool },
}

impl Identity {
    pub fn user(name: &str) -> Self {
        Identity::User {
            name: name.to_string(),
            admin: false,
        }
    }

    pub fn admin(name: &str) -> Self {
        Identity::User {
            name: name.to_string(),
            admin: true,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Identity::Anonymous => None,
            Identity::User { name, .. } => Some(name),
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Identity::User { admin: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    #[test]
    fn sentinels_map_to_free() {
        let rec = Record::from_json(json!({
            "name": "bbb",
            "AssignedTo": "nobody",
            "start_time": "0",
            "end_time": "unknown"
        }))
        .unwrap();
        assert_eq!(Reservation::read(&rec), Reservation::free());
    }

    #[test]
    fn reservation_round_trips_through_record() {
        let start = datetime!(2024-03-01 12:00:00 UTC);
        let res = Reservation::held_by("alice", start, Expiry::At(start + time::Duration::minutes(30)));
        let mut rec = Record::new("bbb");
        res.write(&mut rec);

        assert_eq!(rec.get_str(ASSIGNED_TO), Some("alice"));
        assert_eq!(rec.get_str(START_TIME), Some("2024-03-01 12:00:00"));
        assert_eq!(rec.get_str(END_TIME), Some("2024-03-01 12:30:00"));
        assert_eq!(Reservation::read(&rec), res);
    }

    #[test]
    fn free_reservation_writes_unset_sentinels() {
        let mut rec = Record::new("bbb");
        Reservation::free().write(&mut rec);
        assert_eq!(rec.get_str(ASSIGNED_TO), Some("nobody"));
        assert_eq!(rec.get_str(START_TIME), Some("unknown"));
        assert_eq!(rec.get_str(END_TIME), Some("unknown"));
    }

    #[test]
    fn state_depends_on_end_time() {
        let now = datetime!(2024-03-01 12:00:00 UTC);
        let past = Reservation::held_by("alice", now, Expiry::At(now - time::Duration::seconds(1)));
        let future = Reservation::held_by("alice", now, Expiry::At(now + time::Duration::hours(1)));
        let never = Reservation::held_by("alice", now, Expiry::Never);

        assert_eq!(past.state(now), ReservationState::Expired);
        assert_eq!(future.state(now), ReservationState::Reserved);
        assert_eq!(never.state(now), ReservationState::Reserved);
        assert_eq!(Reservation::free().state(now), ReservationState::Free);
    }

    #[test]
    fn epoch_zero_is_unset() {
        assert_eq!(parse_timestamp("1970-01-01 00:00:00"), None);
        assert!(parse_timestamp("2024-03-01T12:00:00Z").is_some());
    }

    #[test]
    fn board_roles_and_templates() {
        let board = Board::new(
            Record::new("bbb")
                .with("power_controller", "pdu1")
                .with("serial_endpoints", json!(["serial0", "serial1"]))
                .with("run_cmd", "ssh root@%(ip)s %(command)s"),
        );
        assert_eq!(board.role(BoardRole::PowerController).as_deref(), Some("pdu1"));
        assert_eq!(board.role(BoardRole::Serial).as_deref(), Some("serial0"));
        assert_eq!(board.role(BoardRole::Camera), None);
        assert!(board.template("run_cmd").is_ok());
        let err = board.template("upload_cmd").unwrap_err();
        assert_eq!(err.to_string(), "board 'bbb' has no 'upload_cmd' attribute");
        assert_eq!(board.attrs()["board"], "bbb");
    }

    #[test]
    fn role_fields_may_use_dashes() {
        let board = Board::new(
            Record::new("bbb")
                .with("power-controller", "pdu1")
                .with("serial-endpoints", serde_json::json!(["", "serial0"])),
        );
        assert_eq!(board.role(BoardRole::PowerController).as_deref(), Some("pdu1"));
        assert_eq!(board.role(BoardRole::Serial).as_deref(), Some("serial0"));

        let both = Board::new(
            Record::new("rpi")
                .with("power_controller", "pdu2")
                .with("power-controller", "pdu1"),
        );
        assert_eq!(both.role(BoardRole::PowerController).as_deref(), Some("pdu2"));
        assert_eq!(both.role(BoardRole::Camera), None);
    }

    #[test]
    fn role_names_accept_dashes() {
        assert_eq!(
            BoardRole::parse("power-measurement").unwrap(),
            BoardRole::PowerMeasurement
        );
        assert!(BoardRole::parse("toaster").is_err());
    }

    #[test]
    fn resource_type_tags() {
        let res = Resource::new(Record::new("acme0").with("type", json!(["power-measurement", "serial"])));
        assert!(res.has_type("power_measurement"));
        assert!(res.has_type("serial"));
        assert!(!res.has_type("camera"));
    }
}
