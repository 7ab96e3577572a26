//! Domain models - door state and the pure logic around it
//!
//! Nothing in here performs I/O or reads the clock implicitly:
//! - `types` - sensor snapshot, door event, device key, ping wire format
//! - `interpreter` - snapshot + previous event -> next event
//! - `notification` - staleness check and push payloads
//! - `snooze` - per-event alert snoozing

pub mod interpreter;
pub mod notification;
pub mod snooze;
pub mod types;

pub use interpreter::next_event;
pub use notification::{is_event_old, DoorNotification, EventDataMessage};
pub use types::{BuildTimestamp, DoorEvent, DoorStateType, SensorReading, SensorSnapshot};
