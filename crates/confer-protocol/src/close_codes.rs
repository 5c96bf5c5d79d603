//! WebSocket close codes used by the room coordinator.

/// Normal closure, sent when a user leaves on purpose.
pub const NORMAL: u16 = 1000;

/// Internal error, also used when evicting a timed-out user.
pub const INTERNAL_ERROR: u16 = 1011;

/// The room code did not validate against the lifecycle service.
pub const ROOM_INVALID: u16 = 4004;
