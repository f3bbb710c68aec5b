//! Built-in command IDs.
//!
//! Both ends register these first and in this order, so their IDs agree
//! without negotiation. IDs from [`FIRST_DYNAMIC_ID`] upward are assigned by
//! the controller and propagated with `SYNC`.

/// Graceful shutdown, in either direction.
pub const DIE: u32 = 1;

/// Operator-facing text message (`flags:u32` + NUL-terminated text).
pub const MESSAGE: u32 = 2;

/// Registry reconciliation (`cmdnum:u32` + 32-byte name).
pub const SYNC: u32 = 3;

/// First ID handed out to non-built-in commands.
pub const FIRST_DYNAMIC_ID: u32 = 4;

/// Name of a built-in command, if `id` is one.
pub fn builtin_name(id: u32) -> Option<&'static str> {
    match id {
        DIE => Some("DIE"),
        MESSAGE => Some("MESSAGE"),
        SYNC => Some("SYNC"),
        _ => None,
    }
}

/// Returns true if the ID belongs to a built-in command.
pub fn is_builtin(id: u32) -> bool {
    (DIE..FIRST_DYNAMIC_ID).contains(&id)
}
