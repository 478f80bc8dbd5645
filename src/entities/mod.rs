// Entity Models
//
// Each entity has:
// - A plain value type (what a row and a snapshot hold)
// - A shared instance handle (what a session's identity map hands out)

pub mod account;

pub use account::{Account, AccountRef};
