//! Transaction execution: one owner actor per server-held key, fronted by
//! the executor that routes requests and lands their events in the mailbox.

pub mod executor;
pub mod owner;

pub use executor::Executor;
pub use owner::{WalletOwner, WalletOwnerProps, WalletOwnerServices};
