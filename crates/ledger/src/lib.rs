//! Double-entry ledger domain: accounts, postings, entries and cached balances.
//!
//! Pure domain logic only: no IO, no persistence concerns. The posting engine
//! in `waypost-infra` validates requests here before touching storage.

pub mod account;
pub mod balance;
pub mod entry;
pub mod error;
pub mod event;
pub mod posting;
pub mod tolerance;

pub use account::{Account, AccountStatus, AccountType, OpenAccount};
pub use balance::AccountBalance;
pub use entry::{Direction, EntryLine, LedgerEntry};
pub use error::LedgerError;
pub use event::LedgerEvent;
pub use posting::{LedgerPosting, PostingKey, PostingRequest, reversal_lines};
pub use tolerance::{Tolerance, amendment_delta};
