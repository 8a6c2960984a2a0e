//! Acting assignments: the overlay that lets a user temporarily approve
//! under another role and location, and the sweep that clears expired ones.

pub mod acting;
pub mod sweeper;

pub use acting::{Acting, ActingRequest, ActingWindow, Employee, RoleAssignment, User};
pub use sweeper::DelegationSweeper;
