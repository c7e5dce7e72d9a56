//! User persistence.
//!
//! Services talk to [`UserRepository`] and never see which store backs it:
//! PostgreSQL in production, an in-process map for tests and local runs.

mod memory;
pub mod models;
mod operations;
mod repository;

pub use memory::MemoryUserRepository;
pub use models::{NewUser, NewUserHistory, User, UserFilter, UserHistory};
pub use operations::PgUserRepository;
pub use repository::{UserRepository, UserUnitOfWork};
