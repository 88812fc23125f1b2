pub mod coordinator;
pub mod store;

pub use coordinator::{Admission, BudgetCoordinator};
pub use store::{BudgetSnapshot, BudgetStore, MemoryBudgetStore, SqliteBudgetStore};
