pub mod gateway;
pub mod keys;
pub mod notifier;
pub mod part_plan;
pub mod registrar;
pub mod session_manager;
pub mod session_store;
pub mod sweeper;
